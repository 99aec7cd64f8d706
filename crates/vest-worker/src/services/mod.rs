//! Collaborators used by the job processors.

pub mod investments;
pub mod mail;
pub mod notifier;
pub mod render;
pub mod reports;

pub use investments::{
    DistributionRecord, DistributionRepository, InMemoryInvestments, Investment, InvestmentSeed,
    Property, PropertyRepository, RecordOutcome,
};
pub use mail::{
    EmailTransport, LogTransport, MemoryMailbox, OutgoingEmail, SmtpMailer, TemplateRegistry,
};
pub use notifier::{LogNotifier, MemoryNotifier, Notifier};
pub use render::ReportData;
pub use reports::{ArtifactStore, FsArtifactStore, InvestmentReportSource, ReportDataSource};
