//! Request handlers.

pub mod health;
pub mod queues;

pub use health::*;
pub use queues::*;
