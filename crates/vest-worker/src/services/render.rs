//! Report renderers.

use serde::{Deserialize, Serialize};
use vest_models::ReportFormat;

use crate::error::{WorkerError, WorkerResult};

/// Tabular report content, independent of output format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub summary: serde_json::Map<String, serde_json::Value>,
}

impl ReportData {
    pub fn new(title: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            title: title.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn push_row(&mut self, row: Vec<serde_json::Value>) {
        self.rows.push(row);
    }

    pub fn with_summary(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.summary.insert(key.to_string(), value.into());
        self
    }
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render `data` in the requested format.
pub fn render(format: ReportFormat, data: &ReportData) -> WorkerResult<Vec<u8>> {
    match format {
        ReportFormat::Json => render_json(data),
        ReportFormat::Csv => Ok(render_csv(data).into_bytes()),
        ReportFormat::Excel => Ok(render_spreadsheet(data).into_bytes()),
        ReportFormat::Pdf => Ok(render_pdf(data)),
    }
}

fn render_json(data: &ReportData) -> WorkerResult<Vec<u8>> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = data
        .rows
        .iter()
        .map(|row| {
            data.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
        .collect();

    let document = serde_json::json!({
        "title": data.title,
        "columns": data.columns,
        "rows": rows,
        "summary": data.summary,
    });
    serde_json::to_vec_pretty(&document)
        .map_err(|e| WorkerError::ResourceExhausted(format!("failed to serialize report: {}", e)))
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn csv_line<'a>(fields: impl Iterator<Item = String> + 'a) -> String {
    fields.map(|f| csv_field(&f)).collect::<Vec<_>>().join(",")
}

/// RFC 4180: CRLF line breaks, fields quoted when they contain a
/// separator, quote or line break.
fn render_csv(data: &ReportData) -> String {
    let mut out = String::new();
    out.push_str(&csv_line(data.columns.iter().cloned()));
    out.push_str("\r\n");
    for row in &data.rows {
        out.push_str(&csv_line(row.iter().map(cell_text)));
        out.push_str("\r\n");
    }
    out
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn sheet_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '?' | '*' | '[' | ']' | ':'))
        .take(31)
        .collect();
    if cleaned.trim().is_empty() {
        "Report".to_string()
    } else {
        cleaned
    }
}

fn spreadsheet_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => {
            format!("<Cell><Data ss:Type=\"Number\">{}</Data></Cell>", n)
        }
        serde_json::Value::Bool(b) => {
            format!("<Cell><Data ss:Type=\"Boolean\">{}</Data></Cell>", u8::from(*b))
        }
        other => format!(
            "<Cell><Data ss:Type=\"String\">{}</Data></Cell>",
            xml_escape(&cell_text(other))
        ),
    }
}

/// SpreadsheetML 2003, readable by Excel and LibreOffice.
fn render_spreadsheet(data: &ReportData) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<?mso-application progid=\"Excel.Sheet\"?>\n");
    out.push_str(
        "<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" \
         xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n",
    );
    out.push_str(&format!(
        "<Worksheet ss:Name=\"{}\">\n<Table>\n",
        xml_escape(&sheet_name(&data.title))
    ));

    out.push_str("<Row>");
    for column in &data.columns {
        out.push_str(&spreadsheet_cell(&serde_json::Value::String(column.clone())));
    }
    out.push_str("</Row>\n");

    for row in &data.rows {
        out.push_str("<Row>");
        for value in row {
            out.push_str(&spreadsheet_cell(value));
        }
        out.push_str("</Row>\n");
    }

    if !data.summary.is_empty() {
        out.push_str("<Row></Row>\n");
        for (key, value) in &data.summary {
            out.push_str("<Row>");
            out.push_str(&spreadsheet_cell(&serde_json::Value::String(key.clone())));
            out.push_str(&spreadsheet_cell(value));
            out.push_str("</Row>\n");
        }
    }

    out.push_str("</Table>\n</Worksheet>\n</Workbook>\n");
    out
}

const PDF_MAX_LINES: usize = 52;

fn pdf_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn pdf_lines(data: &ReportData) -> Vec<String> {
    let mut lines = vec![data.title.clone(), String::new(), data.columns.join(" | ")];
    let room = PDF_MAX_LINES.saturating_sub(lines.len() + data.summary.len() + 2);

    for row in data.rows.iter().take(room) {
        lines.push(row.iter().map(cell_text).collect::<Vec<_>>().join(" | "));
    }
    if data.rows.len() > room {
        lines.push(format!("... {} more rows", data.rows.len() - room));
    }

    if !data.summary.is_empty() {
        lines.push(String::new());
        for (key, value) in &data.summary {
            lines.push(format!("{}: {}", key, cell_text(value)));
        }
    }
    lines
}

/// Single-page text PDF 1.4 using the built-in Helvetica font.
fn render_pdf(data: &ReportData) -> Vec<u8> {
    let mut content = String::from("BT\n/F1 10 Tf\n14 TL\n50 800 Td\n");
    for line in pdf_lines(data) {
        content.push_str(&format!("({}) Tj T*\n", pdf_text(&line)));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] \
         /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
            .to_string(),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        format!(
            "<< /Length {} >>\nstream\n{}endstream",
            content.len(),
            content
        ),
    ];

    let mut out = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.push_str(&format!("{} 0 obj\n{}\nendobj\n", index + 1, body));
    }

    let xref_at = out.len();
    out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for offset in offsets {
        out.push_str(&format!("{:010} 00000 n \n", offset));
    }
    out.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref_at
    ));
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ReportData {
        let mut data = ReportData::new("Distribution History", &["period", "investor", "amount"]);
        data.push_row(vec![json!("2026-Q1"), json!("Doe, Jane"), json!(600.5)]);
        data.push_row(vec![json!("2026-Q1"), json!("He said \"hi\""), json!(399.5)]);
        data.with_summary("total", 1000.0)
    }

    #[test]
    fn test_csv_escaping() {
        let csv = String::from_utf8(render(ReportFormat::Csv, &sample()).unwrap()).unwrap();
        let lines: Vec<&str> = csv.split("\r\n").collect();

        assert_eq!(lines[0], "period,investor,amount");
        assert_eq!(lines[1], "2026-Q1,\"Doe, Jane\",600.5");
        assert_eq!(lines[2], "2026-Q1,\"He said \"\"hi\"\"\",399.5");
    }

    #[test]
    fn test_json_rows_are_keyed_by_column() {
        let bytes = render(ReportFormat::Json, &sample()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(doc["rows"][0]["investor"], "Doe, Jane");
        assert_eq!(doc["summary"]["total"], 1000.0);
    }

    #[test]
    fn test_spreadsheet_types_and_escaping() {
        let mut data = sample();
        data.title = "P&L: 2026/Q1".to_string();
        let xml = String::from_utf8(render(ReportFormat::Excel, &data).unwrap()).unwrap();

        assert!(xml.contains("ss:Name=\"P&amp;L 2026Q1\""));
        assert!(xml.contains("<Data ss:Type=\"Number\">600.5</Data>"));
        assert!(xml.contains("He said &quot;hi&quot;"));
    }

    #[test]
    fn test_pdf_structure() {
        let pdf = render(ReportFormat::Pdf, &sample()).unwrap();
        let text = String::from_utf8_lossy(&pdf);

        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.trim_end().ends_with("%%EOF"));
        assert!(text.contains("(Distribution History) Tj"));

        // startxref must point at the xref table
        let xref_at: usize = text
            .lines()
            .rev()
            .nth(1)
            .and_then(|line| line.parse().ok())
            .unwrap();
        assert!(text[xref_at..].starts_with("xref"));
    }

    #[test]
    fn test_pdf_truncates_long_reports() {
        let mut data = ReportData::new("Long", &["n"]);
        for n in 0..200 {
            data.push_row(vec![json!(n)]);
        }
        let lines = pdf_lines(&data);
        assert!(lines.len() <= PDF_MAX_LINES);
        assert!(lines.last().unwrap().contains("more rows"));
    }
}
