use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DataSourceConfig;

pub const MAX_SHEET_NAME_CHARS: usize = 31;
const PDF_MAX_LINES: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFormat {
    None,
    Pdf,
    Xls,
}

impl RenderFormat {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Pdf),
            2 => Some(Self::Xls),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Pdf => 1,
            Self::Xls => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pdf => "pdf",
            Self::Xls => "xls",
        }
    }

    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pdf => Some("pdf"),
            Self::Xls => Some("xls"),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::None => "application/octet-stream",
            Self::Pdf => "application/pdf",
            Self::Xls => "application/vnd.ms-excel",
        }
    }
}

impl fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum RenderError {
    UnsupportedFormat { format: RenderFormat },
    Serialize(serde_json::Error),
    MalformedSource(serde_json::Error),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFormat { format } => {
                write!(f, "cannot render a result to format '{format}'")
            }
            Self::Serialize(source) => write!(f, "failed to serialize report source: {source}"),
            Self::MalformedSource(source) => {
                write!(f, "stored report source is malformed: {source}")
            }
        }
    }
}

impl std::error::Error for RenderError {}

/// Everything an execution knows when it asks for a report to be filled.
#[derive(Clone, Debug)]
pub struct FillRequest<'a> {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub user_id: u32,
    pub report_name: &'a str,
    pub parameters: &'a BTreeMap<String, String>,
    pub executed_at: DateTime<Utc>,
}

/// Produces the stored source of an execution and renders it on demand.
///
/// `render` must be a pure function of `source` and `format`: rendering the
/// same stored source twice yields identical bytes.
pub trait Renderer: Send + Sync {
    fn fill(&self, request: &FillRequest<'_>) -> Result<Vec<u8>, RenderError>;
    fn render(&self, source: &[u8], format: RenderFormat) -> Result<Vec<u8>, RenderError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSource {
    pub report_id: Uuid,
    pub job_id: Uuid,
    pub report_name: String,
    pub user_id: u32,
    pub executed_at: DateTime<Utc>,
    pub data_source: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub struct DocumentRenderer {
    reporting: DataSourceConfig,
}

impl DocumentRenderer {
    pub fn new(reporting: DataSourceConfig) -> Self {
        Self { reporting }
    }
}

impl Renderer for DocumentRenderer {
    fn fill(&self, request: &FillRequest<'_>) -> Result<Vec<u8>, RenderError> {
        let source = ReportSource {
            report_id: request.report_id,
            job_id: request.job_id,
            report_name: request.report_name.to_owned(),
            user_id: request.user_id,
            executed_at: request.executed_at,
            data_source: self.reporting.name.clone(),
            columns: vec!["Parameter".to_owned(), "Value".to_owned()],
            rows: request
                .parameters
                .iter()
                .map(|(name, value)| vec![name.clone(), value.clone()])
                .collect(),
        };
        serde_json::to_vec(&source).map_err(RenderError::Serialize)
    }

    fn render(&self, source: &[u8], format: RenderFormat) -> Result<Vec<u8>, RenderError> {
        let source: ReportSource =
            serde_json::from_slice(source).map_err(RenderError::MalformedSource)?;
        match format {
            RenderFormat::Pdf => Ok(render_pdf(&source)),
            RenderFormat::Xls => Ok(render_spreadsheet(&source)),
            RenderFormat::None => Err(RenderError::UnsupportedFormat { format }),
        }
    }
}

fn text_lines(source: &ReportSource) -> Vec<String> {
    let mut lines = vec![
        source.report_name.clone(),
        format!(
            "Executed {} by user {} (data source {})",
            source
                .executed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            source.user_id,
            source.data_source
        ),
        format!("Job {}", source.job_id),
        String::new(),
        source.columns.join(" | "),
    ];
    lines.extend(source.rows.iter().map(|row| row.join(" | ")));

    if lines.len() > PDF_MAX_LINES {
        lines.truncate(PDF_MAX_LINES - 1);
        lines.push("...".to_owned());
    }
    lines
}

fn escape_pdf_text(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '(' | ')' | '\\' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            ' '..='~' => escaped.push(ch),
            _ => escaped.push('?'),
        }
    }
    escaped
}

// Single A4 page, Helvetica, one text line per row.
fn render_pdf(source: &ReportSource) -> Vec<u8> {
    let mut content = String::from("BT\n/F1 10 Tf\n14 TL\n50 800 Td\n");
    for line in text_lines(source) {
        let _ = writeln!(content, "({}) Tj T*", escape_pdf_text(&line));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_owned(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_owned(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>".to_owned(),
        format!("<< /Length {} >>\nstream\n{content}endstream", content.len()),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_owned(),
    ];

    let mut pdf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (index, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        let _ = write!(pdf, "{} 0 obj\n{body}\nendobj\n", index + 1);
    }

    let xref_offset = pdf.len();
    let _ = write!(pdf, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        let _ = write!(pdf, "{offset:010} 00000 n \n");
    }
    let _ = write!(
        pdf,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    );
    pdf.into_bytes()
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Spreadsheet tab names are limited to 31 characters and may not contain
/// `/ \ ? * [ ]` or start/end with an apostrophe.
pub fn sanitize_sheet_name(raw: &str) -> String {
    let mut name: Vec<char> = raw
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '?' | '*' | '[' | ']' => ' ',
            _ => ch,
        })
        .take(MAX_SHEET_NAME_CHARS)
        .collect();

    if name.first() == Some(&'\'') {
        name[0] = ' ';
    }
    if let Some(last) = name.last_mut() {
        if *last == '\'' {
            *last = ' ';
        }
    }

    let name: String = name.into_iter().collect();
    if name.trim().is_empty() {
        "Report".to_owned()
    } else {
        name
    }
}

fn push_row(xml: &mut String, cells: &[String]) {
    xml.push_str("<Row>");
    for cell in cells {
        let _ = write!(
            xml,
            "<Cell><Data ss:Type=\"String\">{}</Data></Cell>",
            escape_xml(cell)
        );
    }
    xml.push_str("</Row>\n");
}

fn render_spreadsheet(source: &ReportSource) -> Vec<u8> {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <?mso-application progid=\"Excel.Sheet\"?>\n\
         <Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" \
         xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n",
    );
    let _ = writeln!(
        xml,
        "<Worksheet ss:Name=\"{}\">\n<Table>",
        escape_xml(&sanitize_sheet_name(&source.report_name))
    );
    push_row(&mut xml, &source.columns);
    for row in &source.rows {
        push_row(&mut xml, row);
    }
    xml.push_str("</Table>\n</Worksheet>\n</Workbook>\n");
    xml.into_bytes()
}
