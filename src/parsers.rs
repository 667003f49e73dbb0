//! Parsing utilities for common export file formats.
//!
//! Pure, stateless transformations from raw bytes to structured records:
//! free-form datetimes, JSON with date-field conversion, CSV with type
//! inference, and mbox mailboxes. Nothing here touches the database.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, MimeHeaders};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON in {path}: {message}")]
    Json { path: PathBuf, message: String },
    #[error("CSV error in {path}: {message}")]
    Csv { path: PathBuf, message: String },
    #[error("could not parse mail file {path}: {message}")]
    Mail { path: PathBuf, message: String },
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Epoch values above this are treated as milliseconds, not seconds.
const MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

/// Datetime formats with an explicit UTC offset.
const TZ_AWARE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
    // RFC 2822 (email)
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
];

/// Datetime formats without an offset; interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    // US, then European
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// Date-only formats; midnight UTC.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Interpret a numeric Unix timestamp, detecting seconds vs milliseconds.
pub fn parse_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() > MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// Parse a datetime from the formats commonly found in data exports.
///
/// Tries numeric epochs, a fixed format table, then RFC 3339 / RFC 2822.
/// Returns None on total failure, never an error.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ts) = value.parse::<f64>() {
        return parse_epoch(ts);
    }

    for fmt in TZ_AWARE_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc());
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }

    debug!(value, "could not parse datetime");
    None
}

fn datetime_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(parse_epoch),
        Value::String(s) => parse_datetime(s),
        _ => None,
    }
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Load a JSON file, rewriting any key named in `date_fields` (at any
/// nesting depth) from a string or epoch number into an RFC 3339 string.
/// Values that cannot be parsed as datetimes become null.
pub fn parse_json(path: &Path, date_fields: &[&str]) -> Result<Value, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut data: Value = serde_json::from_str(&content).map_err(|e| ParseError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if !date_fields.is_empty() {
        convert_date_fields(&mut data, date_fields);
    }

    Ok(data)
}

fn convert_date_fields(data: &mut Value, date_fields: &[&str]) {
    match data {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if date_fields.contains(&key.as_str())
                    && (value.is_string() || value.is_number())
                {
                    *value = match datetime_from_value(value) {
                        Some(dt) => Value::String(rfc3339(dt)),
                        None => Value::Null,
                    };
                } else {
                    convert_date_fields(value, date_fields);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                convert_date_fields(item, date_fields);
            }
        }
        _ => {}
    }
}

/// Options for [`parse_csv`].
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Columns converted to RFC 3339 datetime strings.
    pub date_columns: Vec<String>,
    pub delimiter: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            date_columns: Vec::new(),
            delimiter: b',',
        }
    }
}

/// Lazy row iterator over a CSV file.
///
/// Restartable by calling [`parse_csv`] again (the file is reopened on
/// each call). Non-UTF-8 bytes are decoded lossily.
pub struct CsvRows {
    reader: csv::Reader<std::fs::File>,
    headers: Vec<String>,
    date_columns: Vec<String>,
    path: PathBuf,
}

/// Open a CSV file and return a lazy sequence of typed row maps.
pub fn parse_csv(path: &Path, options: &CsvOptions) -> Result<CsvRows, ParseError> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| ParseError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let mut rows = CsvRows {
        reader,
        headers: Vec::new(),
        date_columns: options.date_columns.clone(),
        path: path.to_path_buf(),
    };

    rows.headers = rows
        .reader
        .byte_headers()
        .map_err(|e| ParseError::Csv {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();

    Ok(rows)
}

impl Iterator for CsvRows {
    type Item = Result<BTreeMap<String, Value>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = csv::ByteRecord::new();
        match self.reader.read_byte_record(&mut record) {
            Ok(false) => None,
            Ok(true) => {
                let mut row = BTreeMap::new();
                for (header, field) in self.headers.iter().zip(record.iter()) {
                    let raw = String::from_utf8_lossy(field).into_owned();
                    let value = if self.date_columns.contains(header) {
                        match parse_datetime(&raw) {
                            Some(dt) => Value::String(rfc3339(dt)),
                            None => Value::Null,
                        }
                    } else {
                        infer_value(&raw)
                    };
                    row.insert(header.clone(), value);
                }
                Some(Ok(row))
            }
            Err(e) => Some(Err(ParseError::Csv {
                path: self.path.clone(),
                message: e.to_string(),
            })),
        }
    }
}

/// Best-effort type inference for a CSV field.
fn infer_value(value: &str) -> Value {
    let lower = value.to_ascii_lowercase();

    if value.is_empty() || matches!(lower.as_str(), "null" | "none" | "na" | "n/a") {
        return Value::Null;
    }
    if matches!(lower.as_str(), "true" | "yes" | "1") {
        return Value::Bool(true);
    }
    if matches!(lower.as_str(), "false" | "no" | "0") {
        return Value::Bool(false);
    }
    if let Ok(i) = value.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }

    Value::String(value.to_string())
}

/// Attachment extracted from an email message.
#[derive(Debug, Clone, Default)]
pub struct MailAttachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
    pub size: usize,
}

/// Parsed email message from an mbox or eml file.
///
/// A transfer record, not a persisted model; ingesters map it onto the
/// entity shape.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    pub message_id: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<MailAttachment>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

fn trim_msgid(s: &str) -> String {
    s.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn address_list(addr: Option<&mail_parser::Address<'_>>) -> Vec<String> {
    addr.map(|a| {
        a.iter()
            .filter_map(|entry| entry.address().map(|s| s.to_string()))
            .collect()
    })
    .unwrap_or_default()
}

fn header_text(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(t) => Some(t.to_string()),
        HeaderValue::TextList(list) => Some(
            list.iter()
                .map(|t| t.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    }
}

fn header_ids(value: Option<&HeaderValue<'_>>) -> Vec<String> {
    match value {
        Some(HeaderValue::Text(t)) => t.split_whitespace().map(trim_msgid).collect(),
        Some(HeaderValue::TextList(list)) => list.iter().map(|t| trim_msgid(t)).collect(),
        _ => Vec::new(),
    }
}

fn convert_message(msg: &Message<'_>) -> MailMessage {
    let mut out = MailMessage {
        message_id: msg.message_id().map(|s| s.to_string()),
        subject: msg.subject().map(|s| s.to_string()),
        ..MailMessage::default()
    };

    if let Some(addr) = msg.from().and_then(|a| a.first()) {
        out.from_address = addr.address().map(|s| s.to_string());
        out.from_name = addr.name().map(|s| s.to_string());
    }
    out.to_addresses = address_list(msg.to());
    out.cc_addresses = address_list(msg.cc());
    out.bcc_addresses = address_list(msg.bcc());

    out.date = msg
        .date()
        .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single());

    out.in_reply_to = header_ids(msg.header("In-Reply-To")).into_iter().next();
    out.references = header_ids(msg.header("References"));

    for header in msg.headers() {
        if let Some(text) = header_text(&header.value) {
            out.headers.insert(header.name.as_str().to_string(), text);
        }
    }

    out.body_plain = msg.body_text(0).map(|c| c.into_owned());
    out.body_html = msg.body_html(0).map(|c| c.into_owned());

    for part in msg.attachments() {
        let content = part.contents().to_vec();
        out.attachments.push(MailAttachment {
            filename: part.attachment_name().map(|s| s.to_string()),
            content_type: part.content_type().map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            }),
            size: content.len(),
            content,
        });
    }

    out
}

/// Lazy message iterator over an mbox file.
///
/// Messages are split on `From ` envelope lines (with `>From` unescaping);
/// each message body is handed to the mail parser, which handles MIME
/// structure and RFC 2047 encoded words. A message that fails to parse is
/// logged and skipped; the iterator continues with the next one.
pub struct MboxMessages {
    reader: BufReader<std::fs::File>,
    path: PathBuf,
    current: Vec<u8>,
    started: bool,
    done: bool,
}

/// Open an mbox file and return a lazy sequence of parsed messages.
pub fn parse_mbox(path: &Path) -> Result<MboxMessages, ParseError> {
    let file = std::fs::File::open(path).map_err(|e| ParseError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(MboxMessages {
        reader: BufReader::new(file),
        path: path.to_path_buf(),
        current: Vec::new(),
        started: false,
        done: false,
    })
}

impl MboxMessages {
    fn parse_current(&mut self) -> Option<MailMessage> {
        let raw = std::mem::take(&mut self.current);
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        match MessageParser::default().parse(&raw) {
            Some(msg) => Some(convert_message(&msg)),
            None => {
                warn!(path = %self.path.display(), "failed to parse mbox message, skipping");
                None
            }
        }
    }
}

impl Iterator for MboxMessages {
    type Item = Result<MailMessage, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut line = Vec::new();
        loop {
            line.clear();
            let n = match self.reader.read_until(b'\n', &mut line) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(ParseError::Io {
                        path: self.path.clone(),
                        source: e,
                    }));
                }
            };

            if n == 0 {
                self.done = true;
                if !self.started {
                    return None;
                }
                return match self.parse_current() {
                    Some(msg) => Some(Ok(msg)),
                    None => None,
                };
            }

            if line.starts_with(b"From ") {
                let finished = self.started && !self.current.is_empty();
                self.started = true;
                if finished {
                    if let Some(msg) = self.parse_current() {
                        return Some(Ok(msg));
                    }
                    // Unparseable message: skip and keep reading.
                    continue;
                }
                continue;
            }

            if self.started {
                // mboxrd unescaping: ">From " loses one '>'.
                let escaped = line.iter().take_while(|&&b| b == b'>').count();
                if escaped > 0 && line[escaped..].starts_with(b"From ") {
                    self.current.extend_from_slice(&line[1..]);
                } else {
                    self.current.extend_from_slice(&line);
                }
            }
        }
    }
}

/// Parse a single RFC 822 (.eml) file.
pub fn parse_eml(path: &Path) -> Result<MailMessage, ParseError> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| ParseError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

    match MessageParser::default().parse(&bytes) {
        Some(msg) => Ok(convert_message(&msg)),
        None => Err(ParseError::Mail {
            path: path.to_path_buf(),
            message: "not a parseable message".to_string(),
        }),
    }
}
