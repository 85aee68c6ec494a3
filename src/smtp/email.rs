//! Message composition: RFC 5322 HTML messages with CRLF line endings

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};

use crate::smtp::error::SendError;

/// `Date` header format (RFC 2822 section 3.3), always in UTC
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

/// Render a timestamp as a `Date` header value
pub fn rfc2822_date(at: DateTime<Utc>) -> String {
    at.format(DATE_FORMAT).to_string()
}

/// Convert every bare line feed to CRLF.
///
/// Existing `\r\n` pairs are kept as they are and a `\r` that is not followed
/// by `\n` passes through untouched, so the transform is idempotent.
pub fn sanitize_crlf(input: &str) -> String {
    let bare = count_bare_lf(input);
    if bare == 0 {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len() + bare);
    let mut prev = None;
    for c in input.chars() {
        if c == '\n' && prev != Some('\r') {
            out.push('\r');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

fn count_bare_lf(input: &str) -> usize {
    let bytes = input.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|&(i, &b)| b == b'\n' && (i == 0 || bytes[i - 1] != b'\r'))
        .count()
}

/// Raw inputs of a message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFields {
    /// Sender address, rendered in the `From` header
    pub from: String,
    /// Optional sender display name
    pub from_name: Option<String>,
    /// Recipient address, rendered in the `To` header
    pub to: String,
    /// Subject text
    pub subject: String,
    /// HTML body
    pub body_html: String,
    /// `Date` header value
    pub date_header: String,
}

impl MessageFields {
    /// Create message fields dated now
    pub fn new(from: &str, to: &str, subject: &str, body_html: &str) -> Self {
        Self {
            from: from.to_owned(),
            from_name: None,
            to: to.to_owned(),
            subject: subject.to_owned(),
            body_html: body_html.to_owned(),
            date_header: rfc2822_date(Utc::now()),
        }
    }

    /// Set the sender display name; empty names are ignored
    pub fn with_from_name(mut self, name: &str) -> Self {
        let name: String = name.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
        let name = name.trim();
        self.from_name = (!name.is_empty()).then(|| name.to_owned());
        self
    }

    /// Replace the `Date` header with a fixed timestamp
    pub fn with_date(mut self, at: DateTime<Utc>) -> Self {
        self.date_header = rfc2822_date(at);
        self
    }

    /// Build the message
    pub fn compose(&self) -> ComposedMessage {
        let parts = self.parts();
        let mut data = Vec::with_capacity(parts.len());
        parts.write_into(&mut data);
        ComposedMessage { data }
    }

    /// Build the message, reporting allocation failure instead of aborting
    pub fn try_compose(&self) -> Result<ComposedMessage, SendError> {
        let parts = self.parts();
        let mut data = Vec::new();
        data.try_reserve_exact(parts.len())?;
        parts.write_into(&mut data);
        Ok(ComposedMessage { data })
    }

    fn parts(&self) -> Parts {
        let from = match self.from_name {
            Some(ref name) => format!("{} <{}>", display_name(name), self.from),
            None => format!("<{}>", self.from),
        };

        let header = format!(
            "Date: {}\r\nFrom: {}\r\nTo: <{}>\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n",
            self.date_header,
            from,
            self.to,
            sanitize_crlf(&self.subject),
        );

        Parts {
            header,
            body: sanitize_crlf(&self.body_html),
        }
    }
}

struct Parts {
    header: String,
    body: String,
}

impl Parts {
    fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    fn write_into(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(self.header.as_bytes());
        data.extend_from_slice(self.body.as_bytes());
    }
}

/// Render a display name as a quoted string, or an RFC 2047 encoded word
/// when it contains non-ASCII text
fn display_name(name: &str) -> String {
    if name.is_ascii() {
        let mut quoted = String::with_capacity(name.len() + 2);
        quoted.push('"');
        for c in name.chars() {
            if matches!(c, '"' | '\\') {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(name.as_bytes()))
    }
}

/// Compose an HTML message dated now
pub fn compose(from: &str, to: &str, subject: &str, body_html: &str) -> ComposedMessage {
    MessageFields::new(from, to, subject, body_html).compose()
}

/// A complete message ready for the DATA phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    data: Vec<u8>,
}

impl ComposedMessage {
    /// The message bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Exact size of the message in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The header block up to and including the blank separator line
    pub fn header_block(&self) -> &[u8] {
        &self.data[..self.body_offset()]
    }

    /// The body following the blank separator line
    pub fn body(&self) -> &[u8] {
        &self.data[self.body_offset()..]
    }

    /// Get the value of the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        let headers = std::str::from_utf8(self.header_block()).ok()?;
        headers.split("\r\n").find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name)
                .then(|| value.strip_prefix(' ').unwrap_or(value))
        })
    }

    fn body_offset(&self) -> usize {
        self.data
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(self.data.len(), |i| i + 4)
    }
}
