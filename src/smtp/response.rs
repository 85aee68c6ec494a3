//! SMTP reply handling

use std::fmt;

use crate::smtp::error::TransportError;

/// Represents an SMTP reply received from the server
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpResponse {
    /// The SMTP reply code (e.g., "250", "354", "535")
    pub code: String,
    /// Text of the first reply line
    pub message: String,
    /// Text of any continuation lines (EHLO capabilities and the like)
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    /// Create a new single-line reply
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            multiline: None,
        }
    }

    /// Create a new multiline reply
    pub fn new_multiline(code: &str, message: &str, lines: Vec<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.to_owned(),
            multiline: Some(lines),
        }
    }

    /// Parse a complete reply, one or more CRLF terminated lines
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let mut code: Option<&str> = None;
        let mut texts = Vec::new();
        let mut finished = false;

        for line in raw.split_terminator('\n') {
            if finished {
                return Err(TransportError::MalformedReply(format!(
                    "data after final reply line: {line:?}"
                )));
            }
            let reply_line = ReplyLine::parse(line)?;
            match code {
                Some(expected) if expected != reply_line.code => {
                    return Err(TransportError::MalformedReply(format!(
                        "reply code changed from {expected} to {}",
                        reply_line.code
                    )));
                }
                _ => code = Some(reply_line.code),
            }
            texts.push(reply_line.text.to_owned());
            finished = reply_line.is_last;
        }

        let code = match (code, finished) {
            (Some(code), true) => code,
            _ => {
                return Err(TransportError::MalformedReply(format!(
                    "incomplete reply: {raw:?}"
                )));
            }
        };

        let message = texts.remove(0);
        if texts.is_empty() {
            Ok(Self::new(code, &message))
        } else {
            Ok(Self::new_multiline(code, &message, texts))
        }
    }

    /// Format the reply as it appears on the wire
    pub fn format(&self) -> String {
        if let Some(ref lines) = self.multiline {
            let mut result = format!("{}-{}\r\n", self.code, self.message);
            for (i, line) in lines.iter().enumerate() {
                if i == lines.len() - 1 {
                    // Last line uses space instead of dash
                    result.push_str(&format!("{} {}\r\n", self.code, line));
                } else {
                    result.push_str(&format!("{}-{}\r\n", self.code, line));
                }
            }
            result
        } else {
            format!("{} {}\r\n", self.code, self.message)
        }
    }

    /// All text lines of the reply, first line included
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.message.as_str())
            .chain(self.multiline.iter().flatten().map(String::as_str))
    }

    /// Check if this is a success reply (2xx)
    pub fn is_success(&self) -> bool {
        self.code.starts_with('2')
    }

    /// Check if this is an intermediate reply (3xx)
    pub fn is_intermediate(&self) -> bool {
        self.code.starts_with('3')
    }

    /// Check if this is a transient failure (4xx)
    pub fn is_transient(&self) -> bool {
        self.code.starts_with('4')
    }

    /// Check the reply against an exact expected code
    pub fn has_code(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        for line in self.lines() {
            write!(f, " {line}")?;
        }
        Ok(())
    }
}

/// One physical line of a reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplyLine<'a> {
    pub code: &'a str,
    pub is_last: bool,
    pub text: &'a str,
}

impl<'a> ReplyLine<'a> {
    /// Parse `NNN text`, `NNN-text` or a bare `NNN`
    pub fn parse(line: &'a str) -> Result<Self, TransportError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let bytes = line.as_bytes();

        let valid_code = bytes.len() >= 3
            && (b'2'..=b'5').contains(&bytes[0])
            && bytes[1..3].iter().all(u8::is_ascii_digit);
        if !valid_code {
            return Err(TransportError::MalformedReply(line.to_owned()));
        }

        let (is_last, text) = match bytes.get(3) {
            None => (true, ""),
            Some(b' ') => (true, &line[4..]),
            Some(b'-') => (false, &line[4..]),
            Some(_) => return Err(TransportError::MalformedReply(line.to_owned())),
        };

        Ok(Self {
            code: &line[..3],
            is_last,
            text,
        })
    }
}

/// Server extensions advertised in an EHLO reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    /// Greeting text of the EHLO reply, normally the server's name
    pub server_name: String,
    /// STARTTLS advertised
    pub starttls: bool,
    /// SASL mechanisms listed by the AUTH keyword, upper-cased
    pub auth_mechanisms: Vec<String>,
    /// Maximum message size from the SIZE keyword; `None` when absent or unlimited
    pub max_size: Option<usize>,
}

impl Capabilities {
    /// Extract capabilities from a successful EHLO reply
    pub fn from_ehlo(reply: &SmtpResponse) -> Self {
        let mut caps = Capabilities {
            server_name: reply.message.clone(),
            ..Default::default()
        };

        for line in reply.multiline.iter().flatten() {
            let mut words = line.split([' ', '=']).filter(|w| !w.is_empty());
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => {
                    for mechanism in words {
                        let mechanism = mechanism.to_ascii_uppercase();
                        if !caps.auth_mechanisms.contains(&mechanism) {
                            caps.auth_mechanisms.push(mechanism);
                        }
                    }
                }
                "SIZE" => {
                    caps.max_size = words
                        .next()
                        .and_then(|n| n.parse::<usize>().ok())
                        .filter(|&n| n > 0);
                }
                _ => {}
            }
        }

        caps
    }

    /// Check whether a SASL mechanism was advertised
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}
