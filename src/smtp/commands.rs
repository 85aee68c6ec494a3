//! SMTP client commands and DATA framing

use std::fmt;
use std::io::{self, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::smtp::error::{SmtpLimits, TransportError};

/// A command sent by the client
#[derive(Clone, PartialEq)]
pub enum SmtpCommand<'a> {
    Ehlo(&'a str),
    StartTls,
    /// `AUTH XOAUTH2` with its initial client response
    AuthXoauth2(&'a str),
    /// A bare SASL continuation line
    AuthResponse(&'a str),
    MailFrom { address: &'a str, size: Option<usize> },
    RcptTo(&'a str),
    Data,
    Quit,
}

impl SmtpCommand<'_> {
    /// The command verb, used to label replies and errors
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::AuthXoauth2(_) | SmtpCommand::AuthResponse(_) => "AUTH",
            SmtpCommand::MailFrom { .. } => "MAIL",
            SmtpCommand::RcptTo(_) => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Quit => "QUIT",
        }
    }

    /// Render the command as a CRLF terminated line
    pub fn to_line(&self) -> Result<String, TransportError> {
        let line = match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}\r\n", checked(domain)?),
            SmtpCommand::StartTls => "STARTTLS\r\n".to_owned(),
            SmtpCommand::AuthXoauth2(initial) => {
                format!("AUTH XOAUTH2 {}\r\n", checked(initial)?)
            }
            SmtpCommand::AuthResponse(response) => format!("{}\r\n", checked(response)?),
            SmtpCommand::MailFrom { address, size } => match size {
                Some(size) => format!("MAIL FROM:<{}> SIZE={size}\r\n", checked(address)?),
                None => format!("MAIL FROM:<{}>\r\n", checked(address)?),
            },
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>\r\n", checked(address)?),
            SmtpCommand::Data => "DATA\r\n".to_owned(),
            SmtpCommand::Quit => "QUIT\r\n".to_owned(),
        };

        let max = match self {
            SmtpCommand::AuthXoauth2(_) | SmtpCommand::AuthResponse(_) => {
                SmtpLimits::AUTH_LINE_MAX_LENGTH
            }
            _ => SmtpLimits::COMMAND_LINE_MAX_LENGTH,
        };
        if line.len() > max {
            return Err(TransportError::LineTooLong { max });
        }

        Ok(line)
    }
}

/// Transcript form of the command, with credentials hidden
impl fmt::Debug for SmtpCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::AuthXoauth2(_) => write!(f, "AUTH XOAUTH2 <redacted>"),
            SmtpCommand::AuthResponse(r) if r.is_empty() => write!(f, "<empty>"),
            SmtpCommand::AuthResponse(_) => write!(f, "<redacted>"),
            other => match other.to_line() {
                Ok(line) => write!(f, "{}", line.trim_end()),
                Err(_) => write!(f, "{} <invalid>", other.verb()),
            },
        }
    }
}

/// Refuse arguments that would break out of the command line
fn checked(arg: &str) -> Result<&str, TransportError> {
    if arg.contains(['\r', '\n']) {
        return Err(TransportError::InvalidArgument(format!(
            "line break in command argument {arg:?}"
        )));
    }
    Ok(arg)
}

/// Build the base64 XOAUTH2 initial client response
pub fn xoauth2_response(username: &str, token: &str) -> String {
    let payload = format!("user={username}\x01auth=Bearer {token}\x01\x01");
    STANDARD.encode(payload.as_bytes())
}

/// Decode the base64 JSON error a server sends as a failed XOAUTH2 challenge
pub fn decode_xoauth2_challenge(challenge: &str) -> Option<String> {
    let bytes = STANDARD.decode(challenge.trim()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Some(json.to_string()),
        Err(_) => Some(text),
    }
}

/// Dot-stuffs DATA content chunk by chunk (RFC 5321 section 4.5.2).
///
/// State is carried across chunks so a line may be split anywhere.
#[derive(Debug)]
pub struct DotStuffer {
    at_line_start: bool,
    tail: [u8; 2],
    written: usize,
}

impl DotStuffer {
    pub fn new() -> Self {
        Self {
            at_line_start: true,
            tail: [0; 2],
            written: 0,
        }
    }

    /// Write one chunk of message content
    pub fn write_chunk<W: Write>(&mut self, chunk: &[u8], out: &mut W) -> io::Result<()> {
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if self.at_line_start && b == b'.' {
                out.write_all(&chunk[start..i])?;
                out.write_all(b".")?;
                start = i;
            }
            self.at_line_start = b == b'\n';
        }
        out.write_all(&chunk[start..])?;

        match chunk.len() {
            0 => {}
            1 => self.tail = [self.tail[1], chunk[0]],
            n => self.tail = [chunk[n - 2], chunk[n - 1]],
        }
        self.written += chunk.len();
        Ok(())
    }

    /// Write the end-of-data marker
    pub fn finish<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if self.written == 0 || self.tail == *b"\r\n" {
            out.write_all(b".\r\n")
        } else {
            out.write_all(b"\r\n.\r\n")
        }
    }

    /// Message bytes consumed so far, stuffing excluded
    pub fn consumed(&self) -> usize {
        self.written
    }
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}
