//! Error types for composing and transmitting a message

use std::collections::TryReserveError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::smtp::response::SmtpResponse;
use crate::smtp::session::TransmitState;

/// Top-level failure of a send, as reported at the CLI boundary
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Missing required input: {0}")]
    MissingInput(&'static str),

    #[error("Failed to read {}: {source}", .path.display())]
    BodySource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read token from {}: {reason}", .path.display())]
    TokenSource { path: PathBuf, reason: String },

    #[error("Failed to build message: {0}")]
    Composition(#[from] TryReserveError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures raised while driving an SMTP session
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Refusing insecure transport: {0}")]
    Insecure(String),

    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("Authentication failed: {reply}")]
    Authentication { reply: SmtpResponse },

    #[error("{command} rejected: {reply}")]
    Rejected {
        command: &'static str,
        reply: SmtpResponse,
    },

    #[error("Server does not support {0}")]
    Unsupported(&'static str),

    #[error("Message too large ({size} bytes, server accepts {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed server reply: {0}")]
    MalformedReply(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state for operation: {0:?}")]
    InvalidState(TransmitState),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Protocol size limits (RFC 5321 section 4.5.3, RFC 4954 section 4)
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of an AUTH command line including CRLF
    pub const AUTH_LINE_MAX_LENGTH: usize = 12288;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum number of lines accepted in a single multiline reply
    pub const MAX_REPLY_LINES: usize = 128;
}

/// Maps send failures to process exit codes (sysexits.h)
impl SendError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SendError::MissingInput(_) => 64,
            SendError::BodySource { .. } | SendError::TokenSource { .. } => 66,
            SendError::Composition(_) => 70,
            SendError::Transport(e) => e.exit_code(),
        }
    }
}

impl TransportError {
    pub fn exit_code(&self) -> i32 {
        match self {
            TransportError::Insecure(_) => 78,
            TransportError::Connect { .. } | TransportError::Tls(_) => 69,
            TransportError::Authentication { .. } => 77,
            TransportError::Rejected { reply, .. } if reply.is_transient() => 75,
            TransportError::Rejected { .. } => 69,
            TransportError::Unsupported(_) | TransportError::MessageTooLarge { .. } => 69,
            TransportError::MalformedReply(_)
            | TransportError::LineTooLong { .. }
            | TransportError::ConnectionClosed => 76,
            TransportError::InvalidArgument(_) | TransportError::InvalidState(_) => 70,
            TransportError::Io(_) => 74,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SendError::MissingInput("token").exit_code(), 64);
        assert_eq!(
            SendError::from(TransportError::Insecure("plain".to_owned())).exit_code(),
            78
        );

        let auth = TransportError::Authentication {
            reply: SmtpResponse::new("535", "5.7.3 Authentication unsuccessful"),
        };
        assert_eq!(SendError::from(auth).exit_code(), 77);

        let busy = TransportError::Rejected {
            command: "MAIL",
            reply: SmtpResponse::new("451", "Try again later"),
        };
        assert_eq!(busy.exit_code(), 75);

        let denied = TransportError::Rejected {
            command: "RCPT",
            reply: SmtpResponse::new("550", "No such user"),
        };
        assert_eq!(denied.exit_code(), 69);
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Rejected {
            command: "RCPT",
            reply: SmtpResponse::new("550", "5.1.1 No such user"),
        };
        assert_eq!(err.to_string(), "RCPT rejected: 550 5.1.1 No such user");

        let err = SendError::MissingInput("from");
        assert_eq!(err.to_string(), "Missing required input: from");
    }
}
