//! Transmit session state management

use std::fmt;
use std::io::{self, Read};

use crate::smtp::email::ComposedMessage;
use crate::smtp::error::{SendError, SmtpLimits, TransportError};

/// Represents the current state of a transmit session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    /// Session created, nothing sent
    Init,
    /// Opening the TCP connection and reading the greeting
    Connecting,
    /// STARTTLS or implicit TLS handshake
    TlsNegotiating,
    /// AUTH XOAUTH2 exchange
    Authenticating,
    /// MAIL FROM sent
    MailFrom,
    /// RCPT TO sent
    RcptTo,
    /// DATA accepted, message being uploaded
    DataStreaming,
    /// Server accepted the message
    Completed,
    /// Session ended with an error
    Failed,
}

impl TransmitState {
    /// Check whether the session has ended
    pub fn is_terminal(self) -> bool {
        matches!(self, TransmitState::Completed | TransmitState::Failed)
    }

    /// The state that follows this one on the success path
    pub fn next(self) -> Option<TransmitState> {
        match self {
            TransmitState::Init => Some(TransmitState::Connecting),
            TransmitState::Connecting => Some(TransmitState::TlsNegotiating),
            TransmitState::TlsNegotiating => Some(TransmitState::Authenticating),
            TransmitState::Authenticating => Some(TransmitState::MailFrom),
            TransmitState::MailFrom => Some(TransmitState::RcptTo),
            TransmitState::RcptTo => Some(TransmitState::DataStreaming),
            TransmitState::DataStreaming => Some(TransmitState::Completed),
            TransmitState::Completed | TransmitState::Failed => None,
        }
    }
}

/// An OAuth2 access token; never printed by `Debug`
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the XOAUTH2 exchange only
    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken(<{} bytes>)", self.0.len())
    }
}

/// State and parameters of a single send
#[derive(Debug)]
pub struct TransmitSession {
    /// SMTP server host name
    pub host: String,
    /// SMTP server port
    pub port: u16,
    /// Envelope sender (MAIL FROM)
    pub from: String,
    /// Envelope recipients (RCPT TO), a single address
    pub to: Vec<String>,
    /// Authenticating mailbox
    pub username: String,
    /// OAuth2 bearer token
    pub token: BearerToken,
    state: TransmitState,
    failed_in: Option<TransmitState>,
    bytes_streamed: usize,
}

impl TransmitSession {
    /// Create a new session for one message
    pub fn new(
        host: &str,
        port: u16,
        from: &str,
        to: &str,
        username: &str,
        token: BearerToken,
    ) -> Self {
        Self {
            host: host.to_owned(),
            port,
            from: from.to_owned(),
            to: vec![to.to_owned()],
            username: username.to_owned(),
            token,
            state: TransmitState::Init,
            failed_in: None,
            bytes_streamed: 0,
        }
    }

    /// Check required fields before any network activity
    pub fn validate(&self) -> Result<(), SendError> {
        if self.host.trim().is_empty() {
            return Err(SendError::MissingInput("server"));
        }
        if self.from.trim().is_empty() {
            return Err(SendError::MissingInput("from"));
        }
        if self.to.iter().all(|to| to.trim().is_empty()) {
            return Err(SendError::MissingInput("to"));
        }
        if self.username.trim().is_empty() {
            return Err(SendError::MissingInput("username"));
        }
        if self.token.is_empty() {
            return Err(SendError::MissingInput("token"));
        }
        if self.to.len() != 1 {
            return Err(TransportError::InvalidArgument(format!(
                "exactly one recipient is supported, got {}",
                self.to.len()
            ))
            .into());
        }

        for path in std::iter::once(&self.from).chain(&self.to) {
            if path.len() > SmtpLimits::PATH_MAX_LENGTH {
                return Err(TransportError::InvalidArgument(format!(
                    "address longer than {} characters",
                    SmtpLimits::PATH_MAX_LENGTH
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Current state
    pub fn state(&self) -> TransmitState {
        self.state
    }

    /// The state the session was in when it failed
    pub fn failed_in(&self) -> Option<TransmitState> {
        self.failed_in
    }

    /// Bytes of the message handed to the connection during DATA
    pub fn bytes_streamed(&self) -> usize {
        self.bytes_streamed
    }

    /// Move to the given state; only the next success-path state is allowed
    pub fn advance(&mut self, next: TransmitState) -> Result<(), TransportError> {
        if self.state.next() != Some(next) {
            return Err(TransportError::InvalidState(self.state));
        }
        self.state = next;
        Ok(())
    }

    /// End the session with a failure, remembering where it happened
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.failed_in = Some(self.state);
            self.state = TransmitState::Failed;
        }
    }

    pub(crate) fn record_streamed(&mut self, bytes: usize) {
        self.bytes_streamed = bytes;
    }
}

/// Read cursor over a composed message.
///
/// The position only moves forward and every byte is handed out exactly once.
#[derive(Debug)]
pub struct MessageCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageCursor<'a> {
    /// Create a cursor at the start of the message
    pub fn new(message: &'a ComposedMessage) -> Self {
        Self::from_bytes(message.as_bytes())
    }

    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Hand out up to `max` further bytes.
    ///
    /// Returns `None` once the message is exhausted, and for `max == 0`.
    pub fn next_chunk(&mut self, max: usize) -> Option<&'a [u8]> {
        if max == 0 || self.is_exhausted() {
            return None;
        }
        let end = self.pos + max.min(self.remaining());
        let chunk = &self.data[self.pos..end];
        self.pos = end;
        Some(chunk)
    }

    /// Bytes handed out so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }
}

impl Read for MessageCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.next_chunk(buf.len()) {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }
}
