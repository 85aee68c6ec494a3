//! # tokenmail
//!
//! tokenmail sends a single HTML email over SMTP, authenticating with an
//! OAuth2 access token (`AUTH XOAUTH2`) instead of a password.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tokenmail::{BearerToken, MessageFields, TlsPolicy, TransmitSession, Transmitter};
//!
//! let message = MessageFields::new("you@contoso.com", "friend@example.com", "Hi", "<p>Hello</p>")
//!     .compose();
//!
//! let mut session = TransmitSession::new(
//!     "smtp.office365.com",
//!     587,
//!     "you@contoso.com",
//!     "friend@example.com",
//!     "you@contoso.com",
//!     BearerToken::new("eyJ0eXAi..."),
//! );
//!
//! let transmitter = Transmitter::new(TlsPolicy::for_port(587))?;
//! transmitter.send(&mut session, &message)?;
//! # Ok::<(), tokenmail::SendError>(())
//! ```
//!
//! ## Message format
//!
//! Messages carry `Date`, `From`, `To`, `Subject`, `MIME-Version` and
//! `Content-Type: text/html; charset=UTF-8` headers followed by the body.
//! Bare line feeds in the subject and body are converted to CRLF.
//!
//! ## Transport
//!
//! - Credentials are only ever sent over TLS 1.2 or newer, using STARTTLS
//!   (default) or implicit TLS (port 465).
//! - A server that does not offer STARTTLS is refused, never downgraded.
//! - Connections are made directly; proxy environment variables are ignored.
//! - The message is uploaded in chunks from a read cursor and dot-stuffed on
//!   the fly.
//!
//! ## Notes
//!
//! - One envelope recipient per message.
//! - No attachments or multipart bodies.
//! - No retries and no token refresh; both belong to the caller.

pub mod config;
mod smtp;

pub use smtp::{
    BearerToken, Capabilities, ComposedMessage, Connection, Connector, DotStuffer, MessageCursor,
    MessageFields, SendError, SmtpCommand, SmtpLimits, SmtpResponse, TcpConnection, TcpConnector,
    TlsMode, TlsPolicy, TlsVersion, TransmitSession, TransmitState, Transmitter, TransportError,
    compose, sanitize_crlf,
};
