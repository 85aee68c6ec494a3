//! SMTP client implementation

pub mod commands;
pub mod connection;
pub mod email;
pub mod error;
pub mod response;
pub mod session;
pub mod transmitter;

pub use commands::{DotStuffer, SmtpCommand};
pub use connection::{Connection, Connector, TcpConnection, TcpConnector, TlsMode, TlsPolicy, TlsVersion};
pub use email::{ComposedMessage, MessageFields, compose, sanitize_crlf};
pub use error::{SendError, SmtpLimits, TransportError};
pub use response::{Capabilities, SmtpResponse};
pub use session::{BearerToken, MessageCursor, TransmitSession, TransmitState};
pub use transmitter::Transmitter;
