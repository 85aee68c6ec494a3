//! Streaming transmitter: drives one authenticated SMTP session

use std::io::{BufRead, BufReader, Read, Write};

use log::{debug, info, warn};

use crate::smtp::commands::{DotStuffer, SmtpCommand, decode_xoauth2_challenge, xoauth2_response};
use crate::smtp::connection::{Connection, Connector, TcpConnector, TlsMode, TlsPolicy};
use crate::smtp::email::ComposedMessage;
use crate::smtp::error::{SendError, SmtpLimits, TransportError};
use crate::smtp::response::{Capabilities, ReplyLine, SmtpResponse};
use crate::smtp::session::{MessageCursor, TransmitSession, TransmitState};

/// Default number of message bytes pulled per write during DATA
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Sends composed messages over XOAUTH2-authenticated SMTP sessions
#[derive(Debug, Clone)]
pub struct Transmitter<K = TcpConnector> {
    connector: K,
    policy: TlsPolicy,
    hello_name: String,
    chunk_size: usize,
}

impl Transmitter<TcpConnector> {
    /// Create a transmitter using direct TCP connections
    pub fn new(policy: TlsPolicy) -> Result<Self, TransportError> {
        Ok(Self::with_connector(TcpConnector::new(&policy)?, policy))
    }
}

impl<K: Connector> Transmitter<K> {
    /// Create a transmitter over a custom connector
    pub fn with_connector(connector: K, policy: TlsPolicy) -> Self {
        Self {
            connector,
            policy,
            hello_name: "localhost".to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the name announced in EHLO
    pub fn hello_name(mut self, name: &str) -> Self {
        self.hello_name = name.to_owned();
        self
    }

    /// Set the DATA upload chunk size (at least one byte)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Send a message through a fresh session.
    ///
    /// Blocks until the server accepts the message or the session fails. The
    /// message is only borrowed and stays untouched either way.
    pub fn send(
        &self,
        session: &mut TransmitSession,
        message: &ComposedMessage,
    ) -> Result<(), SendError> {
        if session.state() != TransmitState::Init {
            return Err(TransportError::InvalidState(session.state()).into());
        }
        session.validate()?;
        self.policy.check()?;

        match self.run(session, message) {
            Ok(()) => {
                info!(
                    "Message accepted by {}:{} ({} bytes)",
                    session.host,
                    session.port,
                    session.bytes_streamed()
                );
                Ok(())
            }
            Err(e) => {
                session.fail();
                warn!(
                    "Send failed during {:?}: {e}",
                    session.failed_in().unwrap_or(TransmitState::Init)
                );
                Err(e.into())
            }
        }
    }

    fn run(
        &self,
        session: &mut TransmitSession,
        message: &ComposedMessage,
    ) -> Result<(), TransportError> {
        session.advance(TransmitState::Connecting)?;
        let mut conn = self.connector.connect(&session.host, session.port)?;

        if self.policy.mode == TlsMode::Implicit {
            session.advance(TransmitState::TlsNegotiating)?;
            conn.start_tls(&session.host)?;
        }

        let mut client = SmtpClient::new(conn);
        client.expect_reply("greeting", "220")?;
        let mut caps = client.ehlo(&self.hello_name)?;
        info!("Connected to {}:{} ({})", session.host, session.port, caps.server_name);

        if self.policy.mode == TlsMode::StartTls {
            session.advance(TransmitState::TlsNegotiating)?;
            if !caps.starttls {
                return Err(TransportError::Insecure(format!(
                    "{} does not offer STARTTLS",
                    session.host
                )));
            }
            client.command_expect(&SmtpCommand::StartTls, "220")?;
            client.start_tls(&session.host)?;
            caps = client.ehlo(&self.hello_name)?;
        }

        match client.conn().tls_version() {
            Some(version) if version >= self.policy.min_version => {}
            Some(version) => {
                return Err(TransportError::Insecure(format!(
                    "negotiated {version:?}, below {:?}",
                    self.policy.min_version
                )));
            }
            None => {
                return Err(TransportError::Insecure(
                    "channel is not encrypted".to_owned(),
                ));
            }
        }

        session.advance(TransmitState::Authenticating)?;
        client.auth_xoauth2(&caps, &session.username, session.token.secret())?;

        session.advance(TransmitState::MailFrom)?;
        if let Some(max) = caps.max_size.filter(|&max| message.len() > max) {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }
        let size = caps.max_size.map(|_| message.len());
        client.command_expect(
            &SmtpCommand::MailFrom {
                address: &session.from,
                size,
            },
            "250",
        )?;

        session.advance(TransmitState::RcptTo)?;
        for rcpt in &session.to {
            let reply = client.command(&SmtpCommand::RcptTo(rcpt))?;
            if !reply.is_success() {
                return Err(TransportError::Rejected {
                    command: "RCPT",
                    reply,
                });
            }
        }

        session.advance(TransmitState::DataStreaming)?;
        client.command_expect(&SmtpCommand::Data, "354")?;
        let mut stuffer = DotStuffer::new();
        let uploaded = client.stream_message(message, self.chunk_size, &mut stuffer);
        session.record_streamed(stuffer.consumed());
        uploaded?;
        client.expect_reply("DATA", "250")?;

        session.advance(TransmitState::Completed)?;
        client.quit();
        Ok(())
    }
}

/// Line-oriented command/reply exchange over a connection
struct SmtpClient<C: Connection> {
    reader: BufReader<C>,
}

impl<C: Connection> SmtpClient<C> {
    fn new(conn: C) -> Self {
        Self {
            reader: BufReader::new(conn),
        }
    }

    fn conn(&self) -> &C {
        self.reader.get_ref()
    }

    /// Send a command and read its reply
    fn command(&mut self, command: &SmtpCommand<'_>) -> Result<SmtpResponse, TransportError> {
        let line = command.to_line()?;
        debug!("C: {command:?}");
        let conn = self.reader.get_mut();
        conn.write_all(line.as_bytes())?;
        conn.flush()?;
        self.read_reply()
    }

    /// Send a command and require an exact reply code
    fn command_expect(
        &mut self,
        command: &SmtpCommand<'_>,
        code: &str,
    ) -> Result<SmtpResponse, TransportError> {
        let reply = self.command(command)?;
        if !reply.has_code(code) {
            return Err(TransportError::Rejected {
                command: command.verb(),
                reply,
            });
        }
        Ok(reply)
    }

    /// Read a reply that was not triggered by a command line
    fn expect_reply(&mut self, stage: &'static str, code: &str) -> Result<SmtpResponse, TransportError> {
        let reply = self.read_reply()?;
        if !reply.has_code(code) {
            return Err(TransportError::Rejected {
                command: stage,
                reply,
            });
        }
        Ok(reply)
    }

    /// Read a complete, possibly multiline, reply
    fn read_reply(&mut self) -> Result<SmtpResponse, TransportError> {
        let mut raw = String::new();
        for _ in 0..SmtpLimits::MAX_REPLY_LINES {
            let mut line = Vec::new();
            let n = (&mut self.reader)
                .take(SmtpLimits::REPLY_LINE_MAX_LENGTH as u64)
                .read_until(b'\n', &mut line)?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            if !line.ends_with(b"\n") {
                return Err(TransportError::LineTooLong {
                    max: SmtpLimits::REPLY_LINE_MAX_LENGTH,
                });
            }

            let line = String::from_utf8_lossy(&line);
            debug!("S: {}", line.trim_end());
            let is_last = ReplyLine::parse(&line)?.is_last;
            raw.push_str(&line);
            if is_last {
                return SmtpResponse::parse(&raw);
            }
        }

        Err(TransportError::MalformedReply(format!(
            "more than {} reply lines",
            SmtpLimits::MAX_REPLY_LINES
        )))
    }

    fn ehlo(&mut self, hello_name: &str) -> Result<Capabilities, TransportError> {
        let reply = self.command_expect(&SmtpCommand::Ehlo(hello_name), "250")?;
        let caps = Capabilities::from_ehlo(&reply);
        debug!("Server capabilities: {caps:?}");
        Ok(caps)
    }

    fn start_tls(&mut self, host: &str) -> Result<(), TransportError> {
        // Anything buffered now arrived in plaintext after the 220 reply
        if !self.reader.buffer().is_empty() {
            return Err(TransportError::Insecure(
                "server sent data before the TLS handshake".to_owned(),
            ));
        }
        self.reader.get_mut().start_tls(host)
    }

    fn auth_xoauth2(
        &mut self,
        caps: &Capabilities,
        username: &str,
        token: &str,
    ) -> Result<(), TransportError> {
        if !caps.supports_auth("XOAUTH2") {
            return Err(TransportError::Unsupported("AUTH XOAUTH2"));
        }

        let initial = xoauth2_response(username, token);
        let mut reply = self.command(&SmtpCommand::AuthXoauth2(&initial))?;

        if reply.is_intermediate() {
            // The challenge carries the error details; an empty line ends the exchange
            if let Some(details) = decode_xoauth2_challenge(&reply.message) {
                warn!("XOAUTH2 challenge from server: {details}");
            }
            reply = self.command(&SmtpCommand::AuthResponse(""))?;
        }

        if reply.has_code("235") {
            info!("Authenticated as {username}");
            Ok(())
        } else {
            Err(TransportError::Authentication { reply })
        }
    }

    /// Upload the message in chunks pulled from a cursor, then end the data.
    ///
    /// `stuffer` keeps counting what was written if the upload breaks off.
    fn stream_message(
        &mut self,
        message: &ComposedMessage,
        chunk_size: usize,
        stuffer: &mut DotStuffer,
    ) -> Result<(), TransportError> {
        let mut cursor = MessageCursor::new(message);
        let conn = self.reader.get_mut();

        while let Some(chunk) = cursor.next_chunk(chunk_size) {
            stuffer.write_chunk(chunk, &mut *conn)?;
        }

        let streamed = stuffer.consumed();
        stuffer.finish(&mut *conn)?;
        conn.flush()?;
        debug!("C: <{streamed} bytes of message data>");
        Ok(())
    }

    fn quit(&mut self) {
        if let Err(e) = self.command(&SmtpCommand::Quit) {
            debug!("QUIT failed after delivery: {e}");
        }
    }
}
