//! Integration tests against scripted SMTP servers on the loopback interface

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokenmail::{
    BearerToken, ComposedMessage, MessageFields, SendError, SmtpResponse, TcpConnector, TlsMode,
    TlsPolicy, TlsVersion, TransmitSession, TransmitState, Transmitter, TransportError,
};

type Handler = fn(&str) -> Option<SmtpResponse>;

/// Start a one-connection server that answers each command line with `handler`.
/// Every line received is forwarded to the returned channel.
fn start_test_server(greeting: SmtpResponse, handler: Handler) -> (u16, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();

    // Start server in background thread
    thread::spawn(move || {
        let (stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        if let Err(e) = handle_client(stream, &greeting, handler, &tx) {
            eprintln!("Error handling client: {e}");
        }
    });

    (port, rx)
}

fn handle_client(
    mut stream: TcpStream,
    greeting: &SmtpResponse,
    handler: Handler,
    lines: &mpsc::Sender<String>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    stream.write_all(greeting.format().as_bytes())?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(()); // Connection closed
        }
        let command = line.trim_end().to_owned();
        let _ = lines.send(command.clone());

        match handler(&command) {
            Some(reply) => {
                stream.write_all(reply.format().as_bytes())?;
                stream.flush()?;
            }
            None => return Ok(()),
        }
    }
}

fn received_lines(rx: &mpsc::Receiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.recv_timeout(Duration::from_secs(5)) {
        lines.push(line);
    }
    lines
}

fn greeting() -> SmtpResponse {
    SmtpResponse::new("220", "test.local ESMTP ready")
}

fn session(port: u16) -> TransmitSession {
    TransmitSession::new(
        "127.0.0.1",
        port,
        "a@x.com",
        "b@x.com",
        "a@x.com",
        BearerToken::new("token"),
    )
}

fn message() -> ComposedMessage {
    MessageFields::new("a@x.com", "b@x.com", "Hi", "line1\nline2").compose()
}

fn transmitter() -> Transmitter {
    Transmitter::new(TlsPolicy::default()).unwrap()
}

/// A server that offers XOAUTH2 but never STARTTLS
fn no_starttls(command: &str) -> Option<SmtpResponse> {
    let verb = command.split_whitespace().next().unwrap_or("").to_uppercase();
    match verb.as_str() {
        "EHLO" => Some(SmtpResponse::new_multiline(
            "250",
            "test.local",
            vec!["8BITMIME".to_owned(), "AUTH PLAIN XOAUTH2".to_owned()],
        )),
        "QUIT" => None,
        _ => Some(SmtpResponse::new("502", "Command not implemented")),
    }
}

/// A server that advertises STARTTLS but refuses to start it
fn starttls_refused(command: &str) -> Option<SmtpResponse> {
    let verb = command.split_whitespace().next().unwrap_or("").to_uppercase();
    match verb.as_str() {
        "EHLO" => Some(SmtpResponse::new_multiline(
            "250",
            "test.local",
            vec!["STARTTLS".to_owned(), "AUTH XOAUTH2".to_owned()],
        )),
        "STARTTLS" => Some(SmtpResponse::new("454", "TLS not available due to temporary reason")),
        "QUIT" => None,
        _ => Some(SmtpResponse::new("530", "Must issue a STARTTLS command first")),
    }
}

#[test]
fn test_server_without_starttls_is_refused() {
    let (port, rx) = start_test_server(greeting(), no_starttls);
    let mut session = session(port);
    let message = message();

    let result = transmitter().send(&mut session, &message);
    assert!(matches!(
        result,
        Err(SendError::Transport(TransportError::Insecure(_)))
    ));
    assert_eq!(session.state(), TransmitState::Failed);
    assert_eq!(session.failed_in(), Some(TransmitState::TlsNegotiating));

    // Nothing beyond EHLO reached the server, the token least of all
    let lines = received_lines(&rx);
    assert_eq!(lines, vec!["EHLO localhost".to_owned()]);
}

#[test]
fn test_starttls_rejected() {
    let (port, rx) = start_test_server(greeting(), starttls_refused);
    let mut session = session(port);

    let result = transmitter().send(&mut session, &message());
    match result {
        Err(SendError::Transport(TransportError::Rejected { command, reply })) => {
            assert_eq!(command, "STARTTLS");
            assert_eq!(reply.code, "454");
            assert!(reply.is_transient());
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let lines = received_lines(&rx);
    assert_eq!(lines, vec!["EHLO localhost", "STARTTLS"]);
    assert!(lines.iter().all(|l| !l.starts_with("AUTH")));
}

#[test]
fn test_greeting_rejected() {
    let (port, rx) = start_test_server(
        SmtpResponse::new("554", "No SMTP service here"),
        no_starttls,
    );
    let mut session = session(port);

    let result = transmitter().send(&mut session, &message());
    match result {
        Err(SendError::Transport(e @ TransportError::Rejected { .. })) => {
            assert_eq!(e.to_string(), "greeting rejected: 554 No SMTP service here");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(session.failed_in(), Some(TransmitState::Connecting));
    assert!(received_lines(&rx).is_empty());
}

#[test]
fn test_custom_ehlo_name() {
    let (port, rx) = start_test_server(greeting(), no_starttls);
    let transmitter = transmitter().hello_name("client.example.com");

    assert!(transmitter.send(&mut session(port), &message()).is_err());
    assert_eq!(received_lines(&rx), vec!["EHLO client.example.com"]);
}

#[test]
fn test_missing_token_opens_no_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut session = session(port);
    session.token = BearerToken::new("");

    let result = transmitter().send(&mut session, &message());
    assert!(matches!(result, Err(SendError::MissingInput("token"))));
    assert_eq!(session.state(), TransmitState::Init);

    let accepted = listener.accept();
    assert!(matches!(accepted, Err(ref e) if e.kind() == ErrorKind::WouldBlock));
}

#[test]
fn test_plaintext_policy_opens_no_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let plaintext = TlsPolicy {
        mode: TlsMode::None,
        min_version: TlsVersion::Tls12,
    };
    let connector = TcpConnector::new(&TlsPolicy::default()).unwrap();
    let transmitter = Transmitter::with_connector(connector, plaintext);

    let result = transmitter.send(&mut session(port), &message());
    assert!(matches!(
        result,
        Err(SendError::Transport(TransportError::Insecure(_)))
    ));

    let accepted = listener.accept();
    assert!(matches!(accepted, Err(ref e) if e.kind() == ErrorKind::WouldBlock));
}

#[test]
fn test_old_tls_versions_are_refused() {
    for min_version in [TlsVersion::Tls10, TlsVersion::Tls11] {
        let policy = TlsPolicy {
            mode: TlsMode::StartTls,
            min_version,
        };
        assert!(matches!(
            Transmitter::new(policy),
            Err(TransportError::Insecure(_))
        ));
    }
}

#[test]
fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = session(port);
    let result = transmitter().send(&mut session, &message());
    match result {
        Err(SendError::Transport(TransportError::Connect { addr, .. })) => {
            assert_eq!(addr, format!("127.0.0.1:{port}"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(session.failed_in(), Some(TransmitState::Connecting));
}

#[test]
fn test_message_survives_failed_send() {
    let (port, _rx) = start_test_server(greeting(), no_starttls);
    let message = message();
    let before = message.as_bytes().to_vec();

    assert!(transmitter().send(&mut session(port), &message).is_err());

    assert_eq!(message.as_bytes(), before.as_slice());
    assert_eq!(message.body(), b"line1\r\nline2");
}
