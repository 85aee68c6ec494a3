//! Command-line configuration

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::{debug, warn};
use serde::Deserialize;

use crate::smtp::{BearerToken, SendError, TlsMode, TlsPolicy, TlsVersion, TransmitSession};

/// Default SMTP server
pub const DEFAULT_SMTP_HOST: &str = "smtp.office365.com";

/// Default SMTP port (submission with STARTTLS)
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Subject used when none is given
pub const DEFAULT_SUBJECT: &str = "No subject";

/// Send an HTML email over SMTP with an OAuth2 access token (XOAUTH2)
#[derive(Parser, Debug, Clone)]
#[command(name = "tokenmail", version, about)]
pub struct Cli {
    /// SMTP server host
    #[arg(short = 's', long, env = "SMTP_SERVER", default_value = DEFAULT_SMTP_HOST)]
    pub server: String,

    /// SMTP server port
    #[arg(short = 'P', long, env = "SMTP_PORT", default_value_t = DEFAULT_SMTP_PORT)]
    pub port: u16,

    /// Sender display name
    #[arg(short = 'n', long)]
    pub from_name: Option<String>,

    /// Sender email address
    #[arg(short = 'f', long)]
    pub from: Option<String>,

    /// Recipient email address
    #[arg(short = 't', long)]
    pub to: Option<String>,

    /// Email subject
    #[arg(short = 'j', long, default_value = DEFAULT_SUBJECT)]
    pub subject: String,

    /// SMTP username, usually the mailbox UPN
    #[arg(short = 'u', long, env = "SMTP_USERNAME")]
    pub username: Option<String>,

    /// OAuth2 access token
    #[arg(short = 'T', long, env = "SMTP_OAUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the access token, raw or as JSON with an `access_token` field.
    /// Takes precedence over `--token` and SMTP_OAUTH_TOKEN
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// HTML body file
    #[arg(short = 'F', long)]
    pub file: Option<PathBuf>,

    /// Channel encryption; defaults to implicit TLS on port 465, STARTTLS otherwise
    #[arg(long, value_enum)]
    pub tls: Option<TlsArg>,

    /// Minimum TLS version
    #[arg(long, value_enum, default_value_t = MinTlsArg::V1_2)]
    pub min_tls: MinTlsArg,

    /// Name announced in EHLO
    #[arg(long, default_value = "localhost")]
    pub ehlo_name: String,

    /// Increase log verbosity (-v info, -vv protocol transcript)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsArg {
    Starttls,
    Implicit,
    None,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsArg {
    #[value(name = "1.0")]
    V1_0,
    #[value(name = "1.1")]
    V1_1,
    #[value(name = "1.2")]
    V1_2,
    #[value(name = "1.3")]
    V1_3,
}

impl From<MinTlsArg> for TlsVersion {
    fn from(arg: MinTlsArg) -> Self {
        match arg {
            MinTlsArg::V1_0 => TlsVersion::Tls10,
            MinTlsArg::V1_1 => TlsVersion::Tls11,
            MinTlsArg::V1_2 => TlsVersion::Tls12,
            MinTlsArg::V1_3 => TlsVersion::Tls13,
        }
    }
}

/// Validated settings for one send
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub port: u16,
    pub from_name: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub username: String,
    pub token: BearerToken,
    pub body_file: PathBuf,
    pub tls: TlsPolicy,
    pub ehlo_name: String,
}

impl Config {
    /// Check required values and load the token.
    ///
    /// Missing values are reported before any file is touched; the token file
    /// is the only thing read here.
    pub fn from_cli(cli: Cli) -> Result<Self, SendError> {
        let from = required(cli.from, "from")?;
        let to = required(cli.to, "to")?;
        let username = required(cli.username, "username")?;
        let body_file = cli.file.ok_or(SendError::MissingInput("file"))?;

        let token = match (cli.token_file, cli.token) {
            (Some(path), _) => load_token(&path)?,
            (None, Some(token)) if !token.trim().is_empty() => BearerToken::new(token.trim()),
            _ => return Err(SendError::MissingInput("token")),
        };

        let mode = match cli.tls {
            Some(TlsArg::Starttls) => TlsMode::StartTls,
            Some(TlsArg::Implicit) => TlsMode::Implicit,
            Some(TlsArg::None) => TlsMode::None,
            None => TlsMode::for_port(cli.port),
        };

        Ok(Self {
            server: cli.server,
            port: cli.port,
            from_name: cli.from_name,
            from,
            to,
            subject: cli.subject,
            username,
            token,
            body_file,
            tls: TlsPolicy {
                mode,
                min_version: cli.min_tls.into(),
            },
            ehlo_name: cli.ehlo_name,
        })
    }

    /// Create the transmit session described by this configuration
    pub fn session(&self) -> TransmitSession {
        TransmitSession::new(
            &self.server,
            self.port,
            &self.from,
            &self.to,
            &self.username,
            self.token.clone(),
        )
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, SendError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SendError::MissingInput(field)),
    }
}

/// Read the HTML body
pub fn load_body(path: &Path) -> Result<String, SendError> {
    let body = fs::read_to_string(path).map_err(|source| SendError::BodySource {
        path: path.to_owned(),
        source,
    })?;
    debug!("Read {} bytes of HTML from {}", body.len(), path.display());
    Ok(body)
}

/// Token cache written by an OAuth2 helper
#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    obtained_at: Option<i64>,
}

impl TokenFile {
    /// Unix time the token expires at, when the file records it
    fn expires_at(&self) -> Option<i64> {
        Some(self.obtained_at? + self.expires_in?)
    }
}

/// Read an access token from a raw token file or a JSON token cache
pub fn load_token(path: &Path) -> Result<BearerToken, SendError> {
    let token_source = |reason: String| SendError::TokenSource {
        path: path.to_owned(),
        reason,
    };

    let contents = fs::read_to_string(path).map_err(|e| token_source(e.to_string()))?;
    let contents = contents.trim();

    let token = if contents.starts_with('{') {
        let file: TokenFile =
            serde_json::from_str(contents).map_err(|e| token_source(e.to_string()))?;
        let now = Utc::now().timestamp();
        if let Some(expires_at) = file.expires_at().filter(|&at| at <= now) {
            warn!(
                "Access token in {} expired at {expires_at}; the server will likely reject it",
                path.display()
            );
        }
        file.access_token
    } else {
        contents.to_owned()
    };

    if token.trim().is_empty() {
        return Err(SendError::MissingInput("token"));
    }
    Ok(BearerToken::new(token.trim()))
}
