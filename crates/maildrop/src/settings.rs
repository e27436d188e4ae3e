//! Command-line flags and the optional JSON settings file.
//!
//! Every setting can come from either source; a flag wins over the file,
//! and the file wins over the library default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use maildrop_pop3::ServerConfig;
use serde::Deserialize;

/// POP3 server for JSON-defined mailboxes
#[derive(Parser, Debug, Default)]
#[command(name = "maildrop")]
#[command(about = "POP3 server serving mailboxes from a JSON fixture")]
#[command(version)]
pub struct Args {
    /// JSON settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON mailbox fixture
    #[arg(short, long)]
    pub mailbox: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (default 110, or 995 with TLS)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to TLS certificate (PEM format)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Path to CA certificates for client certificates (PEM format)
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Mark sessions secure even without TLS (e.g. behind a TLS proxy)
    #[arg(long)]
    pub force_secure: bool,

    /// Greeting text
    #[arg(long)]
    pub banner: Option<String>,

    /// Idle timeout in seconds, 0 disables
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum concurrent connections, 0 for unlimited
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Length of generated session ids
    #[arg(long)]
    pub session_id_length: Option<usize>,

    /// Backend request timeout in seconds
    #[arg(long)]
    pub backend_timeout: Option<u64>,

    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Settings file contents. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub mailbox: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub force_secure: bool,
    pub banner: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub session_id_length: Option<usize>,
    pub backend_timeout_secs: Option<u64>,
    pub implementation: Option<String>,
    pub log_level: Option<String>,
}

impl FileSettings {
    /// Reads a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid settings file '{}'", path.display()))
    }
}

/// Fully merged settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub mailbox: PathBuf,
    pub log_level: Option<String>,
}

impl Settings {
    /// Merges flags over the settings file and validates the result.
    pub fn resolve(args: Args, file: FileSettings) -> Result<Self> {
        let mailbox = args
            .mailbox
            .or(file.mailbox)
            .context("no mailbox fixture given (use --mailbox or \"mailbox\" in the settings file)")?;

        let mut builder = ServerConfig::builder().force_secure(args.force_secure || file.force_secure);

        if let Some(host) = args.host.or(file.host) {
            builder = builder.host(host);
        }
        if let Some(port) = args.port.or(file.port) {
            builder = builder.port(port);
        }
        if let Some(cert) = args.cert.or(file.cert) {
            builder = builder.cert_path(cert);
        }
        if let Some(key) = args.key.or(file.key) {
            builder = builder.key_path(key);
        }
        if let Some(ca) = args.ca.or(file.ca) {
            builder = builder.ca_path(ca);
        }
        if let Some(banner) = args.banner.or(file.banner) {
            builder = builder.banner(banner);
        }
        if let Some(secs) = args.idle_timeout.or(file.idle_timeout_secs) {
            builder = builder.idle_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = args.max_connections.or(file.max_connections) {
            builder = builder.max_connections(max);
        }
        if let Some(length) = args.session_id_length.or(file.session_id_length) {
            builder = builder.session_id_length(length);
        }
        if let Some(secs) = args.backend_timeout.or(file.backend_timeout_secs) {
            builder = builder.backend_timeout(Duration::from_secs(secs));
        }
        if let Some(name) = file.implementation {
            builder = builder.implementation(name);
        }

        let server = builder.build().context("invalid server settings")?;

        Ok(Self {
            server,
            mailbox,
            log_level: args.log_level.or(file.log_level),
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let file: FileSettings = serde_json::from_str(
            r#"{
                "mailbox": "from-file.json",
                "port": 2110,
                "banner": "file banner",
                "idle_timeout_secs": 30,
                "max_connections": 4
            }"#,
        )
        .unwrap();

        let args = Args::parse_from(["maildrop", "--port", "3110", "--max-connections", "9"]);
        let settings = Settings::resolve(args, file).unwrap();

        assert_eq!(settings.mailbox, PathBuf::from("from-file.json"));
        assert_eq!(settings.server.port(), 3110);
        assert_eq!(settings.server.banner(), "file banner");
        assert_eq!(settings.server.idle_timeout(), Duration::from_secs(30));
        assert_eq!(settings.server.max_connections(), 9);
    }

    #[test]
    fn test_mailbox_required() {
        let result = Settings::resolve(Args::default(), FileSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_half_tls_rejected() {
        let args = Args::parse_from(["maildrop", "--mailbox", "m.json", "--cert", "cert.pem"]);
        assert!(Settings::resolve(args, FileSettings::default()).is_err());
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let result: std::result::Result<FileSettings, _> =
            serde_json::from_str(r#"{ "prot": 110 }"#);
        assert!(result.is_err());
    }
}
