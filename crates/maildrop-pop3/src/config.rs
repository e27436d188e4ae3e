//! Server configuration types.
//!
//! A [`ServerConfig`] is built once through [`ServerConfigBuilder`] and is
//! immutable afterwards. `build()` validates every option, so a server never
//! starts with a half-specified TLS setup or an unusable id length.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::{DEFAULT_ID_LENGTH, MAX_ID_LENGTH, MIN_ID_LENGTH};
use crate::{Error, Result};

/// Default plaintext POP3 port.
pub const DEFAULT_PORT: u16 = 110;

/// Default POP3-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 995;

/// Default greeting text after `+OK`.
pub const DEFAULT_BANNER: &str = "POP3 server ready";

/// Default idle timeout (RFC 1939 asks for at least 10 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default timeout of one backend round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS key material, all in PEM format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Certificate chain.
    pub cert_path: PathBuf,
    /// Private key.
    pub key_path: PathBuf,
    /// Trust roots for optional client certificates.
    pub ca_path: Option<PathBuf>,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    host: String,
    port: u16,
    tls: Option<TlsConfig>,
    force_secure: bool,
    banner: String,
    idle_timeout: Duration,
    max_connections: usize,
    session_id_length: usize,
    backend_timeout: Duration,
    implementation: String,
}

impl ServerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Listening host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listening port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` for binding.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TLS material, if connections are encrypted.
    #[must_use]
    pub const fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Whether sessions are marked secure regardless of transport, e.g.
    /// behind a TLS-terminating proxy.
    #[must_use]
    pub const fn force_secure(&self) -> bool {
        self.force_secure
    }

    /// Greeting text after `+OK`.
    #[must_use]
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Idle timeout; zero disables it.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Connection cap; zero means unlimited.
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Length of generated session ids.
    #[must_use]
    pub const fn session_id_length(&self) -> usize {
        self.session_id_length
    }

    /// Timeout of one backend round trip.
    #[must_use]
    pub const fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }

    /// Name advertised by the CAPA `IMPLEMENTATION` line.
    #[must_use]
    pub fn implementation(&self) -> &str {
        &self.implementation
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tls: None,
            force_secure: false,
            banner: DEFAULT_BANNER.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: 0,
            session_id_length: DEFAULT_ID_LENGTH,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            implementation: concat!("maildrop-", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Builder for server configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    force_secure: bool,
    banner: Option<String>,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    session_id_length: Option<usize>,
    backend_timeout: Option<Duration>,
    implementation: Option<String>,
}

impl ServerConfigBuilder {
    /// Creates a builder with every option at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listening host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the port. Defaults to 110, or 995 with TLS.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the certificate chain file.
    #[must_use]
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(path.into());
        self
    }

    /// Sets the private key file.
    #[must_use]
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Sets the trust roots for client certificates.
    #[must_use]
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Marks every session secure regardless of transport.
    #[must_use]
    pub const fn force_secure(mut self, force: bool) -> Self {
        self.force_secure = force;
        self
    }

    /// Sets the greeting text.
    #[must_use]
    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    /// Sets the idle timeout; zero disables it.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the connection cap; zero means unlimited.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the session id length.
    #[must_use]
    pub const fn session_id_length(mut self, length: usize) -> Self {
        self.session_id_length = Some(length);
        self
    }

    /// Sets the backend round-trip timeout.
    #[must_use]
    pub const fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    /// Sets the CAPA implementation name.
    #[must_use]
    pub fn implementation(mut self, name: impl Into<String>) -> Self {
        self.implementation = Some(name.into());
        self
    }

    /// Validates the options and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if only one of certificate and key is set, a
    /// CA is given without them, the id length is out of range, the backend
    /// timeout is zero, or the banner contains a line break.
    pub fn build(self) -> Result<ServerConfig> {
        let defaults = ServerConfig::default();

        let tls = match (self.cert_path, self.key_path) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
                ca_path: self.ca_path,
            }),
            (None, None) if self.ca_path.is_some() => {
                return Err(Error::Config(
                    "TLS CA given without certificate and key".to_string(),
                ));
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Config("TLS certificate given without key".to_string()));
            }
            (None, Some(_)) => {
                return Err(Error::Config("TLS key given without certificate".to_string()));
            }
        };

        let session_id_length = self.session_id_length.unwrap_or(DEFAULT_ID_LENGTH);
        if !(MIN_ID_LENGTH..=MAX_ID_LENGTH).contains(&session_id_length) {
            return Err(Error::Config(format!(
                "session id length must be between {MIN_ID_LENGTH} and {MAX_ID_LENGTH}, got {session_id_length}"
            )));
        }

        let backend_timeout = self.backend_timeout.unwrap_or(DEFAULT_BACKEND_TIMEOUT);
        if backend_timeout.is_zero() {
            return Err(Error::Config("backend timeout must be non-zero".to_string()));
        }

        let banner = self.banner.unwrap_or(defaults.banner);
        if banner.contains(['\r', '\n']) {
            return Err(Error::Config("banner must be a single line".to_string()));
        }

        let port = self.port.unwrap_or(if tls.is_some() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        });

        Ok(ServerConfig {
            host: self.host.unwrap_or(defaults.host),
            port,
            tls,
            force_secure: self.force_secure,
            banner,
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            max_connections: self.max_connections,
            session_id_length,
            backend_timeout,
            implementation: self.implementation.unwrap_or(defaults.implementation),
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
    fn test_defaults() {
        let config = ServerConfig::builder().build().unwrap();
        assert_eq!(config.host(), "0.0.0.0");
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.tls(), None);
        assert_eq!(config.banner(), DEFAULT_BANNER);
        assert_eq!(config.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.max_connections(), 0);
        assert_eq!(config.session_id_length(), DEFAULT_ID_LENGTH);
        assert_eq!(config.backend_timeout(), DEFAULT_BACKEND_TIMEOUT);
        assert!(config.implementation().starts_with("maildrop-"));
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .host("127.0.0.1")
            .port(1110)
            .banner("welcome")
            .idle_timeout(Duration::ZERO)
            .max_connections(5)
            .session_id_length(32)
            .build()
            .unwrap();

        assert_eq!(config.bind_address(), "127.0.0.1:1110");
        assert_eq!(config.banner(), "welcome");
        assert!(config.idle_timeout().is_zero());
        assert_eq!(config.max_connections(), 5);
        assert_eq!(config.session_id_length(), 32);
    }

    #[test]
    fn test_tls_default_port() {
        let config = ServerConfig::builder()
            .cert_path("cert.pem")
            .key_path("key.pem")
            .build()
            .unwrap();

        assert_eq!(config.port(), DEFAULT_TLS_PORT);
        let tls = config.tls().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
        assert_eq!(tls.ca_path, None);
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        assert!(matches!(
            ServerConfig::builder().cert_path("cert.pem").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::builder().key_path("key.pem").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::builder().ca_path("ca.pem").build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::builder().session_id_length(4).build().is_err());
        assert!(ServerConfig::builder().session_id_length(1000).build().is_err());
        assert!(
            ServerConfig::builder()
                .backend_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(ServerConfig::builder().banner("a\r\nb").build().is_err());
    }
}
