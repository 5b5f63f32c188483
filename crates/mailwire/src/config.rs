//! Connection configuration.

use std::time::Duration;

/// Delay after the send queue drains before the idle notification fires.
pub const ENTER_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Fixed lower bound of the per-write socket timeout.
pub const SOCKET_TIMEOUT_FLOOR: Duration = Duration::from_millis(10_000);

/// Additional socket-timeout milliseconds granted per outbound byte.
pub const SOCKET_TIMEOUT_PER_BYTE_MS: f64 = 0.1;

/// Default port for plaintext and STARTTLS connections.
pub const DEFAULT_PORT: u16 = 143;

/// Default port for implicit-TLS connections.
pub const DEFAULT_SECURE_PORT: u16 = 993;

/// IMAP connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connect with implicit TLS. Always true when `port` is 993.
    pub secure: bool,
    /// Additional trusted root certificates, DER-encoded.
    pub extra_roots: Vec<Vec<u8>>,
    /// Run the DEFLATE codec on a dedicated worker thread.
    pub offload_compression: bool,
    /// Identifier attached to this connection's log span.
    pub session_id: Option<String>,
    /// Timeout for socket establishment.
    pub connect_timeout: Duration,
    /// Delay before the idle notification fires once the queue drains.
    pub enter_idle_timeout: Duration,
    /// Fixed part of the per-write socket timeout.
    pub socket_timeout_floor: Duration,
    /// Per-byte part of the per-write socket timeout, in milliseconds.
    pub socket_timeout_per_byte_ms: f64,
}

impl Config {
    /// Creates a plaintext configuration on the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            secure: false,
            extra_roots: Vec::new(),
            offload_compression: false,
            session_id: None,
            connect_timeout: Duration::from_secs(30),
            enter_idle_timeout: ENTER_IDLE_TIMEOUT,
            socket_timeout_floor: SOCKET_TIMEOUT_FLOOR,
            socket_timeout_per_byte_ms: SOCKET_TIMEOUT_PER_BYTE_MS,
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Computes the socket timeout for a write of `bytes` octets.
    ///
    /// The timeout grows with the write size so large literals over slow
    /// links are not cut off prematurely.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn socket_timeout(&self, bytes: usize) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let extra = (bytes as f64 * self.socket_timeout_per_byte_ms).floor() as u64;
        self.socket_timeout_floor + Duration::from_millis(extra)
    }
}

/// Builder for connection configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    secure: bool,
    extra_roots: Vec<Vec<u8>>,
    offload_compression: bool,
    session_id: Option<String>,
    connect_timeout: Duration,
    enter_idle_timeout: Duration,
    socket_timeout_floor: Duration,
    socket_timeout_per_byte_ms: f64,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let base = Config::new(host);
        Self {
            host: base.host,
            port: None,
            secure: false,
            extra_roots: Vec::new(),
            offload_compression: false,
            session_id: None,
            connect_timeout: base.connect_timeout,
            enter_idle_timeout: base.enter_idle_timeout,
            socket_timeout_floor: base.socket_timeout_floor,
            socket_timeout_per_byte_ms: base.socket_timeout_per_byte_ms,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Requests implicit TLS.
    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Adds a trusted root certificate (DER).
    #[must_use]
    pub fn extra_root(mut self, der: Vec<u8>) -> Self {
        self.extra_roots.push(der);
        self
    }

    /// Runs the DEFLATE codec on a dedicated worker thread.
    #[must_use]
    pub const fn offload_compression(mut self, offload: bool) -> Self {
        self.offload_compression = offload;
        self
    }

    /// Attaches an identifier to the connection's log span.
    #[must_use]
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the delay before the idle notification fires.
    #[must_use]
    pub const fn enter_idle_timeout(mut self, timeout: Duration) -> Self {
        self.enter_idle_timeout = timeout;
        self
    }

    /// Sets the fixed part of the per-write socket timeout.
    #[must_use]
    pub const fn socket_timeout_floor(mut self, timeout: Duration) -> Self {
        self.socket_timeout_floor = timeout;
        self
    }

    /// Sets the per-byte part of the per-write socket timeout.
    #[must_use]
    pub const fn socket_timeout_per_byte_ms(mut self, ms: f64) -> Self {
        self.socket_timeout_per_byte_ms = ms;
        self
    }

    /// Builds the configuration.
    ///
    /// Port 993 forces implicit TLS; a secure configuration with no explicit
    /// port lands on 993, anything else on 143.
    #[must_use]
    pub fn build(self) -> Config {
        let secure = self.secure || self.port == Some(DEFAULT_SECURE_PORT);
        let port = self.port.unwrap_or(if secure {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        });
        Config {
            host: self.host,
            port,
            secure,
            extra_roots: self.extra_roots,
            offload_compression: self.offload_compression,
            session_id: self.session_id,
            connect_timeout: self.connect_timeout,
            enter_idle_timeout: self.enter_idle_timeout,
            socket_timeout_floor: self.socket_timeout_floor,
            socket_timeout_per_byte_ms: self.socket_timeout_per_byte_ms,
        }
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
        let config = Config::new("imap.example.com");
        assert_eq!(config.host, "imap.example.com");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.secure);
        assert_eq!(config.enter_idle_timeout, Duration::from_millis(1000));
        assert_eq!(config.socket_timeout_floor, Duration::from_millis(10_000));
    }

    #[test]
    fn test_secure_defaults_to_993() {
        let config = Config::builder("imap.example.com").secure(true).build();
        assert_eq!(config.port, DEFAULT_SECURE_PORT);
        assert!(config.secure);
    }

    #[test]
    fn test_port_993_forces_secure() {
        let config = Config::builder("imap.example.com").port(993).build();
        assert!(config.secure);
    }

    #[test]
    fn test_explicit_port_kept() {
        let config = Config::builder("localhost").port(1143).build();
        assert_eq!(config.port, 1143);
        assert!(!config.secure);
    }

    #[test]
    fn test_socket_timeout_scales_with_size() {
        let config = Config::new("localhost");
        assert_eq!(config.socket_timeout(0), Duration::from_millis(10_000));
        // 0.1 ms per byte: one megabyte adds roughly 100 seconds
        assert_eq!(
            config.socket_timeout(1_000_000),
            Duration::from_millis(110_000)
        );
        // fractional milliseconds are floored
        assert_eq!(config.socket_timeout(15), Duration::from_millis(10_001));
    }

    #[test]
    fn test_builder_session_id() {
        let config = Config::builder("localhost").session_id("acct-7").build();
        assert_eq!(config.session_id.as_deref(), Some("acct-7"));
    }
}
