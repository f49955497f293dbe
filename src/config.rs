//! Configuration builders and types for tether servers.
//!
//! This module provides a fluent builder API for configuring:
//! - Listeners (interfaces and ports to bind)
//! - Engine settings (backlog, keep-alive, callback serialisation)
//! - Security/TLS material (DER certificate and key)
//!
//! The same types deserialize from YAML, which is what the `tether` binary
//! reads with `--config`.
//!
//! # Examples
//!
//! ```rust,ignore
//! use tether::config::{ListenerConfig, SecurityConfig, ServerConfig};
//!
//! let listener = ListenerConfig::builder()
//!     .interface("127.0.0.1")
//!     .port(8443)
//!     .build()?;
//!
//! let security = SecurityConfig::builder()
//!     .cert_from_file("server.der")
//!     .key_from_file("server.key.der")
//!     .build()?;
//!
//! let config = ServerConfig::builder()
//!     .add_listener(listener)
//!     .backlog(256)
//!     .security(security)
//!     .build()?;
//! ```

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use serde::Deserialize;

use crate::{
    errors::{ConfigError, TetherError},
    DEFAULT_BACKLOG, DEFAULT_MAX_REQUEST_BODY,
};

/// The HTTP protocol spoken on a connection.
///
/// Chosen once when the connection is accepted: TLS connections that
/// negotiate `h2` speak HTTP/2, everything else speaks HTTP/1.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    #[cfg(feature = "http2")]
    Http2,
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_true() -> bool {
    true
}

fn default_max_request_body() -> usize {
    DEFAULT_MAX_REQUEST_BODY
}

/// Builder for creating `ListenerConfig` instances.
///
/// # Examples
///
/// ```rust,ignore
/// use tether::config::ListenerConfig;
///
/// let config = ListenerConfig::builder()
///     .port(8080)
///     .interface("127.0.0.1")
///     .build()?;
/// ```
#[derive(Clone)]
pub struct ListenerConfigBuilder {
    port: u16,
    interface: String,
}

impl ListenerConfigBuilder {
    /// Sets the port number for the listener. Port `0` asks the OS for a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the network interface to bind to.
    ///
    /// Common values:
    /// - "0.0.0.0" - All IPv4 interfaces
    /// - "127.0.0.1" - Localhost only
    /// - "::" - All IPv6 interfaces
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    /// Creates the `ListenerConfig`, checking that the interface is an IP address.
    pub fn build(self) -> Result<ListenerConfig, TetherError> {
        let config = ListenerConfig { port: self.port, interface: self.interface };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration for a single listening socket.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ListenerConfig {
    #[serde(default = "default_interface")]
    interface: String,
    #[serde(default)]
    port: u16,
}

impl ListenerConfig {
    /// Creates a new `ListenerConfigBuilder` with default settings.
    ///
    /// Default values:
    /// - port: 80
    /// - interface: "0.0.0.0"
    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder { port: 80, interface: default_interface() }
    }

    /// Returns the port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the network interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Returns the socket address this listener binds.
    pub fn socket_addr(&self) -> Result<SocketAddr, TetherError> {
        let ip = self
            .interface
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(self.interface.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    fn validate(&self) -> Result<(), TetherError> {
        self.socket_addr()
            .map(|_| ())
    }
}

/// Builder for creating `ServerConfig` instances.
///
/// # Examples
///
/// ```rust,ignore
/// use tether::config::{ListenerConfig, ServerConfig};
///
/// let config = ServerConfig::builder()
///     .add_listener(ListenerConfig::builder().port(80).build()?)
///     .add_listener(ListenerConfig::builder().interface("::").port(80).build()?)
///     .keep_alive(false)
///     .build()?;
/// ```
#[derive(Clone)]
pub struct ServerConfigBuilder {
    listeners: Vec<ListenerConfig>,
    backlog: u32,
    keep_alive: bool,
    serialize_callbacks: bool,
    max_request_body: usize,
    security: Option<SecurityConfig>,
}

impl ServerConfigBuilder {
    /// Adds a listener configuration to the server.
    pub fn add_listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners
            .push(listener);
        self
    }

    /// Sets the accept backlog passed to `listen(2)` for every socket.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Enables or disables HTTP/1 keep-alive.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Controls whether callback invocations are serialised behind the
    /// process-wide dispatch lock.
    pub fn serialize_callbacks(mut self, serialize_callbacks: bool) -> Self {
        self.serialize_callbacks = serialize_callbacks;
        self
    }

    /// Sets the largest request body, in bytes, handed to the callback.
    /// Requests with a larger body are answered `413` by the engine.
    pub fn max_request_body(mut self, max_request_body: usize) -> Self {
        self.max_request_body = max_request_body;
        self
    }

    /// Sets the TLS material. Connections on every listener are then TLS.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    /// Creates the `ServerConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoListeners`] if no listener was added.
    pub fn build(self) -> Result<ServerConfig, TetherError> {
        let config = ServerConfig {
            listeners: self.listeners,
            backlog: self.backlog,
            keep_alive: self.keep_alive,
            serialize_callbacks: self.serialize_callbacks,
            max_request_body: self.max_request_body,
            security: self.security,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Server-wide configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerConfig {
    listeners: Vec<ListenerConfig>,
    #[serde(default = "default_backlog")]
    backlog: u32,
    #[serde(default = "default_true")]
    keep_alive: bool,
    #[serde(default = "default_true")]
    serialize_callbacks: bool,
    #[serde(default = "default_max_request_body")]
    max_request_body: usize,
    #[serde(default)]
    security: Option<SecurityConfig>,
}

impl ServerConfig {
    /// Creates a new `ServerConfigBuilder`.
    ///
    /// Default values:
    /// - listeners: none (at least one is required)
    /// - backlog: 128
    /// - keep_alive: true
    /// - serialize_callbacks: true
    /// - max_request_body: 1 GiB
    /// - security: None
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            listeners: Vec::new(),
            backlog: DEFAULT_BACKLOG,
            keep_alive: true,
            serialize_callbacks: true,
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            security: None,
        }
    }

    /// Parses a YAML document.
    ///
    /// ```yaml
    /// listeners:
    ///   - interface: 127.0.0.1
    ///     port: 8080
    /// backlog: 128
    /// max_request_body: 1048576
    /// security:
    ///   cert_file: server.der
    ///   key_file: server.key.der
    /// ```
    pub fn from_yaml(source: &str) -> Result<ServerConfig, TetherError> {
        let config: ServerConfig =
            serde_yaml_ng::from_str(source).map_err(|e| ConfigError::File(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<ServerConfig, TetherError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&source)
    }

    pub fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn serialize_callbacks(&self) -> bool {
        self.serialize_callbacks
    }

    pub fn max_request_body(&self) -> usize {
        self.max_request_body
    }

    pub fn security(&self) -> Option<&SecurityConfig> {
        self.security
            .as_ref()
    }

    fn validate(&self) -> Result<(), TetherError> {
        if self
            .listeners
            .is_empty()
        {
            return Err(ConfigError::NoListeners.into());
        }
        for listener in &self.listeners {
            listener.validate()?;
        }
        Ok(())
    }
}

/// Builder for creating `SecurityConfig` instances.
///
/// File read failures are kept until [`build`](SecurityConfigBuilder::build)
/// so the builder chain stays infallible.
#[derive(Clone)]
pub struct SecurityConfigBuilder {
    cert: Vec<u8>,
    key: Vec<u8>,
    ca_cert: Option<Vec<u8>>,
    error: Option<ConfigError>,
}

impl SecurityConfigBuilder {
    pub fn cert_from_bytes(mut self, cert: Vec<u8>) -> Self {
        self.cert = cert;
        self
    }

    pub fn cert_from_file(mut self, path: &str) -> Self {
        match read_file(path) {
            Ok(cert) => self.cert = cert,
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn key_from_bytes(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    pub fn key_from_file(mut self, path: &str) -> Self {
        match read_file(path) {
            Ok(key) => self.key = key,
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn ca_cert_from_bytes(mut self, ca_cert: Vec<u8>) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }

    pub fn ca_cert_from_file(mut self, path: &str) -> Self {
        match read_file(path) {
            Ok(ca_cert) => self.ca_cert = Some(ca_cert),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Creates the `SecurityConfig`.
    ///
    /// # Errors
    ///
    /// Returns the first file read failure, or [`ConfigError::Security`] when
    /// the certificate or key is empty.
    pub fn build(self) -> Result<SecurityConfig, TetherError> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        if self
            .cert
            .is_empty()
        {
            return Err(ConfigError::Security("Certificate is empty".to_string()).into());
        }
        if self
            .key
            .is_empty()
        {
            return Err(ConfigError::Security("Key is empty".to_string()).into());
        }
        Ok(SecurityConfig { cert: self.cert, key: self.key, ca_cert: self.ca_cert })
    }
}

/// DER-encoded TLS material for the server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "SecurityFiles")]
pub struct SecurityConfig {
    cert: Vec<u8>,
    key: Vec<u8>,
    ca_cert: Option<Vec<u8>>,
}

impl SecurityConfig {
    pub fn builder() -> SecurityConfigBuilder {
        SecurityConfigBuilder { cert: Vec::new(), key: Vec::new(), ca_cert: None, error: None }
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn ca_cert(&self) -> Option<&[u8]> {
        self.ca_cert
            .as_deref()
    }
}

// File-facing shape of `SecurityConfig`: paths instead of bytes.
#[derive(Deserialize)]
struct SecurityFiles {
    cert_file: String,
    key_file: String,
    ca_cert_file: Option<String>,
}

impl TryFrom<SecurityFiles> for SecurityConfig {
    type Error = TetherError;

    fn try_from(files: SecurityFiles) -> Result<Self, Self::Error> {
        let mut builder = SecurityConfig::builder()
            .cert_from_file(&files.cert_file)
            .key_from_file(&files.key_file);
        if let Some(ca_cert_file) = &files.ca_cert_file {
            builder = builder.ca_cert_from_file(ca_cert_file);
        }
        builder.build()
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|e| ConfigError::File(format!("{}: {}", path, e)))
}
