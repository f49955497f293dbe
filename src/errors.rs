//! Error handling types for tether.
//!
//! Every failure the bridge can report is a distinct, named variant so callers
//! can tell "your bug" (a second `respond`, an unknown header) apart from
//! "the environment changed" (the server was closed underneath the request).
//!
//! # Examples
//!
//! ```rust,ignore
//! use tether::errors::{RequestError, TetherError};
//!
//! match request.respond(200, &[("content-type", "text/plain")], "ok") {
//!     Ok(()) => {}
//!     Err(TetherError::Request(RequestError::ServerClosed)) => {
//!         // the listener set is gone, nobody is there to answer
//!     }
//!     Err(other) => eprintln!("respond failed: {}", other),
//! }
//! ```

use thiserror::Error;

/// Main error type for tether operations.
///
/// Configuration and transport errors surface from server construction,
/// request errors from the [`Request`](crate::Request) handle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TetherError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bind, listen or reopen failures, with the transport's error text
    #[error("Connection error: {0}")]
    Connection(String),

    /// Server startup errors
    #[error("Failed to start server: {0}")]
    Start(#[from] StartError),

    /// Misuse of a request handle or a response the engine can't carry
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// The server's shared state was torn down while a stream was in flight
    #[error("Server is gone")]
    ServerGone,
}

/// Configuration-related errors.
///
/// Reported synchronously at the point of the offending call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// No runtime handle was supplied and none is current
    #[error("No event loop: construct the server inside a tokio runtime or pass a handle")]
    NoEventLoop,

    /// The socket list is empty
    #[error("No listeners")]
    NoListeners,

    /// An interface or host could not be turned into a socket address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Certificate or key material is missing or malformed
    #[error("Invalid security config: {0}")]
    Security(String),

    /// A configuration file could not be read or parsed
    #[error("Invalid config file: {0}")]
    File(String),
}

/// Server startup errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StartError {
    /// TLS/SSL initialization errors
    #[error("Tls initialization: {0}")]
    Tls(String),
}

/// Errors raised by the single-shot request handle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    /// `respond` was already called on this request
    #[error("request already responded")]
    AlreadyResponded,

    /// An attribute was read after the response was sent
    #[error("request no longer accessible: the response has been sent")]
    NotAccessible,

    /// Every listener of the owning server has been closed
    #[error("server already closed")]
    ServerClosed,

    /// The header name is not in the engine's header table
    #[error("unknown header `{0}`")]
    UnknownHeader(String),

    /// The header value contains bytes that can't go on the wire
    #[error("invalid value for header `{0}`")]
    InvalidHeaderValue(String),

    /// The status code is outside 200..=999
    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    /// The reason phrase contains bytes that can't go on the wire
    #[error("invalid reason phrase")]
    InvalidReason,
}
