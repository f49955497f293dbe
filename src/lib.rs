//! # tether
//!
//! **Embeds an HTTP/1 and HTTP/2 engine in your tokio runtime and hands every
//! request to your code through a single-shot handle.**
//!
//! tether owns the boring and the dangerous parts of serving HTTP from an
//! application: binding and closing sockets, accepting connections,
//! negotiating TLS and HTTP/2, and making sure every request gets exactly one
//! response. Your code sees one [`Request`] per inbound request and answers
//! it with [`Request::respond`], whenever and from wherever it likes.
//!
//! ## Features
//!
//! - **One request, one response**: a request answers once; afterwards every
//!   accessor fails with a distinct error instead of reading stale data
//! - **No hung streams**: a request dropped without an answer sends a `500`
//! - **Deferred answers**: move the request into a task and answer later
//! - **TLS with ALPN**: HTTP/2 over TLS when the client offers `h2`
//! - **Orderly shutdown**: [`Server::close`] is idempotent and
//!   [`Server::wait_closed`] confirms every socket was released
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use tether::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .listener("127.0.0.1:8080".parse::<std::net::SocketAddr>()?)
//!         .serve(|mut request| {
//!             let body = format!("you asked for {}", request.path()?);
//!             request.respond(200, &[("content-type", "text/plain")], body)?;
//!             Ok(())
//!         })?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.close();
//!     server.wait_closed().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **[`Server`]**: handle over the listeners, the protocol context and the
//!   application callback
//! - **[`Request`]**: the single-shot handle passed to the callback
//! - **[`server::listener`]**: sockets and their two-phase close
//! - **[`server::dispatch`]**: the callback boundary and [`DispatchLock`]
//!
//! ## Modules
//!
//! - [`config`]: Server, listener and TLS configuration builders
//! - [`errors`]: Error types
//! - [`headers`]: The header table response headers are checked against
//! - [`server`]: Server lifecycle, listeners, connections and dispatch

#[cfg(not(any(feature = "__rustls_aws_lc_rs", feature = "__rustls_ring")))]
compile_error!("tether requires a rustls crypto provider: enable `rustls-provider` or `__rustls_ring`");

use std::{error::Error, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;

pub mod config;
pub mod errors;
pub mod headers;
mod request;
pub mod server;
#[cfg(test)]
mod tests;

pub use config::Protocol;
pub use request::Request;
pub use server::{
    dispatch::{async_callback, Callback, DispatchLock},
    ListenerSource, Server, ServerBuilder,
};

/// Accept backlog used when none is given.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Request body cap used when none is given (1 GiB).
pub const DEFAULT_MAX_REQUEST_BODY: usize = 1024 * 1024 * 1024;

/// Error type application callbacks return.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A TLS server configuration. ALPN is set by the server.
pub type TlsContext = Arc<rustls::ServerConfig>;

pub(crate) type ResponseType = http::Response<Full<Bytes>>;
