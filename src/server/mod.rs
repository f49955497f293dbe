//! The server handle and its lifecycle.
//!
//! A [`Server`] is a cheap, cloneable handle over shared state. The shared
//! state is torn down only once the last handle *and* the last outstanding
//! [`Request`](crate::Request) are gone: requests keep the server alive so
//! that their fallback response always has an engine to go to.

use std::{
    future::Future,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, error, info};
use tokio::runtime::Handle;

use crate::{
    config::ServerConfig,
    errors::{ConfigError, TetherError},
    HandlerError, Request, TlsContext, DEFAULT_BACKLOG, DEFAULT_MAX_REQUEST_BODY,
};

pub(crate) mod acceptor;
pub(crate) mod context;
pub mod dispatch;
pub mod listener;
pub mod tls;

use acceptor::Acceptor;
use context::{EngineSettings, ProtocolContext};
use dispatch::{async_callback, Callback, Dispatcher};
use listener::{ListenerHandle, ListenerSet};
use tls::TlsFactory;

pub use listener::ListenerSource;

/// State shared by the server handles, the accept loops (weakly), the
/// connection tasks (weakly) and every live request (strongly).
pub(crate) struct ServerInner {
    listeners: Mutex<ListenerSet>,
    context: ProtocolContext,
    tls: Option<TlsContext>,
}

impl ServerInner {
    pub(crate) fn context(&self) -> &ProtocolContext {
        &self.context
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerSet> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A server with no open listener is closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.listeners()
            .is_empty()
    }

    pub(crate) fn close(&self) {
        let issued = self
            .listeners()
            .close_all();
        if issued > 0 {
            info!("Closing {} listeners", issued);
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.close();
        self.context
            .dispose();
        debug!(
            "Server torn down (tls: {})",
            self.tls
                .is_some()
        );
    }
}

/// Handle to a running server.
///
/// Dropping every handle closes the listeners once no request is
/// outstanding. Call [`Server::close`] to stop accepting right away.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts serving on `sockets`.
    ///
    /// With `tls`, every connection is TLS and negotiates HTTP/2 or HTTP/1.1
    /// through ALPN; without it, connections are plaintext HTTP/1.1.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoListeners`] for an empty socket list, or
    /// [`TetherError::Connection`] with the transport's error text when a
    /// socket can't be opened. Listeners opened before the failure are
    /// closed.
    pub fn new<F>(
        sockets: Vec<ListenerSource>,
        handle: &Handle,
        callback: F,
        tls: Option<TlsContext>,
        backlog: u32,
    ) -> Result<Server, TetherError>
    where
        F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::start(sockets, handle, Arc::new(callback), tls, backlog, EngineSettings::default(), true)
    }

    /// Resolves `host` and `port` and starts serving on every resolved
    /// address.
    pub fn bind<F>(
        host: &str,
        port: u16,
        handle: &Handle,
        callback: F,
        tls: Option<TlsContext>,
        backlog: u32,
    ) -> Result<Server, TetherError>
    where
        F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let sockets = resolve(host, port)?;
        Self::new(sockets, handle, callback, tls, backlog)
    }

    /// Starts serving with a [`ServerConfig`].
    pub fn from_config<F>(config: &ServerConfig, handle: &Handle, callback: F) -> Result<Server, TetherError>
    where
        F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let sockets = config
            .listeners()
            .iter()
            .map(|listener| {
                listener
                    .socket_addr()
                    .map(ListenerSource::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tls = match config.security() {
            Some(security) => Some(TlsFactory::create_tls_context(security)?),
            None => None,
        };

        let settings =
            EngineSettings { keep_alive: config.keep_alive(), max_request_body: config.max_request_body() };

        Self::start(
            sockets,
            handle,
            Arc::new(callback),
            tls,
            config.backlog(),
            settings,
            config.serialize_callbacks(),
        )
    }

    /// Creates a new `ServerBuilder`.
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listeners: Vec::new(),
            handle: None,
            tls: None,
            backlog: DEFAULT_BACKLOG,
            serialize_callbacks: true,
            keep_alive: true,
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
        }
    }

    fn start(
        sockets: Vec<ListenerSource>,
        handle: &Handle,
        callback: Callback,
        tls: Option<TlsContext>,
        backlog: u32,
        settings: EngineSettings,
        serialize_callbacks: bool,
    ) -> Result<Server, TetherError> {
        if sockets.is_empty() {
            return Err(ConfigError::NoListeners.into());
        }

        let tls = tls.map(|context| TlsFactory::register_alpn(&context));

        let mut context = ProtocolContext::new(settings);
        context
            .register_host("default")
            .register_path("/", Arc::new(Dispatcher::new(callback, serialize_callbacks)));

        let inner = Arc::new(ServerInner { listeners: Mutex::new(ListenerSet::default()), context, tls });

        let acceptor = Acceptor::new(
            Arc::downgrade(&inner),
            inner
                .tls
                .clone(),
            inner
                .context
                .settings(),
            inner
                .context
                .shutdown_token(),
        );

        for source in sockets {
            match ListenerHandle::start(source, backlog, handle, acceptor.clone()) {
                Ok(listener) => inner
                    .listeners()
                    .push(listener),
                Err(e) => {
                    error!("Cannot open listener: {}", e);
                    inner.close();
                    return Err(TetherError::Connection(e.to_string()));
                }
            }
        }

        Ok(Server { inner })
    }

    /// Stops accepting on every listener.
    ///
    /// Idempotent. The server counts as closed as soon as this returns;
    /// sockets are released by their accept tasks afterwards, see
    /// [`Server::wait_closed`]. Requests already dispatched can no longer
    /// be answered.
    pub fn close(&self) {
        self.inner
            .close();
    }

    /// Resolves once every closed listener has released its socket.
    pub async fn wait_closed(&self) {
        let closed = self
            .inner
            .listeners()
            .closed();
        closed.await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .is_closed()
    }

    /// Number of open listeners; `0` once closed.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners()
            .len()
    }

    /// Addresses of the open listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners()
            .local_addrs()
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.inner
            .context
            .connection_count()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<ListenerSource>, TetherError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TetherError::Connection(format!("{}:{}: {}", host, port, e)))?;
    let mut sockets = Vec::new();
    for addr in addrs {
        sockets.push(ListenerSource::from(addr));
    }
    if sockets.is_empty() {
        return Err(ConfigError::InvalidAddress(format!("{}:{}", host, port)).into());
    }
    Ok(sockets)
}

/// Builder for [`Server`].
///
/// # Examples
///
/// ```rust,ignore
/// let server = Server::builder()
///     .listener("127.0.0.1:8080".parse::<SocketAddr>()?)
///     .backlog(256)
///     .serve(|mut request| {
///         request.respond(200, &[("content-type", "text/plain")], "hello")?;
///         Ok(())
///     })?;
/// ```
pub struct ServerBuilder {
    listeners: Vec<ListenerSource>,
    handle: Option<Handle>,
    tls: Option<TlsContext>,
    backlog: u32,
    serialize_callbacks: bool,
    keep_alive: bool,
    max_request_body: usize,
}

impl ServerBuilder {
    /// Adds a socket to listen on.
    pub fn listener(mut self, listener: impl Into<ListenerSource>) -> Self {
        self.listeners
            .push(listener.into());
        self
    }

    /// Sets the runtime the server runs on. Defaults to the current one.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Controls whether callback invocations are serialised behind the
    /// process-wide dispatch lock. Enabled by default.
    pub fn serialize_callbacks(mut self, serialize_callbacks: bool) -> Self {
        self.serialize_callbacks = serialize_callbacks;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the largest request body, in bytes, handed to the callback.
    /// Larger ones are answered `413 Payload Too Large` without a dispatch.
    pub fn max_request_body(mut self, max_request_body: usize) -> Self {
        self.max_request_body = max_request_body;
        self
    }

    /// Starts the server with `callback`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoEventLoop`] when no handle was set and the caller is
    /// outside a tokio runtime, plus everything [`Server::new`] reports.
    pub fn serve<F>(self, callback: F) -> Result<Server, TetherError>
    where
        F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ConfigError::NoEventLoop)?,
        };

        Server::start(
            self.listeners,
            &handle,
            Arc::new(callback),
            self.tls,
            self.backlog,
            EngineSettings { keep_alive: self.keep_alive, max_request_body: self.max_request_body },
            self.serialize_callbacks,
        )
    }

    /// Starts the server with an async `callback`.
    ///
    /// Every request runs `callback` to completion as its own task on the
    /// server's runtime. Errors and panics are logged and swallowed.
    pub fn serve_async<F, Fut>(self, callback: F) -> Result<Server, TetherError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.serve(async_callback(callback))
    }
}
