use std::{net::SocketAddr, sync::Weak};

use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use log::{debug, error};
use rt_gate::spawn_worker;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "http2")]
use hyper::server::conn::http2;
#[cfg(feature = "http2")]
use hyper_util::rt::TokioExecutor;

use crate::{
    config::Protocol,
    server::{context::EngineSettings, dispatch::handle_request, ServerInner},
    TlsContext,
};

/// Takes accepted streams, decides their protocol and serves them.
#[derive(Clone)]
pub(crate) struct Acceptor {
    server: Weak<ServerInner>,
    tls: Option<TlsAcceptor>,
    settings: EngineSettings,
    shutdown: CancellationToken,
}

impl Acceptor {
    pub(crate) fn new(
        server: Weak<ServerInner>,
        tls: Option<TlsContext>,
        settings: EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self { server, tls: tls.map(TlsAcceptor::from), settings, shutdown }
    }

    pub(crate) fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            error!("Cannot set TCP_NODELAY for {}: {}", peer, e);
            return;
        }

        let Some(server) = self
            .server
            .upgrade()
        else {
            return;
        };
        let guard = server
            .context()
            .track_connection();
        drop(server);

        let acceptor = self.clone();
        spawn_worker(async move {
            let _guard = guard;
            acceptor
                .serve(stream, peer)
                .await;
        });
    }

    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let Some(tls) = self
            .tls
            .clone()
        else {
            debug!("Serving {} over plaintext HTTP/1.1", peer);
            self.serve_connection(TokioIo::new(stream), Protocol::Http1)
                .await;
            return;
        };

        let handshake = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            handshake = tls.accept(stream) => handshake,
        };
        let stream = match handshake {
            Ok(stream) => stream,
            Err(e) => {
                error!("TLS handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let protocol = match stream
            .get_ref()
            .1
            .alpn_protocol()
        {
            #[cfg(feature = "http2")]
            Some(b"h2") => Protocol::Http2,
            _ => Protocol::Http1,
        };
        debug!("Serving {} over TLS as {:?}", peer, protocol);

        self.serve_connection(TokioIo::new(stream), protocol)
            .await;
    }

    async fn serve_connection<T>(&self, io: TokioIo<T>, protocol: Protocol)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self
            .server
            .clone();
        let limit = self
            .settings
            .max_request_body;
        let service = service_fn(move |req| handle_request(req, server.clone(), protocol, limit));

        match protocol {
            Protocol::Http1 => {
                let conn = http1::Builder::new()
                    .keep_alive(
                        self.settings
                            .keep_alive,
                    )
                    .serve_connection(io, service);
                let mut conn = std::pin::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = self.shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };
                if let Err(err) = result {
                    error!("Error serving connection: {:?}", err);
                }
            }
            #[cfg(feature = "http2")]
            Protocol::Http2 => {
                let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
                let mut conn = std::pin::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = self.shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };
                if let Err(err) = result {
                    error!("Error serving connection: {:?}", err);
                }
            }
        }
    }
}
