//! Listening sockets and their two-phase close.
//!
//! Each listener's accept task owns the socket. Closing a listener only
//! signals the task; the task drops the socket and then reports `Closed`
//! through a watch channel, so the close is confirmed by the runtime rather
//! than assumed.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
};

use futures_util::future::join_all;
use log::{error, info};
use socket2::{Domain, Socket, Type};
use tokio::{net::TcpListener, runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;

use crate::server::acceptor::Acceptor;

/// Something the server can listen on.
pub enum ListenerSource {
    /// An address to bind.
    Address(SocketAddr),
    /// An already-bound socket. It is put into listening mode with the
    /// server's backlog.
    Socket(Socket),
    /// An already-listening socket.
    Listener(std::net::TcpListener),
}

impl From<SocketAddr> for ListenerSource {
    fn from(addr: SocketAddr) -> Self {
        ListenerSource::Address(addr)
    }
}

impl From<Socket> for ListenerSource {
    fn from(socket: Socket) -> Self {
        ListenerSource::Socket(socket)
    }
}

impl From<std::net::TcpListener> for ListenerSource {
    fn from(listener: std::net::TcpListener) -> Self {
        ListenerSource::Listener(listener)
    }
}

impl ListenerSource {
    fn open(self, backlog: u32) -> io::Result<std::net::TcpListener> {
        let socket = match self {
            ListenerSource::Address(addr) => {
                let socket =
                    Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
                socket.set_reuse_address(true)?;
                if addr.is_ipv6() {
                    socket.set_only_v6(true)?;
                }
                socket.bind(&addr.into())?;
                socket
            }
            ListenerSource::Socket(socket) => socket,
            ListenerSource::Listener(listener) => Socket::from(listener),
        };

        socket.set_nonblocking(true)?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        Ok(socket.into())
    }
}

/// Close state of one listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseState {
    Open,
    /// Close issued; the accept task has not released the socket yet.
    Closing,
    Closed,
}

// Marks the listener closed once the socket beside it has been dropped.
struct ClosedOnDrop(Arc<watch::Sender<CloseState>>);

impl Drop for ClosedOnDrop {
    fn drop(&mut self) {
        self.0
            .send_replace(CloseState::Closed);
    }
}

struct AcceptTask {
    // Dropped before `closed`.
    listener: TcpListener,
    closed: ClosedOnDrop,
}

impl AcceptTask {
    async fn run(self, local_addr: SocketAddr, shutdown: CancellationToken, acceptor: Acceptor) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => acceptor.accept(stream, peer),
                    Err(err) => error!("Cannot accept connection on {}: {:?}", local_addr, err),
                },
            }
        }

        let AcceptTask { listener, closed } = self;
        drop(listener);
        drop(closed);
        info!("Listener {} closed", local_addr);
    }
}

/// A listener registered with the runtime.
pub(crate) struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<CloseState>>,
}

impl ListenerHandle {
    /// Opens `source`, registers it with `runtime` and starts accepting.
    pub(crate) fn start(
        source: ListenerSource,
        backlog: u32,
        runtime: &Handle,
        acceptor: Acceptor,
    ) -> io::Result<ListenerHandle> {
        let listener = source.open(backlog)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let (state, _) = watch::channel(CloseState::Open);
        let state = Arc::new(state);

        let task = AcceptTask { listener, closed: ClosedOnDrop(state.clone()) };
        runtime.spawn(task.run(local_addr, shutdown.clone(), acceptor));

        info!("Listening on {}", local_addr);

        Ok(ListenerHandle { local_addr, shutdown, state })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn state(&self) -> CloseState {
        *self
            .state
            .borrow()
    }

    /// Issues the close. Returns `false` if it was already issued.
    pub(crate) fn close(&self) -> bool {
        let issued = self
            .state
            .send_if_modified(|state| {
                if *state == CloseState::Open {
                    *state = CloseState::Closing;
                    true
                } else {
                    false
                }
            });
        if issued {
            self.shutdown
                .cancel();
        }
        issued
    }

    /// Resolves once the accept task has released the socket.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self
            .state
            .subscribe();
        async move {
            // The sender lives as long as this handle or the accept task.
            let _ = state
                .wait_for(|state| *state == CloseState::Closed)
                .await;
        }
    }
}

/// The server's listeners.
///
/// Closing moves every active listener to the draining list, so the set
/// counts as closed immediately while sockets are still being released.
#[derive(Default)]
pub(crate) struct ListenerSet {
    active: Vec<ListenerHandle>,
    draining: Vec<ListenerHandle>,
}

impl ListenerSet {
    pub(crate) fn push(&mut self, handle: ListenerHandle) {
        self.active
            .push(handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.active
            .len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active
            .is_empty()
    }

    pub(crate) fn local_addrs(&self) -> Vec<SocketAddr> {
        self.active
            .iter()
            .map(ListenerHandle::local_addr)
            .collect()
    }

    /// Issues a close on every active listener. Returns how many closes
    /// were issued; calling it again issues none.
    pub(crate) fn close_all(&mut self) -> usize {
        self.draining
            .retain(|handle| handle.state() != CloseState::Closed);

        let mut issued = 0;
        for handle in self
            .active
            .drain(..)
        {
            if handle.close() {
                issued += 1;
            }
            self.draining
                .push(handle);
        }
        issued
    }

    /// Resolves once every listener closed so far has confirmed.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending: Vec<_> = self
            .draining
            .iter()
            .map(ListenerHandle::closed)
            .collect();
        async move {
            join_all(pending).await;
        }
    }
}
