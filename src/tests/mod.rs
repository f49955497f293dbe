mod server;

use std::{net::SocketAddr, sync::Arc};

use tokio::runtime::Handle;

use crate::{Callback, HandlerError, ListenerSource, Request, Server};

/// Starts a plaintext server on an OS-assigned localhost port.
pub(crate) fn local_server<F>(callback: F) -> Server
where
    F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    Server::new(vec![ListenerSource::from(addr)], &Handle::current(), callback, None, crate::DEFAULT_BACKLOG)
        .expect("server should start on an ephemeral port")
}

pub(crate) fn callback<F>(f: F) -> Callback
where
    F: Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}
