//! The request dispatcher.
//!
//! The engine calls [`handle_request`] once per parsed request. It buffers the
//! body, wraps the request in a [`Request`] handle, runs the application
//! callback under the dispatch lock, then waits for the one response the
//! handle will produce.

use std::{
    any::Any,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bytes::Bytes;
use futures_util::FutureExt;
use http::{header, request::Parts};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use log::{debug, error, warn};
use rt_gate::spawn_worker;
use tokio::sync::oneshot;

use crate::{
    config::Protocol,
    errors::TetherError,
    request::{Request, RequestRecord},
    server::ServerInner,
    HandlerError, ResponseType,
};

/// Application callback: invoked once per request with the request handle.
///
/// The callback owns the handle. It may answer inline, move the handle into
/// a spawned task and answer later, or drop it, in which case a `500` goes
/// out on the stream.
pub type Callback = Arc<dyn Fn(Request) -> Result<(), HandlerError> + Send + Sync>;

/// Turns an async callback into a [`Callback`]-shaped one.
///
/// Each invocation creates the callback's future and spawns it on the
/// runtime; the dispatch returns as soon as the task is scheduled. An `Err`
/// or a panic from the task is logged and swallowed, and a request the task
/// drops unanswered gets the usual `500`.
pub fn async_callback<F, Fut>(callback: F) -> impl Fn(Request) -> Result<(), HandlerError> + Send + Sync + 'static
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    move |request| {
        let task = callback(request);
        spawn_worker(async move {
            match AssertUnwindSafe(task)
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Async application callback failed: {}", err),
                Err(payload) => {
                    error!("Async application callback panicked: {}", panic_message(payload.as_ref()))
                }
            }
        });
        Ok(())
    }
}

static DISPATCH_LOCK: Mutex<()> = Mutex::new(());

/// Process-wide lock serialising every callback invocation, across all
/// servers and runtime worker threads.
pub struct DispatchLock;

impl DispatchLock {
    /// Blocks until the lock is held. A callback that panicked while holding
    /// it does not poison later dispatches.
    pub fn acquire() -> MutexGuard<'static, ()> {
        DISPATCH_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The engine handler registered on the default host's `/` path.
pub(crate) struct Dispatcher {
    callback: Callback,
    serialize: bool,
}

impl Dispatcher {
    pub(crate) fn new(callback: Callback, serialize: bool) -> Self {
        Self { callback, serialize }
    }

    /// Runs the callback. Errors and panics are logged and swallowed; the
    /// stream is left to the handle's own fallback.
    pub(crate) fn invoke(&self, request: Request) {
        let _guard = if self.serialize { Some(DispatchLock::acquire()) } else { None };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(request)));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Application callback failed: {}", err),
            Err(payload) => error!("Application callback panicked: {}", panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

// The engine distinguishes "no body" from "empty body" by framing.
fn has_body(parts: &Parts, body: &Incoming) -> bool {
    parts
        .headers
        .contains_key(header::CONTENT_LENGTH)
        || parts
            .headers
            .contains_key(header::TRANSFER_ENCODING)
        || !body.is_end_stream()
}

fn engine_response(status: http::StatusCode, body: &'static [u8]) -> ResponseType {
    let mut response = http::Response::new(Full::new(Bytes::from_static(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
    response
}

/// Engine entry point for one request on one stream.
pub(crate) async fn handle_request(
    req: http::Request<Incoming>,
    server: Weak<ServerInner>,
    protocol: Protocol,
    max_request_body: usize,
) -> Result<ResponseType, TetherError> {
    let (parts, body) = req.into_parts();
    let framed = has_body(&parts, &body);

    let payload = match Limited::new(body, max_request_body)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!("Request body to {} exceeds {} bytes, answering 413", parts.uri, max_request_body);
            return Ok(engine_response(http::StatusCode::PAYLOAD_TOO_LARGE, b"Request Entity Too Large"));
        }
        Err(e) => return Err(TetherError::Connection(format!("could not read request body: {}", e))),
    };
    let payload = if framed { Some(payload) } else { None };

    let record = RequestRecord::new(parts, payload, protocol);

    let Some(inner) = server.upgrade() else {
        return Err(TetherError::ServerGone);
    };

    let dispatcher = inner
        .context()
        .route(&record.authority(), record.path())
        .cloned();
    let Some(dispatcher) = dispatcher else {
        return Ok(engine_response(http::StatusCode::NOT_FOUND, b"Not Found"));
    };

    let (responder, response) = oneshot::channel();
    let request = Request::new(inner, record, responder);

    dispatcher.invoke(request);

    match response.await {
        Ok(response) => Ok(response),
        Err(_) => {
            // The handle went away after the server closed; nobody can answer.
            debug!("Request abandoned on a closed server, failing the stream");
            Err(TetherError::ServerGone)
        }
    }
}
