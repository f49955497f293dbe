//! The single-shot request handle.
//!
//! A [`Request`] is live until it is answered. Answering hands the response
//! to the connection and frees the stream for the next request; from then on
//! every accessor fails with [`RequestError::NotAccessible`] and a second
//! answer with [`RequestError::AlreadyResponded`].

use std::sync::Arc;

use bytes::Bytes;
use http::{
    header::{self, HeaderMap, HeaderValue},
    request::Parts,
    StatusCode, Version,
};
use http_body_util::Full;
use hyper::ext::ReasonPhrase;
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::{
    config::Protocol,
    errors::{RequestError, TetherError},
    headers::{is_content_length, lookup_token},
    server::ServerInner,
    ResponseType,
};

/// Packs a version as `major << 8 | minor`.
pub(crate) fn pack_version(version: Version) -> u16 {
    match version {
        Version::HTTP_09 => 0x0009,
        Version::HTTP_10 => 0x0100,
        Version::HTTP_2 => 0x0200,
        Version::HTTP_3 => 0x0300,
        _ => 0x0101,
    }
}

/// The parsed request the engine hands over: head plus buffered body.
pub(crate) struct RequestRecord {
    parts: Parts,
    payload: Option<Bytes>,
    protocol: Protocol,
}

impl RequestRecord {
    pub(crate) fn new(parts: Parts, payload: Option<Bytes>, protocol: Protocol) -> Self {
        Self { parts, payload, protocol }
    }

    /// The URI authority, or the `Host` header when the target has none.
    pub(crate) fn authority(&self) -> String {
        if let Some(authority) = self
            .parts
            .uri
            .authority()
        {
            return authority
                .as_str()
                .to_string();
        }
        self.parts
            .headers
            .get(header::HOST)
            .map(|host| lossy(host.as_bytes()))
            .unwrap_or_default()
    }

    /// Path and query.
    pub(crate) fn path(&self) -> &str {
        self.parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/")
    }
}

struct Live {
    record: RequestRecord,
    responder: oneshot::Sender<ResponseType>,
}

/// One in-flight HTTP request.
///
/// Handed to the application callback, which may answer it right away, move
/// it elsewhere and answer later, or drop it. Dropping a live request while
/// the server is open answers `500 Internal Server Error`.
///
/// The handle keeps its server's shared state alive, so the server is not
/// torn down while a request can still be answered.
pub struct Request {
    server: Arc<ServerInner>,
    state: Option<Live>,
}

impl Request {
    pub(crate) fn new(
        server: Arc<ServerInner>,
        record: RequestRecord,
        responder: oneshot::Sender<ResponseType>,
    ) -> Self {
        Self { server, state: Some(Live { record, responder }) }
    }

    /// Sends the response and invalidates the request.
    ///
    /// Header names must be known to the engine's header table and are
    /// matched case-insensitively. `content-length` is always the length of
    /// `body`; a caller-supplied one is ignored.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    /// - [`RequestError::AlreadyResponded`] if the request was answered.
    /// - [`RequestError::ServerClosed`] if the server has no open listener.
    ///   The request stays live.
    /// - [`RequestError::InvalidStatus`] for a status outside `200..=999`.
    ///   The request stays live.
    /// - [`RequestError::UnknownHeader`] or [`RequestError::InvalidHeaderValue`]
    ///   naming the offending header. Nothing is applied and the request
    ///   stays live.
    pub fn respond(
        &mut self,
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> Result<(), TetherError> {
        self.send(status, None, headers, body.into())
    }

    /// Like [`respond`](Request::respond), with a custom reason phrase.
    ///
    /// HTTP/2 has no reason phrase; there the phrase is validated and then
    /// dropped.
    pub fn respond_with_reason(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> Result<(), TetherError> {
        self.send(status, Some(reason), headers, body.into())
    }

    fn send(
        &mut self,
        status: u16,
        reason: Option<&str>,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<(), TetherError> {
        if self
            .state
            .is_none()
        {
            return Err(RequestError::AlreadyResponded.into());
        }
        if self
            .server
            .is_closed()
        {
            return Err(RequestError::ServerClosed.into());
        }

        // hyper can't send a 1xx as the final response.
        let status_code = StatusCode::from_u16(status)
            .ok()
            .filter(|code| !code.is_informational())
            .ok_or(RequestError::InvalidStatus(status))?;
        let reason = match reason {
            Some(reason) => Some(
                ReasonPhrase::try_from(reason.as_bytes()).map_err(|_| RequestError::InvalidReason)?,
            ),
            None => None,
        };
        let header_map = build_headers(headers, body.len())?;

        let Some(live) = self
            .state
            .take()
        else {
            return Err(RequestError::AlreadyResponded.into());
        };

        let mut response = http::Response::new(Full::new(body));
        *response.status_mut() = status_code;
        *response.headers_mut() = header_map;
        if let Some(reason) = reason {
            if live
                .record
                .protocol
                == Protocol::Http1
            {
                response
                    .extensions_mut()
                    .insert(reason);
            }
        }

        if live
            .responder
            .send(response)
            .is_err()
        {
            debug!("Connection went away before the response to {} was sent", live.record.path());
        }
        Ok(())
    }

    fn live(&self) -> Result<&RequestRecord, TetherError> {
        self.state
            .as_ref()
            .map(|live| &live.record)
            .ok_or_else(|| RequestError::NotAccessible.into())
    }

    /// `true` until the request is answered.
    pub fn is_live(&self) -> bool {
        self.state
            .is_some()
    }

    pub fn method(&self) -> Result<String, TetherError> {
        Ok(self
            .live()?
            .parts
            .method
            .as_str()
            .to_string())
    }

    /// Path and query string.
    pub fn path(&self) -> Result<String, TetherError> {
        Ok(self
            .live()?
            .path()
            .to_string())
    }

    /// The request authority (`host[:port]`).
    pub fn host(&self) -> Result<String, TetherError> {
        Ok(self
            .live()?
            .authority())
    }

    /// The `Upgrade` token, if the client asked for one.
    pub fn upgrade(&self) -> Result<Option<String>, TetherError> {
        Ok(self
            .live()?
            .parts
            .headers
            .get(header::UPGRADE)
            .map(|upgrade| lossy(upgrade.as_bytes())))
    }

    /// Protocol version as `(major, minor)`.
    pub fn version(&self) -> Result<(u8, u8), TetherError> {
        let packed = pack_version(
            self.live()?
                .parts
                .version,
        );
        Ok(((packed >> 8) as u8, (packed & 0xff) as u8))
    }

    /// The request body. `None` when the request had no body at all,
    /// `Some` (possibly empty) when it was framed with one.
    pub fn payload(&self) -> Result<Option<Bytes>, TetherError> {
        Ok(self
            .live()?
            .payload
            .clone())
    }

    /// Request headers in lower-case form, duplicates kept.
    ///
    /// Headers come back in first-seen order of their names, with every
    /// value of a repeated name grouped at that name's first position.
    pub fn headers(&self) -> Result<Vec<(String, String)>, TetherError> {
        Ok(self
            .live()?
            .parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), lossy(value.as_bytes())))
            .collect())
    }

    /// Paths the client hinted for server push (`Link: <path>; rel=preload`).
    /// Always empty for HTTP/1.
    pub fn requests(&self) -> Result<Vec<String>, TetherError> {
        let record = self.live()?;
        match record.protocol {
            #[cfg(feature = "http2")]
            Protocol::Http2 => Ok(push_paths(&record.parts.headers)),
            _ => Ok(Vec::new()),
        }
    }

    /// The protocol of the connection the request arrived on.
    pub fn protocol(&self) -> Result<Protocol, TetherError> {
        Ok(self
            .live()?
            .protocol)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let Some(live) = self
            .state
            .take()
        else {
            return;
        };

        if self
            .server
            .is_closed()
        {
            debug!("Unanswered request to {} dropped after close", live.record.path());
            return;
        }

        warn!(
            "Request {} {} dropped without a response, answering 500",
            live.record
                .parts
                .method,
            live.record.path()
        );
        let _ = live
            .responder
            .send(fallback_response());
    }
}

fn fallback_response() -> ResponseType {
    let body = Bytes::from_static(b"No response");
    let mut response = http::Response::new(Full::new(body.clone()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}

// Validates every header before anything is applied.
fn build_headers(headers: &[(&str, &str)], content_length: usize) -> Result<HeaderMap, RequestError> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        let header_name =
            lookup_token(name.as_bytes()).ok_or_else(|| RequestError::UnknownHeader(name.to_string()))?;
        if is_content_length(&header_name) {
            continue;
        }
        let header_value =
            HeaderValue::from_str(value).map_err(|_| RequestError::InvalidHeaderValue(name.to_string()))?;
        map.append(header_name, header_value);
    }
    map.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    Ok(map)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Same-origin targets of `Link` headers with `rel=preload`, skipping those
/// marked `nopush`.
pub(crate) fn push_paths(headers: &HeaderMap) -> Vec<String> {
    let mut paths = Vec::new();
    for value in headers.get_all(header::LINK) {
        let value = lossy(value.as_bytes());
        paths.extend(
            value
                .split(',')
                .filter_map(preload_target),
        );
    }
    paths
}

fn preload_target(link: &str) -> Option<String> {
    let mut params = link
        .split(';')
        .map(str::trim);
    let target = params
        .next()?
        .strip_prefix('<')?
        .strip_suffix('>')?;
    if !target.starts_with('/') || target.starts_with("//") {
        return None;
    }

    let mut preload = false;
    for param in params {
        let (key, value) = param
            .split_once('=')
            .unwrap_or((param, ""));
        let key = key.trim();
        if key.eq_ignore_ascii_case("nopush") {
            return None;
        }
        if key.eq_ignore_ascii_case("rel") {
            preload |= value
                .trim()
                .trim_matches('"')
                .split_ascii_whitespace()
                .any(|rel| rel.eq_ignore_ascii_case("preload"));
        }
    }

    preload.then(|| target.to_string())
}
