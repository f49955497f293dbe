//! Per-server engine configuration and runtime state.
//!
//! The context owns the host/path route table, the HTTP engine settings
//! shared by every connection, and the cancellation token that stops every
//! connection task when the context is disposed.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{server::dispatch::Dispatcher, DEFAULT_MAX_REQUEST_BODY};

/// Settings handed to the HTTP engine for every connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EngineSettings {
    pub(crate) keep_alive: bool,
    /// Largest request body buffered for the callback; larger ones get `413`.
    pub(crate) max_request_body: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { keep_alive: true, max_request_body: DEFAULT_MAX_REQUEST_BODY }
    }
}

pub(crate) struct PathConfig {
    path: String,
    dispatcher: Arc<Dispatcher>,
}

pub(crate) struct HostConfig {
    name: String,
    paths: Vec<PathConfig>,
}

impl HostConfig {
    /// Routes every request under `path` to `dispatcher`.
    pub(crate) fn register_path(&mut self, path: &str, dispatcher: Arc<Dispatcher>) -> &mut Self {
        self.paths
            .push(PathConfig { path: path.to_string(), dispatcher });
        self
    }

    fn resolve(&self, path: &str) -> Option<&Arc<Dispatcher>> {
        self.paths
            .iter()
            .filter(|candidate| path_matches(&candidate.path, path))
            .max_by_key(|candidate| {
                candidate
                    .path
                    .len()
            })
            .map(|candidate| &candidate.dispatcher)
    }
}

pub(crate) fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Decrements the live connection count when a connection task ends.
pub(crate) struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count
            .fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct ProtocolContext {
    settings: EngineSettings,
    hosts: Vec<HostConfig>,
    shutdown: CancellationToken,
    connections: Arc<AtomicUsize>,
}

impl ProtocolContext {
    pub(crate) fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            hosts: Vec::new(),
            shutdown: CancellationToken::new(),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Registers a host. The first registered host is the fallback for
    /// authorities that match no other host.
    pub(crate) fn register_host(&mut self, name: &str) -> &mut HostConfig {
        self.hosts
            .push(HostConfig { name: name.to_ascii_lowercase(), paths: Vec::new() });
        let last = self.hosts.len() - 1;
        &mut self.hosts[last]
    }

    /// Finds the dispatcher for a request. `authority` may carry a port.
    pub(crate) fn route(&self, authority: &str, path: &str) -> Option<&Arc<Dispatcher>> {
        let hostname = strip_port(authority);
        let host = self
            .hosts
            .iter()
            .find(|host| host.name.eq_ignore_ascii_case(hostname))
            .or_else(|| {
                self.hosts
                    .first()
            })?;
        host.resolve(path)
    }

    /// Token cancelled once the context is disposed.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .clone()
    }

    pub(crate) fn track_connection(&self) -> ConnectionGuard {
        self.connections
            .fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            count: self
                .connections
                .clone(),
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.shutdown
            .is_cancelled()
    }

    /// Stops every connection task. Idle keep-alive connections are shut
    /// down gracefully; no request is dispatched afterwards.
    pub(crate) fn dispose(&self) {
        if !self.is_disposed() {
            debug!(
                "Disposing protocol context ({} hosts, {} live connections)",
                self.hosts.len(),
                self.connection_count()
            );
            self.shutdown
                .cancel();
        }
    }
}

impl Drop for ProtocolContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub(crate) fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        return rest
            .split_once(']')
            .map(|(host, _)| host)
            .unwrap_or(rest);
    }
    authority
        .split_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}
