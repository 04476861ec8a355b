//! Remote endpoint pool
//!
//! Tracks the configured remotes, the currently selected one and the live
//! session to it. Selection moves round-robin on failure. Reconnects are
//! serialized by one mutex: the first caller to find a dead session
//! reconnects, concurrent callers wait and then reuse its session.

use crate::rpc::{Connector, Session};
use mastermind_common::{Error, RemoteEndpoint, Result, RpcError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A live session together with the endpoint it is bound to
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<dyn Session>,
    endpoint: RemoteEndpoint,
    generation: u64,
}

impl SessionHandle {
    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Sequence number of the connection, bumped on every reconnect
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .finish()
    }
}

struct PoolState {
    selected: usize,
    live: Option<SessionHandle>,
    generation: u64,
}

/// Ordered list of remotes with one current selection and session
pub struct EndpointPool {
    endpoints: Vec<RemoteEndpoint>,
    connector: Arc<dyn Connector>,
    reconnect_timeout: Duration,
    state: Mutex<PoolState>,
    reconnect_lock: Mutex<()>,
}

impl EndpointPool {
    /// Create a pool; an empty remote list is a configuration error
    pub fn new(
        endpoints: Vec<RemoteEndpoint>,
        connector: Arc<dyn Connector>,
        reconnect_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::configuration("remote list is empty"));
        }
        Ok(Self {
            endpoints,
            connector,
            reconnect_timeout,
            state: Mutex::new(PoolState {
                selected: 0,
                live: None,
                generation: 0,
            }),
            reconnect_lock: Mutex::new(()),
        })
    }

    pub fn endpoints(&self) -> &[RemoteEndpoint] {
        &self.endpoints
    }

    /// Currently selected endpoint
    pub fn current(&self) -> RemoteEndpoint {
        let state = self.state.lock();
        self.endpoints[state.selected].clone()
    }

    /// Select the next endpoint, wrapping after the last
    pub fn advance(&self) -> RemoteEndpoint {
        let mut state = self.state.lock();
        state.selected = (state.selected + 1) % self.endpoints.len();
        let next = self.endpoints[state.selected].clone();
        debug!("Selected remote {}", next);
        next
    }

    /// The live session, if there is one and it still looks healthy
    pub fn session(&self) -> Option<SessionHandle> {
        let state = self.state.lock();
        state
            .live
            .as_ref()
            .filter(|live| live.session.is_alive())
            .cloned()
    }

    /// Run `f` against the live session, connecting first if needed
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&SessionHandle) -> R,
    ) -> std::result::Result<R, RpcError> {
        let handle = match self.session() {
            Some(handle) => handle,
            None => self.reconnect(None)?,
        };
        Ok(f(&handle))
    }

    /// Replace the session, skipping past the endpoint of `failed`
    ///
    /// If another caller already replaced `failed` (or established a
    /// session while there was none) that session is returned as is. A
    /// live session found dead counts as a failure of its endpoint even
    /// when `failed` is `None`, so the selection moves on either way.
    pub fn reconnect(
        &self,
        failed: Option<&SessionHandle>,
    ) -> std::result::Result<SessionHandle, RpcError> {
        let _reconnecting = self.reconnect_lock.lock();

        let dead = {
            let mut state = self.state.lock();
            if let Some(live) = state.live.as_ref() {
                let replaced = failed.is_none_or(|f| f.generation != live.generation);
                if replaced && live.session.is_alive() {
                    return Ok(live.clone());
                }
            }
            state.live.take()
        };

        if let Some(failed) = failed.or(dead.as_ref()) {
            warn!("Session to {} failed, moving to next remote", failed.endpoint);
            self.advance();
        }

        let mut last_error = RpcError::NoEndpoints;
        for _ in 0..self.endpoints.len() {
            let endpoint = self.current();
            match self.connector.connect(&endpoint, self.reconnect_timeout) {
                Ok(session) => {
                    let mut state = self.state.lock();
                    state.generation += 1;
                    let handle = SessionHandle {
                        session,
                        endpoint: endpoint.clone(),
                        generation: state.generation,
                    };
                    state.live = Some(handle.clone());
                    info!("Connected to remote {}", endpoint);
                    return Ok(handle);
                }
                Err(e) => {
                    warn!("Failed to connect to remote {}: {}", endpoint, e);
                    last_error = e;
                    self.advance();
                }
            }
        }

        warn!(
            "All {} remotes unreachable, last error: {}",
            self.endpoints.len(),
            last_error
        );
        Err(match last_error {
            RpcError::NoEndpoints => RpcError::NoEndpoints,
            other => RpcError::Connection(format!("all remotes unreachable: {other}")),
        })
    }
}
