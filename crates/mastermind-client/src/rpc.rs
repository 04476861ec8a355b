//! RPC client with the reconnect-once, retry-once policy
//!
//! Every call, whether from the refresh loop or from application code,
//! goes through `RpcClient::invoke`:
//!
//! 1. With no live session, connect first; that connect is the call's one
//!    reconnect and the single attempt that follows is final.
//! 2. Otherwise attempt on the live session. If it fails, reconnect once
//!    and attempt exactly once more.
//! 3. A failure after that surfaces as `Error::Rpc`.
//!
//! An error document returned by the remote is final: the session worked,
//! so it is neither reconnected nor retried.
//!
//! Attempts are bounded by the enqueue timeout, connects by the reconnect
//! timeout of the `EndpointPool`.

use crate::endpoint::{EndpointPool, SessionHandle};
use mastermind_common::{Error, RemoteEndpoint, Result, RpcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens sessions to remote endpoints
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        timeout: Duration,
    ) -> std::result::Result<Arc<dyn Session>, RpcError>;
}

/// An established session to one remote
pub trait Session: Send + Sync {
    /// Send one event and wait up to `timeout` for its response
    fn call(
        &self,
        event: &str,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<Value, RpcError>;

    /// False once the session is known to be broken
    fn is_alive(&self) -> bool;
}

/// Bounded-timeout RPC calls over an `EndpointPool`
pub struct RpcClient {
    pool: EndpointPool,
    enqueue_timeout: Duration,
}

impl RpcClient {
    pub fn new(pool: EndpointPool, enqueue_timeout: Duration) -> Self {
        Self {
            pool,
            enqueue_timeout,
        }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    /// Call `event` with the configured enqueue timeout
    pub fn invoke(&self, event: &str, payload: &Value) -> Result<Value> {
        self.invoke_with_timeout(event, payload, self.enqueue_timeout)
    }

    /// Call `event`, bounding each attempt by `timeout`
    ///
    /// Only connection, timeout and transport failures take the reconnect
    /// and retry path. `RpcError::Remote` is returned after the first
    /// attempt and leaves the session and the selected remote in place;
    /// callers that want another remote's answer must retry themselves.
    pub fn invoke_with_timeout(
        &self,
        event: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (handle, preconnected) = match self.pool.session() {
            Some(handle) => (handle, false),
            None => {
                debug!("No live session for '{}', connecting first", event);
                let handle = self
                    .pool
                    .reconnect(None)
                    .map_err(|e| Error::rpc(event, e))?;
                (handle, true)
            }
        };

        let first_error = match Self::attempt(&handle, event, payload, timeout) {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        if preconnected || !first_error.is_retryable() {
            return Err(Error::rpc(event, first_error));
        }

        let handle = self
            .pool
            .reconnect(Some(&handle))
            .map_err(|e| Error::rpc(event, e))?;
        Self::attempt(&handle, event, payload, timeout).map_err(|e| Error::rpc(event, e))
    }

    /// Typed adapter over `invoke` for callers with their own request and
    /// response shapes
    pub fn call<P, R>(&self, event: &str, payload: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let response = self.invoke(event, &payload)?;
        serde_json::from_value(response).map_err(|e| {
            Error::rpc(
                event,
                RpcError::Transport(format!("unexpected response shape: {e}")),
            )
        })
    }

    fn attempt(
        handle: &SessionHandle,
        event: &str,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<Value, RpcError> {
        handle
            .session()
            .call(event, payload, timeout)
            .inspect_err(|e| {
                warn!("Call '{}' on {} failed: {}", event, handle.endpoint(), e);
            })
    }
}
