//! Scripted in-memory remote used by the unit tests

use crate::rpc::{Connector, Session};
use mastermind_common::{RemoteEndpoint, RpcError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One scripted answer to a call
pub(crate) enum Reply {
    Value(Value),
    Fail(RpcError),
}

#[derive(Default)]
struct MockState {
    unreachable: HashSet<String>,
    failing_hosts: HashSet<String>,
    queued: HashMap<String, VecDeque<Reply>>,
    defaults: HashMap<String, Value>,
    connects: Vec<String>,
    calls: Vec<(String, String)>,
}

/// Connector whose remotes answer from per-event scripts
///
/// Queued replies are consumed first; afterwards the event's default
/// response (if any) is returned on every call.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn shared(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub(crate) fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Make every call on sessions to `host` fail with a transport error
    pub(crate) fn set_failing(&self, host: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_hosts.insert(host.to_string());
        } else {
            state.failing_hosts.remove(host);
        }
    }

    pub(crate) fn respond(&self, event: &str, value: Value) {
        self.state.lock().defaults.insert(event.to_string(), value);
    }

    pub(crate) fn enqueue(&self, event: &str, reply: Reply) {
        self.state
            .lock()
            .queued
            .entry(event.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Hosts of every connection attempt, in order
    pub(crate) fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    /// Hosts that served each call of `event`, in order
    pub(crate) fn calls(&self, event: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, host)| host.clone())
            .collect()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        _timeout: Duration,
    ) -> Result<Arc<dyn Session>, RpcError> {
        let mut state = self.state.lock();
        state.connects.push(endpoint.host.clone());
        if state.unreachable.contains(&endpoint.host) {
            return Err(RpcError::Connection(format!(
                "{} refused connection",
                endpoint.host
            )));
        }
        Ok(Arc::new(MockSession {
            host: endpoint.host.clone(),
            state: Arc::clone(&self.state),
            alive: AtomicBool::new(true),
        }))
    }
}

struct MockSession {
    host: String,
    state: Arc<Mutex<MockState>>,
    alive: AtomicBool,
}

impl Session for MockSession {
    fn call(&self, event: &str, _payload: &Value, _timeout: Duration) -> Result<Value, RpcError> {
        let mut state = self.state.lock();
        state.calls.push((event.to_string(), self.host.clone()));

        if state.failing_hosts.contains(&self.host) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(RpcError::Transport("connection reset".into()));
        }

        let queued = state.queued.get_mut(event).and_then(VecDeque::pop_front);
        match queued {
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Fail(e)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(e)
            }
            None => state
                .defaults
                .get(event)
                .cloned()
                .ok_or_else(|| RpcError::Remote(format!("unknown event '{event}'"))),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
