//! Reconciliation logic for Wireguard relays and their peers.
//!
//! - `server`: drives a relay through its managed sub-resources
//! - `peer`: provisions peer identity and links it to its relay
//!
//! Both reconcilers are level-triggered: every pass re-reads the world from
//! the object store and performs at most one corrective step before handing
//! control back to the scheduler.

pub mod peer;
pub mod server;

#[cfg(test)]
mod server_test;

use crate::backoff::FibonacciBackoff;
use crate::config::OperatorConfig;
use crate::resources::ResourceContext;
use kube_runtime::controller::Action;
use mesh_store::ObjectStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Delay used for an immediate requeue
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// What the scheduler should do after a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until a watched object changes
    AwaitChange,
    /// Progress was made; run again promptly
    Requeue,
    /// Run again after a fixed delay
    RequeueAfter(Duration),
}

impl Outcome {
    pub fn into_action(self) -> Action {
        match self {
            Outcome::AwaitChange => Action::await_change(),
            Outcome::Requeue => Action::requeue(REQUEUE_DELAY),
            Outcome::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Reconciles Wireguard and WireguardPeer resources.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) config: Arc<OperatorConfig>,
    /// Retry state per object (namespace/name -> backoff)
    backoff_states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<OperatorConfig>) -> Self {
        Self {
            store,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn context(&self) -> ResourceContext {
        ResourceContext {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }

    /// Next retry delay for a failing object
    pub fn next_backoff(&self, key: &str) -> Duration {
        match self.backoff_states.lock() {
            Ok(mut states) => states
                .entry(key.to_string())
                .or_default()
                .next_backoff(),
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                FibonacciBackoff::default().next_backoff()
            }
        }
    }

    /// Forget the retry state of an object after a successful pass
    pub fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }
}

/// `namespace/name` key used for logging and backoff bookkeeping
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Suffix shared by every sub-resource of one relay instance
pub(crate) fn unique_identifier() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
