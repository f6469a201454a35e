//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the object store,
//! the reconciler and the two watchers (Wireguard, WireguardPeer) together.

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use kube::Client;
use mesh_store::KubeStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for Wireguard relays and peers.
pub struct Controller {
    wireguard_watcher: JoinHandle<Result<(), ControllerError>>,
    peer_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing Wireguard Controller");

        let kube_client = Client::try_default().await?;
        let store = KubeStore::new(kube_client.clone(), config.store_timeout);
        let namespace = config.watch_namespace.clone();

        let reconciler = Arc::new(Reconciler::new(Arc::new(store), Arc::new(config)));
        let watcher_instance = Arc::new(Watcher::new(reconciler, kube_client, namespace));

        let wireguard_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move {
                watcher.watch_wireguards().await
            })
        };

        let peer_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move {
                watcher.watch_peers().await
            })
        };

        Ok(Self {
            wireguard_watcher,
            peer_watcher,
        })
    }

    /// Runs the controller until a watcher exits or a shutdown signal arrives.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Wireguard Controller running");

        tokio::select! {
            result = &mut self.wireguard_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Wireguard watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Wireguard watcher error: {}", e)))?;
            }
            result = &mut self.peer_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("WireguardPeer watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("WireguardPeer watcher error: {}", e)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                self.wireguard_watcher.abort();
                self.peer_watcher.abort();
            }
        }

        Ok(())
    }
}
