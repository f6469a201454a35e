//! WireguardPeer reconciliation.
//!
//! Provisions the peer key pair, waits for the referenced relay, then links
//! the peer to it. The client config itself is rendered by the relay's peer
//! roster, not here.

use super::{object_key, Outcome, Reconciler};
use crate::error::ControllerError;
use crate::keys::KeyPair;
use crate::resources::peers::is_pool_exhausted;
use crate::resources::secret::{PRIVATE_KEY, PUBLIC_KEY};
use crds::{Phase, PrivateKeyRef, SecretKeySelector, WireguardPeer, WireguardPeerStatus};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use mesh_store::StoreResultExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Name of the Secret holding a peer's key pair
pub fn peer_secret_name(peer: &str) -> String {
    format!("{}-peer", peer)
}

impl Reconciler {
    /// Reconcile one WireguardPeer.
    pub async fn reconcile_peer(&self, namespace: &str, name: &str) -> Result<Outcome, ControllerError> {
        let key = object_key(namespace, name);
        let Some(mut peer) = self.store.get_peer(namespace, name).await.found()? else {
            debug!("WireguardPeer {} not found, must have been deleted", key);
            return Ok(Outcome::AwaitChange);
        };

        if peer.phase().is_none() {
            self.set_peer_status(&mut peer, Phase::Pending, "Waiting for wireguard peer to be created")
                .await?;
            return Ok(Outcome::Requeue);
        }

        let wireguard_ref = peer.spec.wireguard_ref.clone();
        if wireguard_ref.is_empty() {
            self.set_peer_status(&mut peer, Phase::Error, "spec.wireguardRef must not be empty")
                .await?;
            return Ok(Outcome::AwaitChange);
        }

        if peer.public_key().is_none() {
            let keys = self.peer_keys(&peer).await?;
            peer.spec.public_key = Some(keys.public_key);
            peer.spec.private_key_ref = Some(PrivateKeyRef {
                secret_key_ref: SecretKeySelector {
                    name: peer_secret_name(name),
                    key: PRIVATE_KEY.to_string(),
                },
            });
            info!("Assigned key pair to WireguardPeer {}", key);
            self.store.update_peer(&peer).await?;
            return Ok(Outcome::Requeue);
        }

        let Some(wireguard) = self.store.get_wireguard(namespace, &wireguard_ref).await.found()? else {
            let message = format!("Waiting for wireguard resource '{}' to be created", wireguard_ref);
            self.set_peer_status(&mut peer, Phase::Error, &message).await?;
            return Ok(Outcome::AwaitChange);
        };
        if !wireguard.is_ready() {
            let message = format!("Waiting for {} to be ready", wireguard_ref);
            self.set_peer_status(&mut peer, Phase::Error, &message).await?;
            return Ok(Outcome::AwaitChange);
        }

        let owned = wireguard.metadata.uid.as_ref().is_some_and(|uid| {
            peer.metadata.owner_references.iter().flatten().any(|o| &o.uid == uid)
        });
        if !owned {
            let owner = wireguard.controller_owner_ref(&()).ok_or_else(|| {
                ControllerError::InvalidObject(format!("Wireguard {}/{} has no uid", namespace, wireguard_ref))
            })?;
            let references = peer.metadata.owner_references.get_or_insert_with(Vec::new);
            references.retain(|o| o.controller != Some(true));
            references.push(owner);
            peer.metadata.labels
                .get_or_insert_with(BTreeMap::new)
                .extend(self.config.labels(&wireguard_ref));
            info!("Linking WireguardPeer {} to Wireguard {}", key, wireguard_ref);
            self.store.update_peer(&peer).await?;
            return Ok(Outcome::Requeue);
        }

        let rendered = peer.status.as_ref().is_some_and(|s| !s.config.is_empty());
        if !rendered && !is_pool_exhausted(&peer, self.config.pool) {
            self.set_peer_status(&mut peer, Phase::Pending, "Waiting config to be updated")
                .await?;
        }
        Ok(Outcome::AwaitChange)
    }

    /// Key pair of a peer, reusing its key Secret when one exists
    async fn peer_keys(&self, peer: &WireguardPeer) -> Result<KeyPair, ControllerError> {
        let namespace = peer.metadata.namespace.clone().unwrap_or_default();
        let secret_name = peer_secret_name(peer.metadata.name.as_deref().unwrap_or_default());

        if let Some(secret) = self.store.get_secret(&namespace, &secret_name).await.found()? {
            let private_key = secret.data.as_ref()
                .and_then(|d| d.get(PRIVATE_KEY))
                .map(|b| String::from_utf8_lossy(&b.0).into_owned());
            if let Some(keys) = private_key.and_then(|k| KeyPair::from_private_key(&k)) {
                debug!("Reusing key Secret {}/{}", namespace, secret_name);
                return Ok(keys);
            }
        }

        let owner = peer.controller_owner_ref(&()).ok_or_else(|| {
            ControllerError::InvalidObject(format!("WireguardPeer {}/{:?} has no uid", namespace, peer.metadata.name))
        })?;
        let keys = KeyPair::generate();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(self.config.labels(&peer.spec.wireguard_ref)),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (PRIVATE_KEY.to_string(), ByteString(keys.private_key.clone().into_bytes())),
                (PUBLIC_KEY.to_string(), ByteString(keys.public_key.clone().into_bytes())),
            ])),
            ..Default::default()
        };
        info!("Creating key Secret {}/{}", namespace, secret_name);
        self.store.create_secret(&secret).await?;
        Ok(keys)
    }

    /// Write phase and message, skipping the write when nothing changed
    async fn set_peer_status(
        &self,
        peer: &mut WireguardPeer,
        phase: Phase,
        message: &str,
    ) -> Result<(), ControllerError> {
        let status = peer.status.get_or_insert_with(WireguardPeerStatus::default);
        if status.status == Some(phase) && status.message == message {
            return Ok(());
        }
        status.status = Some(phase);
        status.message = message.to_string();
        debug!("WireguardPeer {:?} is {}: {}", peer.metadata.name, phase, message);
        self.store.update_peer_status(peer).await?;
        Ok(())
    }
}
