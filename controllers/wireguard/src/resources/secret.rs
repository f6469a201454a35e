//! Relay Secret: key pair plus the agent state blob.

use super::{RelayIdentity, ResourceContext};
use crate::error::ControllerError;
use crate::keys::KeyPair;
use crds::{State, Wireguard, WireguardPeer};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mesh_store::StoreResultExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Data key holding the serialized [`State`]
pub const STATE_KEY: &str = "state.json";
/// Data key holding the relay public key
pub const PUBLIC_KEY: &str = "publicKey";
/// Data key holding the relay private key
pub const PRIVATE_KEY: &str = "privateKey";
/// Annotation carrying the Secret resourceVersion the relay pod last saw
pub const SECRET_VERSION_ANNOTATION: &str = "secretResourceVersion";

pub struct SecretResource {
    wireguard: Wireguard,
    relay: RelayIdentity,
    ctx: ResourceContext,
}

impl SecretResource {
    pub const KIND: &'static str = "Secret";

    pub(crate) fn new(wireguard: &Wireguard, relay: RelayIdentity, ctx: ResourceContext) -> Self {
        Self {
            wireguard: wireguard.clone(),
            relay,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.relay.resource_name
    }

    /// Peers referencing this relay, in name order
    async fn peers(&self) -> Result<Vec<WireguardPeer>, ControllerError> {
        let mut peers: Vec<WireguardPeer> = self.ctx.store
            .list_peers(&self.relay.namespace)
            .await?
            .into_iter()
            .filter(|p| p.spec.wireguard_ref == self.relay.name)
            .collect();
        peers.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(peers)
    }

    async fn live(&self) -> Result<Option<Secret>, ControllerError> {
        Ok(self.ctx.store
            .get_secret(&self.relay.namespace, self.name())
            .await
            .found()?)
    }

    /// Desired Secret. Keys are generated only when `existing` has none.
    async fn desired(&self, existing: Option<&Secret>) -> Result<Secret, ControllerError> {
        let keys = match existing.and_then(stored_keys) {
            Some(keys) => keys,
            None => {
                info!("Generating key pair for Wireguard {}/{}", self.relay.namespace, self.relay.name);
                KeyPair::generate()
            }
        };

        let peers = self.peers().await?;
        let state = State::new(&self.wireguard, &keys.private_key, &peers);
        let blob = serde_json::to_vec(&state)?;

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(self.name().to_string()),
                namespace: Some(self.relay.namespace.clone()),
                labels: Some(self.ctx.config.labels(&self.relay.name)),
                owner_references: Some(vec![self.relay.owner.clone()]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (STATE_KEY.to_string(), ByteString(blob)),
                (PUBLIC_KEY.to_string(), ByteString(keys.public_key.into_bytes())),
                (PRIVATE_KEY.to_string(), ByteString(keys.private_key.into_bytes())),
            ])),
            ..Default::default()
        })
    }

    pub async fn create(&self) -> Result<(), ControllerError> {
        let desired = self.desired(None).await?;
        self.ctx.store.create_secret(&desired).await?;
        Ok(())
    }

    /// Only the state blob is compared; key material never triggers an update
    pub async fn needs_update(&self) -> Result<bool, ControllerError> {
        let Some(live) = self.live().await? else {
            return Ok(true);
        };
        let desired = self.desired(Some(&live)).await?;
        let drifted = data_value(&live, STATE_KEY) != data_value(&desired, STATE_KEY);
        if drifted {
            debug!("State blob of Secret {}/{} is out of date", self.relay.namespace, self.name());
        }
        Ok(drifted)
    }

    /// Rewrite the blob, then annotate the relay pods with the new Secret
    /// version so the kubelet refreshes the mounted file promptly.
    pub async fn update(&self) -> Result<(), ControllerError> {
        let Some(live) = self.live().await? else {
            return self.create().await;
        };
        let mut desired = self.desired(Some(&live)).await?;
        desired.metadata.resource_version.clone_from(&live.metadata.resource_version);
        let updated = self.ctx.store.update_secret(&desired).await?;
        let version = updated.metadata.resource_version.unwrap_or_default();
        info!("Updated Secret {}/{} (version {})", self.relay.namespace, self.name(), version);

        let selector = self.ctx.config.labels(self.name());
        for mut pod in self.ctx.store.list_pods(&self.relay.namespace, &selector).await? {
            let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            if annotations.get(SECRET_VERSION_ANNOTATION) == Some(&version) {
                continue;
            }
            annotations.insert(SECRET_VERSION_ANNOTATION.to_string(), version.clone());
            debug!("Touching pod {:?} after Secret update", pod.metadata.name);
            self.ctx.store.update_pod(&pod).await?;
        }
        Ok(())
    }

    pub async fn converged(&self) -> Result<bool, ControllerError> {
        Ok(self.live().await?.is_some())
    }

    /// Relay public key as stored in the Secret
    pub async fn public_key(&self) -> Result<Option<String>, ControllerError> {
        Ok(self.live().await?
            .as_ref()
            .and_then(|s| data_value(s, PUBLIC_KEY))
            .map(|b| String::from_utf8_lossy(b).into_owned()))
    }
}

fn data_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret.data.as_ref()?.get(key).map(|b| b.0.as_slice())
}

fn stored_keys(secret: &Secret) -> Option<KeyPair> {
    let private_key = String::from_utf8(data_value(secret, PRIVATE_KEY)?.to_vec()).ok()?;
    let public_key = String::from_utf8(data_value(secret, PUBLIC_KEY)?.to_vec()).ok()?;
    if private_key.is_empty() || public_key.is_empty() {
        return None;
    }
    Some(KeyPair { private_key, public_key })
}
