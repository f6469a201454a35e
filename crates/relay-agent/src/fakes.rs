//! In-memory device and firewall plus state builders for tests

use crate::device::{LivePeer, PeerChange, WireguardDevice};
use crate::error::AgentError;
use crate::firewall::Firewall;
use crate::settings::AgentSettings;
use crate::sync::Syncer;
use async_trait::async_trait;
use crds::{State, Wireguard, WireguardPeer, WireguardPeerSpec, WireguardSpec, WireguardStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const SERVER_KEY: &str = "c2VydmVyLWtleS0wMTIzNDU2Nzg5YWJjZGVmZ2hpams=";
pub(crate) const ALICE_KEY: &str = "YWxpY2Uta2V5LTAxMjM0NTY3ODlhYmNkZWZnaGlqa2w=";
pub(crate) const BOB_KEY: &str = "Ym9iLWtleS0wMTIzNDU2Nzg5YWJjZGVmZ2hpamtsbW4=";

pub(crate) fn test_peer(name: &str, public_key: &str, address: &str) -> WireguardPeer {
    let mut peer = WireguardPeer::new(
        name,
        WireguardPeerSpec {
            wireguard_ref: "vpn".to_string(),
            address: Some(address.to_string()),
            public_key: Some(public_key.to_string()),
            ..Default::default()
        },
    );
    peer.metadata.namespace = Some("default".to_string());
    peer
}

/// Relay at 203.0.113.7 with alice on .2 and bob on .3
pub(crate) fn valid_state() -> State {
    let mut server = Wireguard::new("vpn", WireguardSpec::default());
    server.metadata.namespace = Some("default".to_string());
    server.status = Some(WireguardStatus {
        address: "203.0.113.7".to_string(),
        port: "51820".to_string(),
        dns: "10.96.0.10".to_string(),
        ..Default::default()
    });
    State::new(
        &server,
        SERVER_KEY,
        &[
            test_peer("alice", ALICE_KEY, "10.8.0.2"),
            test_peer("bob", BOB_KEY, "10.8.0.3"),
        ],
    )
}

pub(crate) fn state_json(state: &State) -> String {
    serde_json::to_string_pretty(state).unwrap()
}

/// Device that applies peer changes to an in-memory peer list
#[derive(Debug, Default)]
pub(crate) struct FakeDevice {
    pub(crate) live: Mutex<Vec<LivePeer>>,
    pub(crate) applied: Mutex<Vec<Vec<PeerChange>>>,
    pub(crate) fail_link: AtomicBool,
}

#[async_trait]
impl WireguardDevice for FakeDevice {
    async fn ensure_link(&self, settings: &AgentSettings) -> Result<(), AgentError> {
        if self.fail_link.load(Ordering::SeqCst) {
            return Err(AgentError::Device(format!("no link {}", settings.interface)));
        }
        Ok(())
    }

    async fn ensure_address(&self, _settings: &AgentSettings) -> Result<(), AgentError> {
        Ok(())
    }

    async fn peers(&self, _settings: &AgentSettings) -> Result<Vec<LivePeer>, AgentError> {
        Ok(self.live.lock().unwrap().clone())
    }

    async fn configure(
        &self,
        _settings: &AgentSettings,
        _private_key: &str,
        changes: &[PeerChange],
    ) -> Result<(), AgentError> {
        let mut live = self.live.lock().unwrap();
        for change in changes {
            match change {
                PeerChange::Remove(key) => live.retain(|peer| &peer.public_key != key),
                PeerChange::Update { public_key, allowed_ip } => {
                    if let Some(peer) = live.iter_mut().find(|peer| &peer.public_key == public_key) {
                        peer.allowed_ips = vec![allowed_ip.clone()];
                    }
                }
                PeerChange::Add { public_key, allowed_ip } => live.push(LivePeer {
                    public_key: public_key.clone(),
                    allowed_ips: vec![allowed_ip.clone()],
                }),
            }
        }
        self.applied.lock().unwrap().push(changes.to_vec());
        Ok(())
    }
}

/// Firewall that records every applied document
#[derive(Debug, Default)]
pub(crate) struct FakeFirewall {
    pub(crate) tables: Mutex<Vec<String>>,
    pub(crate) fail: AtomicBool,
    pub(crate) calls: AtomicUsize,
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn apply(&self, table: &str) -> Result<(), AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Command {
                command: "iptables-restore".to_string(),
                message: "exit status: 1".to_string(),
            });
        }
        self.tables.lock().unwrap().push(table.to_string());
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub(crate) device: Arc<FakeDevice>,
    pub(crate) firewall: Arc<FakeFirewall>,
    pub(crate) syncer: Arc<Syncer>,
}

pub(crate) fn fixture() -> Fixture {
    let device = Arc::new(FakeDevice::default());
    let firewall = Arc::new(FakeFirewall::default());
    let syncer = Arc::new(Syncer::new(
        Arc::clone(&device) as Arc<dyn WireguardDevice>,
        Arc::clone(&firewall) as Arc<dyn Firewall>,
        Arc::new(AgentSettings::default()),
    ));
    Fixture {
        device,
        firewall,
        syncer,
    }
}
