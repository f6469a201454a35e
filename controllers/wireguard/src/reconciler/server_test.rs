//! Unit tests for the Wireguard relay reconciler

#[cfg(test)]
mod tests {
    use crate::config::OperatorConfig;
    use crate::reconciler::server::{NO_NODE_ADDRESS, VPN_ACTIVE};
    use crate::reconciler::{Outcome, Reconciler};
    use crate::resources::secret::{PUBLIC_KEY, SECRET_VERSION_ANNOTATION, STATE_KEY};
    use crate::test_utils::*;
    use crds::{Phase, ServiceType, State, WireguardSpec};
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mesh_store::MockStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn secret_data(store: &MockStore, name: &str, key: &str) -> String {
        let secret = store.secret(NAMESPACE, name).expect("secret exists");
        let data = secret.data.expect("secret has data");
        String::from_utf8(data[key].0.clone()).expect("utf8 data")
    }

    #[tokio::test]
    async fn test_missing_wireguard_is_not_an_error() {
        let store = MockStore::new();
        let reconciler = test_reconciler(&store);

        let outcome = reconciler.reconcile_wireguard(NAMESPACE, "ghost").await.unwrap();
        assert_eq!(outcome, Outcome::AwaitChange);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_first_pass_assigns_identifier_only() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);

        let outcome = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue);

        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.status, Some(Phase::Pending));
        assert_eq!(status.unique_identifier.len(), 8);
        assert!(status.resources.is_empty());
        assert_eq!(store.writes(), vec!["update Wireguard/status default/vpn"]);
    }

    #[tokio::test]
    async fn test_one_sub_resource_created_per_pass() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);

        reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        let name = relay_resource_name(&store, "vpn");

        reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        assert!(store.secret(NAMESPACE, &name).is_some());
        assert!(store.service(NAMESPACE, &name).is_none());

        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.resources.len(), 1);
        assert_eq!(status.resources[0].kind, "Secret");
        assert_eq!(status.resources[0].status, Phase::Pending);
    }

    #[tokio::test]
    async fn test_deployment_waits_for_service() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);

        let outcome = settle_wireguard(&reconciler, &store, "vpn").await;
        assert_eq!(outcome, Outcome::AwaitChange);

        let name = relay_resource_name(&store, "vpn");
        assert!(store.service(NAMESPACE, &name).is_some());
        assert!(store.deployment(NAMESPACE, &name).is_none());

        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.status, Some(Phase::Pending));
        assert_eq!(status.message, format!("Waiting for Service {} to be ready", name));
    }

    #[tokio::test]
    async fn test_load_balancer_relay_becomes_ready() {
        let store = MockStore::new();
        store.add_service(cluster_dns_service("10.96.0.10"));
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);

        let wireguard = ready_wireguard(&reconciler, &store, "vpn").await;
        let name = relay_resource_name(&store, "vpn");
        let status = wireguard.status.unwrap();

        assert_eq!(status.status, Some(Phase::Ready));
        assert_eq!(status.message, VPN_ACTIVE);
        assert_eq!(status.address, "203.0.113.7");
        assert_eq!(status.port, "51820");
        assert_eq!(status.dns, "10.96.0.10");
        assert_eq!(status.dns_search_domain, "default.svc.cluster.local");
        assert_eq!(status.public_key, secret_data(&store, &name, PUBLIC_KEY));
        assert_eq!(status.public_key.len(), 44);

        let kinds: Vec<&str> = status.resources.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Secret", "Service", "Deployment", "Peers"]);
        assert!(status.resources.iter().all(|r| r.status == Phase::Ready));

        // The agent sees the resolved relay in the state blob
        let state: State = serde_json::from_str(&secret_data(&store, &name, STATE_KEY)).unwrap();
        assert_eq!(state.server_address(), "203.0.113.7");
        assert_eq!(state.dns(), "10.96.0.10");
        assert!(state.validate().is_ok());

        // The deployment tracks the current secret version
        let secret_version = store.secret(NAMESPACE, &name).unwrap().metadata.resource_version.unwrap();
        let deployment = store.deployment(NAMESPACE, &name).unwrap();
        assert_eq!(
            deployment.metadata.annotations.unwrap()[SECRET_VERSION_ANNOTATION],
            secret_version
        );
        let template = deployment.spec.unwrap().template.metadata.unwrap();
        assert!(template.annotations.is_none());
    }

    #[tokio::test]
    async fn test_ready_relay_pass_is_a_no_op() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);
        ready_wireguard(&reconciler, &store, "vpn").await;

        let before = store.write_count();
        let outcome = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        assert_eq!(outcome, Outcome::AwaitChange);
        assert_eq!(store.write_count(), before);
    }

    #[tokio::test]
    async fn test_fallback_and_spec_dns() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        store.add_wireguard(test_wireguard("corp", WireguardSpec {
            dns: Some("192.168.1.53".to_string()),
            ..Default::default()
        }));
        let reconciler = test_reconciler(&store);

        let fallback = ready_wireguard(&reconciler, &store, "vpn").await.status.unwrap();
        assert_eq!(fallback.dns, "1.1.1.1");
        assert_eq!(fallback.dns_search_domain, "");

        let fixed = ready_wireguard(&reconciler, &store, "corp").await.status.unwrap();
        assert_eq!(fixed.dns, "192.168.1.53");
        assert_eq!(fixed.dns_search_domain, "");
    }

    #[tokio::test]
    async fn test_fixed_address_overrides_ingress() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec {
            address: Some("vpn.example.com".to_string()),
            ..Default::default()
        }));
        let reconciler = test_reconciler(&store);

        let status = ready_wireguard(&reconciler, &store, "vpn").await.status.unwrap();
        assert_eq!(status.address, "vpn.example.com");
    }

    #[tokio::test]
    async fn test_node_port_relay_without_node_addresses() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec {
            service_type: ServiceType::NodePort,
            ..Default::default()
        }));
        let reconciler = test_reconciler(&store);

        settle_wireguard(&reconciler, &store, "vpn").await;
        let name = relay_resource_name(&store, "vpn");
        assert!(store.deployment(NAMESPACE, &name).is_none());

        store.set_node_port(NAMESPACE, &name, 31820);
        settle_wireguard(&reconciler, &store, "vpn").await;
        store.set_deployment_ready(NAMESPACE, &name, 1);
        let outcome = settle_wireguard(&reconciler, &store, "vpn").await;

        assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(60)));
        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.status, Some(Phase::Pending));
        assert_eq!(status.message, NO_NODE_ADDRESS);

        store.add_node(test_node("node-a", &[("InternalIP", "10.0.0.4")]));
        store.add_node(test_node("node-b", &[("InternalIP", "10.0.0.5"), ("ExternalIP", "198.51.100.9")]));
        let outcome = settle_wireguard(&reconciler, &store, "vpn").await;

        assert_eq!(outcome, Outcome::AwaitChange);
        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.status, Some(Phase::Ready));
        assert_eq!(status.address, "198.51.100.9");
        assert_eq!(status.port, "31820");
    }

    #[tokio::test]
    async fn test_cluster_ip_relay_needs_no_platform() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec {
            service_type: ServiceType::ClusterIp,
            ..Default::default()
        }));
        let reconciler = test_reconciler(&store);

        settle_wireguard(&reconciler, &store, "vpn").await;
        let name = relay_resource_name(&store, "vpn");
        assert!(store.deployment(NAMESPACE, &name).is_some());
    }

    #[tokio::test]
    async fn test_existing_sub_resource_is_adopted() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);
        reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        let name = relay_resource_name(&store, "vpn");

        // Left behind by a pass that crashed before recording it
        store.add_secret(k8s_openapi::api::core::v1::Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let outcome = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue);
        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_peers_get_addresses_and_configs() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let mut fixed = test_peer("bob", "vpn");
        fixed.spec.address = Some("10.8.0.2".to_string());
        store.add_peer(fixed);
        store.add_peer(test_peer("alice", "vpn"));
        store.add_peer(test_peer("mallory", "other-vpn"));
        let reconciler = test_reconciler(&store);

        ready_wireguard(&reconciler, &store, "vpn").await;

        let alice = store.peer(NAMESPACE, "alice").unwrap();
        assert_eq!(alice.spec.address.as_deref(), Some("10.8.0.3"));
        let alice_status = alice.status.unwrap();
        assert_eq!(alice_status.status, Some(Phase::Ready));
        assert_eq!(alice_status.message, "Peer configured");
        assert!(alice_status.config.contains("\nAddress = 10.8.0.3\n"));
        assert!(alice_status.config.contains("\nEndpoint = 203.0.113.7:51820\""));

        let bob = store.peer(NAMESPACE, "bob").unwrap();
        assert_eq!(bob.spec.address.as_deref(), Some("10.8.0.2"));

        let mallory = store.peer(NAMESPACE, "mallory").unwrap();
        assert!(mallory.spec.address.is_none());
        assert!(mallory.status.is_none());

        // Both peers of the relay are in the state blob, in name order
        let name = relay_resource_name(&store, "vpn");
        let state: State = serde_json::from_str(&secret_data(&store, &name, STATE_KEY)).unwrap();
        let names: Vec<_> = state.peers.iter().filter_map(|p| p.metadata.name.clone()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_roster_change_touches_relay_pods() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);
        ready_wireguard(&reconciler, &store, "vpn").await;

        let name = relay_resource_name(&store, "vpn");
        store.add_pod(Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-5d8f7", name)),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "wireguard".to_string()),
                    ("instance".to_string(), name.clone()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        });

        let mut peer = test_peer("carol", "vpn");
        peer.spec.public_key = Some("Y2Fyb2wtcHVibGljLWtleS1wbGFjZWhvbGRlci0wMDA=".to_string());
        store.add_peer(peer);
        settle_wireguard(&reconciler, &store, "vpn").await;

        let secret_version = store.secret(NAMESPACE, &name).unwrap().metadata.resource_version.unwrap();
        let pod = store.pod(NAMESPACE, &format!("{}-5d8f7", name)).unwrap();
        assert_eq!(pod.metadata.annotations.unwrap()[SECRET_VERSION_ANNOTATION], secret_version);

        let state: State = serde_json::from_str(&secret_data(&store, &name, STATE_KEY)).unwrap();
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers[0].spec.address.as_deref(), Some("10.8.0.2"));
    }

    fn spec_writes(store: &MockStore, since: usize) -> Vec<String> {
        store.writes()[since..]
            .iter()
            .filter(|w| w.starts_with("update Secret") || w.starts_with("update Deployment"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_status_change_keeps_secret_and_deployment() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let mut peer = test_peer("alice", "vpn");
        peer.spec.public_key = Some("YWxpY2UtcHVibGljLWtleS1wbGFjZWhvbGRlci0wMDA=".to_string());
        store.add_peer(peer);
        let reconciler = test_reconciler(&store);
        let mut wireguard = ready_wireguard(&reconciler, &store, "vpn").await;
        let name = relay_resource_name(&store, "vpn");
        let secret_version = store.secret(NAMESPACE, &name).unwrap().metadata.resource_version;

        // Phase and message flip while the endpoint stays the same
        if let Some(status) = wireguard.status.as_mut() {
            status.status = Some(Phase::Pending);
            status.message = "Updating endpoint".to_string();
        }
        store.add_wireguard(wireguard);
        let before = store.write_count();
        settle_wireguard(&reconciler, &store, "vpn").await;

        let status = store.wireguard(NAMESPACE, "vpn").unwrap().status.unwrap();
        assert_eq!(status.status, Some(Phase::Ready));
        assert_eq!(status.message, VPN_ACTIVE);
        assert!(spec_writes(&store, before).is_empty());
        assert_eq!(store.secret(NAMESPACE, &name).unwrap().metadata.resource_version, secret_version);
    }

    #[tokio::test]
    async fn test_exhausted_pool_parks_peer() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        store.add_peer(test_peer("a", "vpn"));
        store.add_peer(test_peer("b", "vpn"));
        // 10.8.0.1 is the gateway, which leaves a single host address
        let config = OperatorConfig {
            pool: "10.8.0.0/30".parse().unwrap(),
            ..Default::default()
        };
        let reconciler = Reconciler::new(Arc::new(store.clone()), Arc::new(config));

        let status = ready_wireguard(&reconciler, &store, "vpn").await.status.unwrap();
        assert_eq!(status.status, Some(Phase::Ready));

        let a = store.peer(NAMESPACE, "a").unwrap();
        assert_eq!(a.spec.address.as_deref(), Some("10.8.0.2"));
        assert_eq!(a.status.unwrap().status, Some(Phase::Ready));

        let b = store.peer(NAMESPACE, "b").unwrap();
        assert!(b.spec.address.is_none());
        let b_status = b.status.unwrap();
        assert_eq!(b_status.status, Some(Phase::Error));
        assert_eq!(b_status.message, "no available ip found in 10.8.0.0/30");

        // Parked peers neither fail nor churn later passes
        let before = store.write_count();
        let outcome = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await.unwrap();
        assert_eq!(outcome, Outcome::AwaitChange);
        assert_eq!(store.write_count(), before);

        // The peer reconciler leaves the error in place
        settle_peer(&reconciler, &store, "b").await;
        let b_status = store.peer(NAMESPACE, "b").unwrap().status.unwrap();
        assert_eq!(b_status.status, Some(Phase::Error));
        assert_eq!(b_status.message, "no available ip found in 10.8.0.0/30");
    }

    #[tokio::test]
    async fn test_concurrent_peer_write_conflicts_then_allocates_once() {
        let store = MockStore::new();
        store.add_wireguard(test_wireguard("vpn", WireguardSpec::default()));
        let reconciler = test_reconciler(&store);
        ready_wireguard(&reconciler, &store, "vpn").await;

        store.add_peer(test_peer("a", "vpn"));
        store.add_peer(test_peer("b", "vpn"));
        // Another writer pins peer a after the roster listed it
        store.before_next_update("WireguardPeer", |store| {
            let mut a = store.peer(NAMESPACE, "a").unwrap();
            a.spec.address = Some("10.8.0.2".to_string());
            store.add_peer(a);
        });

        let mut result = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await;
        for _ in 0..10 {
            if result.is_err() {
                break;
            }
            result = reconciler.reconcile_wireguard(NAMESPACE, "vpn").await;
        }
        let err = result.unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {err}");

        settle_wireguard(&reconciler, &store, "vpn").await;
        let a = store.peer(NAMESPACE, "a").unwrap().spec.address;
        let b = store.peer(NAMESPACE, "b").unwrap().spec.address;
        assert_eq!(a.as_deref(), Some("10.8.0.2"));
        assert_eq!(b.as_deref(), Some("10.8.0.3"));
    }
}
