//! Collaborator interfaces consumed by the engine, kept as plain
//! channels/traits rather than a Kubernetes informer — the policy
//! controller, service controller, egress controller, and node/peer
//! watcher are all external processes in production; here they are just
//! whatever feeds these channels.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::adapters::{FilterClient, IpsetClient};
use crate::engine::ForwardingEngine;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added {
        pod_cidr: IpNetwork,
        node_name: String,
        node_ip: IpAddr,
        node_gateway_ip: IpAddr,
    },
    Removed {
        pod_cidr: IpNetwork,
    },
}

/// Node/peer watcher: `tokio::sync::mpsc::Receiver<PeerEvent>`.
pub type PeerWatcher = mpsc::Receiver<PeerEvent>;

#[derive(Debug, Clone)]
pub enum PolicyUpdate {
    SetUpdate { name: String, members: Vec<String> },
    ChainUpdate { name: String, rules: Vec<String> },
}

/// Policy compiler: drives the node-network-policy dynamic sets/chains
/// when `nodeNetworkPolicyEnabled` is set.
pub type PolicyCompiler = mpsc::Receiver<PolicyUpdate>;

/// Service-CIDR provider: current covering Service CIDR.
pub type ServiceCidrProvider = watch::Receiver<IpNetwork>;

#[derive(Debug, Clone)]
pub enum EgressEvent {
    SnatBinding { mark: u32, snat_ip: IpAddr },
    SnatBindingRemoved { mark: u32 },
    EgressRoute { table_id: u32, dev_index: u32, gateway: IpAddr, prefix_len: u8 },
    EgressRouteRemoved { table_id: u32 },
    EgressRule { table_id: u32, mark: u32 },
    EgressRuleRemoved { table_id: u32, mark: u32 },
}

/// Egress controller: SNAT bindings and egress policy routes.
pub type EgressController = mpsc::Receiver<EgressEvent>;

/// Feeds every collaborator channel into the engine, translating each
/// event into the matching public C5 operation. Runs until all four
/// senders are dropped. This is the wiring `main` would plug a real
/// control-plane client into; standalone runs just construct idle
/// channels whose senders are never used.
pub async fn drive(
    engine: Arc<ForwardingEngine>,
    mut peer_watcher: PeerWatcher,
    mut policy_compiler: PolicyCompiler,
    mut service_cidr: ServiceCidrProvider,
    mut egress_controller: EgressController,
) {
    loop {
        tokio::select! {
            event = peer_watcher.recv() => {
                match event {
                    Some(PeerEvent::Added { pod_cidr, node_name, node_ip, node_gateway_ip }) => {
                        if let Err(e) = engine.add_routes(pod_cidr, &node_name, node_ip, node_gateway_ip).await {
                            warn!(error = %e, %pod_cidr, "add_routes from peer watcher failed");
                        }
                    }
                    Some(PeerEvent::Removed { pod_cidr }) => {
                        if let Err(e) = engine.delete_routes(pod_cidr).await {
                            warn!(error = %e, %pod_cidr, "delete_routes from peer watcher failed");
                        }
                    }
                    None => return,
                }
            }
            event = policy_compiler.recv() => {
                match event {
                    Some(PolicyUpdate::SetUpdate { name, members }) => {
                        let ipset = engine.ipset_handle();
                        for member in members {
                            if let Err(e) = ipset.add_entry(&name, &member).await {
                                warn!(error = %e, set = %name, "policy set update failed");
                            }
                        }
                    }
                    Some(PolicyUpdate::ChainUpdate { name, rules }) => {
                        let filter = engine.filter_handle();
                        for rule in rules {
                            if let Err(e) = filter.append_rule(crate::types::Protocol::Dual, "filter", &name, &rule).await {
                                warn!(error = %e, chain = %name, "policy chain update failed");
                            }
                        }
                    }
                    None => return,
                }
            }
            changed = service_cidr.changed() => {
                if changed.is_err() {
                    return;
                }
                let cidr = *service_cidr.borrow_and_update();
                if let Err(e) = engine.add_service_cidr_route(cidr).await {
                    warn!(error = %e, %cidr, "service cidr rotation failed");
                }
            }
            event = egress_controller.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = apply_egress_event(&engine, &event).await {
                            warn!(error = %e, ?event, "egress controller event failed");
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

async fn apply_egress_event(engine: &ForwardingEngine, event: &EgressEvent) -> anyhow::Result<()> {
    match *event {
        // All fields are `Copy` (`u32`/`IpAddr`), so this by-value match on
        // a `&EgressEvent` just copies out of the reference.
        EgressEvent::SnatBinding { mark, snat_ip } => engine.add_snat_rule(snat_ip, mark).await,
        EgressEvent::SnatBindingRemoved { mark } => engine.delete_snat_rule(mark).await,
        EgressEvent::EgressRoute { table_id, dev_index, gateway, prefix_len } => {
            engine.add_egress_routes(table_id, dev_index, gateway, prefix_len).await
        }
        EgressEvent::EgressRouteRemoved { table_id } => engine.delete_egress_routes(table_id).await,
        EgressEvent::EgressRule { table_id, mark } => engine.add_egress_rule(table_id, mark).await,
        EgressEvent::EgressRuleRemoved { table_id, mark } => engine.delete_egress_rule(table_id, mark).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::{FakeFilter, FakeIpset, FakeRoutes};
    use crate::adapters::RouteClient;
    use crate::types::{EncryptionMode, FeatureGates, NodeConfig, Protocol, TrafficEncapMode, TunnelType};
    use std::str::FromStr;

    fn test_engine() -> Arc<ForwardingEngine> {
        let node_config = NodeConfig {
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
        };
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(ForwardingEngine::new(
            node_config,
            Arc::new(FakeIpset::default()),
            Arc::new(FakeFilter::default()),
            Arc::new(FakeRoutes::default()),
            tx,
        ))
    }

    #[tokio::test]
    async fn drive_applies_peer_and_egress_events_to_the_engine() {
        let engine = test_engine();
        let (peer_tx, peer_rx) = mpsc::channel(4);
        let (_policy_tx, policy_rx) = mpsc::channel(4);
        let (_cidr_tx, cidr_rx) = watch::channel("10.96.0.0/12".parse().unwrap());
        let (egress_tx, egress_rx) = mpsc::channel(4);

        let drive_handle = tokio::spawn(drive(Arc::clone(&engine), peer_rx, policy_rx, cidr_rx, egress_rx));

        let pod_cidr: IpNetwork = "10.0.2.0/24".parse().unwrap();
        peer_tx
            .send(PeerEvent::Added {
                pod_cidr,
                node_name: "node-b".into(),
                node_ip: "192.168.1.2".parse().unwrap(),
                node_gateway_ip: "10.0.2.1".parse().unwrap(),
            })
            .await
            .unwrap();
        egress_tx.send(EgressEvent::SnatBinding { mark: 0x7, snat_ip: "198.51.100.5".parse().unwrap() }).await.unwrap();

        // Drop every sender so `drive` notices closure and returns.
        drop(peer_tx);
        drop(egress_tx);
        drive_handle.await.unwrap();

        assert_eq!(engine.route_handle().list_routes(None, Protocol::V4).await.unwrap().len(), 1);
        assert_eq!(engine.snapshot_snat_bindings().get(&0x7), Some(&"198.51.100.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn peer_watcher_channel_delivers_events_in_order() {
        let (tx, mut rx): (mpsc::Sender<PeerEvent>, PeerWatcher) = mpsc::channel(4);
        let cidr: IpNetwork = "10.0.2.0/24".parse().unwrap();
        tx.send(PeerEvent::Added {
            pod_cidr: cidr,
            node_name: "node-b".into(),
            node_ip: "192.168.1.2".parse().unwrap(),
            node_gateway_ip: "10.0.2.1".parse().unwrap(),
        })
        .await
        .unwrap();
        tx.send(PeerEvent::Removed { pod_cidr: cidr }).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PeerEvent::Added { .. })));
        assert!(matches!(rx.recv().await, Some(PeerEvent::Removed { .. })));
    }
}
