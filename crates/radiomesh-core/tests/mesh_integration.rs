//! Full devices over the simulated radio medium

use radiomesh_core::sim::{MeshSimulator, NodePosition, SimConfig, SimRadio};
use radiomesh_core::{
    InclusionError, InclusionEvent, InclusionState, MeshConfig, MeshDevice, MeshError, NodeId,
    RadioError, Topic,
};

/// Neighbours can hear each other, next-but-one neighbours cannot
fn line(count: usize) -> MeshSimulator {
    let config = SimConfig::default();
    let spacing = config.max_range() * 0.8;
    MeshSimulator::line(config, count, spacing).unwrap()
}

/// Every node hears every other node
fn cluster(count: usize) -> MeshSimulator {
    MeshSimulator::line(SimConfig::default(), count, 10.0).unwrap()
}

#[test]
fn test_multi_hop_delivery_and_ack() {
    let mut sim = line(5);
    sim.provision_all().unwrap();

    let id = sim.send(0, 4, Topic::Cmd, b"valve open").unwrap();
    sim.run(12).unwrap();

    let received = sim.deliveries(4);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"valve open");
    assert_eq!(received[0].hop_count, 3);
    assert_eq!(sim.stats().messages_delivered, 1);

    // The ACK finds its way back along the learned routes
    let acks: Vec<_> = sim
        .deliveries(0)
        .into_iter()
        .filter(|d| d.topic == Topic::Ack)
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].payload, id.to_be_bytes());

    let route = sim
        .device(0)
        .unwrap()
        .router()
        .routes()
        .lookup(&sim.node_id(4).unwrap())
        .cloned()
        .unwrap();
    assert_eq!(route.next_hop, sim.node_id(1).unwrap());
    assert_eq!(route.hop_count, 4);
}

#[test]
fn test_second_message_uses_routes() {
    let mut sim = line(4);
    sim.provision_all().unwrap();

    sim.send(0, 3, Topic::Ping, &[]).unwrap();
    sim.run(10).unwrap();
    let relayed_before = sim.device(1).unwrap().stats().forwarded;

    sim.send(0, 3, Topic::Ping, &[]).unwrap();
    sim.run(10).unwrap();

    assert_eq!(sim.stats().messages_delivered, 2);
    assert!(sim.device(1).unwrap().stats().forwarded > relayed_before);
    let pongs = sim
        .deliveries(0)
        .into_iter()
        .filter(|d| d.topic == Topic::Pong)
        .count();
    assert_eq!(pongs, 2);
}

#[test]
fn test_broadcast_rebroadcast_at_most_once() {
    let mut sim = cluster(5);
    sim.provision_all().unwrap();

    sim.broadcast(0, Topic::application(0x42).unwrap(), b"hello all").unwrap();
    sim.run(10).unwrap();

    for i in 1..5 {
        assert_eq!(sim.deliveries(i).len(), 1, "node {i} deliveries");
        assert!(sim.device(i).unwrap().stats().rebroadcast <= 1);
        assert!(sim.device(i).unwrap().stats().duplicates_dropped > 0);
    }
    // The origin plus one relay per other node
    assert_eq!(sim.stats().frames_transmitted, 5);
}

#[test]
fn test_hop_limit_stops_flood() {
    let base = SimConfig::default();
    let spacing = base.max_range() * 0.8;
    let config = base.with_mesh(MeshConfig::default().with_max_hops(2));
    let mut sim = MeshSimulator::line(config, 6, spacing).unwrap();
    sim.provision_all().unwrap();

    sim.broadcast(0, Topic::Cmd, b"far").unwrap();
    sim.run(12).unwrap();

    assert_eq!(sim.deliveries(3).len(), 1);
    assert!(sim.deliveries(4).is_empty());
    assert!(sim.deliveries(5).is_empty());
    assert_eq!(sim.device(3).unwrap().stats().hop_limit_exceeded, 1);
}

#[test]
fn test_inclusion_over_the_air() {
    let mut sim = cluster(3);
    sim.device_mut(0).unwrap().enable_inclusion_mode().unwrap();
    let hub_id = sim.node_id(0).unwrap();
    let dev_id = sim.node_id(1).unwrap();

    let now = sim.now();
    sim.device_mut(1).unwrap().request_inclusion(now).unwrap();
    assert_eq!(sim.device(1).unwrap().state(), InclusionState::InclusionPending);

    let done = sim
        .run_until(20, |s| {
            s.device(0).unwrap().inclusion().state_of(dev_id) == InclusionState::Included
        })
        .unwrap();
    assert!(done);

    let dev = sim.device(1).unwrap();
    assert_eq!(dev.state(), InclusionState::Included);
    assert_eq!(dev.keys().install_count(), 1);
    assert_eq!(
        dev.keys().current_mesh_key(),
        sim.device(0).unwrap().keys().current_mesh_key()
    );
    assert_eq!(sim.inclusion_events(1), vec![InclusionEvent::Included { peer: hub_id }]);
    assert_eq!(sim.inclusion_events(0), vec![InclusionEvent::Included { peer: dev_id }]);

    // The bystander saw the broadcast request but stayed out of it
    assert_eq!(sim.device(2).unwrap().state(), InclusionState::NotIncluded);
    assert!(sim.inclusion_events(2).is_empty());

    // The new member can now talk to the hub
    sim.send(1, 0, Topic::Ping, &[]).unwrap();
    sim.run(4).unwrap();
    assert!(sim.deliveries(1).iter().any(|d| d.topic == Topic::Pong));
}

#[test]
fn test_inclusion_times_out_without_hub() {
    let config = SimConfig::default()
        .with_mesh(MeshConfig::default().with_inclusion_timeout(100));
    let mut sim = MeshSimulator::line(config, 2, 10.0).unwrap();
    // Hub present but not accepting requests

    let now = sim.now();
    sim.device_mut(1).unwrap().request_inclusion(now).unwrap();
    sim.run(15).unwrap();

    assert_eq!(sim.device(1).unwrap().state(), InclusionState::NotIncluded);
    assert!(!sim.device(1).unwrap().keys().has_mesh_key());
    assert_eq!(
        sim.inclusion_events(1),
        vec![InclusionEvent::Failed {
            peer: NodeId::BROADCAST,
            reason: InclusionError::Timeout
        }]
    );

    // A later attempt is allowed once the failure is reported
    sim.device_mut(0).unwrap().enable_inclusion_mode().unwrap();
    let now = sim.now();
    sim.device_mut(1).unwrap().request_inclusion(now).unwrap();
    sim.run(8).unwrap();
    assert_eq!(sim.device(1).unwrap().state(), InclusionState::Included);
}

#[test]
fn test_membership_survives_restart() {
    let mut sim = cluster(2);
    sim.device_mut(0).unwrap().enable_inclusion_mode().unwrap();
    let now = sim.now();
    sim.device_mut(1).unwrap().request_inclusion(now).unwrap();
    sim.run(8).unwrap();

    sim.device_mut(1).unwrap().shutdown().unwrap();
    let storage = sim.device(1).unwrap().storage().clone();
    let config = sim.device(1).unwrap().config().clone();

    let mut restarted = MeshDevice::new(config, SimRadio::new(), storage).unwrap();
    restarted.init(sim.now()).unwrap();

    assert_eq!(restarted.state(), InclusionState::Included);
    assert_eq!(
        restarted.keys().current_mesh_key(),
        sim.device(0).unwrap().keys().current_mesh_key()
    );
    assert!(restarted
        .router()
        .routes()
        .lookup(&sim.node_id(0).unwrap())
        .is_some());
    // Membership is not granted twice
    assert!(restarted.request_inclusion(sim.now()).is_err());
}

#[test]
fn test_radio_failure_surfaces_after_delivery() {
    let mut sim = cluster(2);
    sim.provision_all().unwrap();
    sim.device_mut(1).unwrap().radio_mut().set_fail_tx(true);

    sim.send(0, 1, Topic::Cmd, b"x").unwrap();
    let result = sim.run(2);

    assert!(matches!(result, Err(MeshError::Radio(RadioError::TxTimeout))));
    // The frame was handled before the ACK could not be sent
    assert_eq!(sim.deliveries(1).len(), 1);
    assert!(sim
        .device(1)
        .unwrap()
        .router()
        .routes()
        .lookup(&sim.node_id(0).unwrap())
        .is_some());
}

#[test]
fn test_node_positions() {
    let sim = line(3);
    let spacing = sim.config().max_range() * 0.8;
    assert_eq!(sim.node_position(2), Some(NodePosition::new(2.0 * spacing, 0.0)));
}
