use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::flow::EndReason;
use flowprobe::packet::Packet;
use flowprobe::plugins::PluginChain;
use flowprobe::ring::{ExportItem, FlowRing};

fn new_cache(active_secs: u64, inactive_secs: u64) -> (FlowCache, Arc<FlowRing>) {
    let cfg = CacheConfig {
        size: 1024,
        line_size: 16,
        active: Duration::from_secs(active_secs),
        inactive: Duration::from_secs(inactive_secs),
    };
    let ring = Arc::new(FlowRing::new(4096));
    let cache = FlowCache::new(&cfg, PluginChain::default(), ring.clone()).unwrap();
    (cache, ring)
}

fn udp_packet(
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    ip_length: u16,
    ts_secs: u64,
) -> Packet {
    let mut pkt = Packet::default();
    pkt.timestamp = Duration::from_secs(ts_secs);
    pkt.ip_version = 4;
    pkt.ip_proto = 17;
    pkt.ip_length = ip_length;
    pkt.src_ip = IpAddr::from(src.0);
    pkt.dst_ip = IpAddr::from(dst.0);
    pkt.src_port = src.1;
    pkt.dst_port = dst.1;
    pkt
}

fn tcp_packet(src_port: u16, flags: u8, ts_secs: u64) -> Packet {
    let mut pkt = udp_packet(([10, 0, 0, 1], src_port), ([10, 0, 0, 2], 80), 52, ts_secs);
    pkt.ip_proto = 6;
    pkt.tcp_flags = flags;
    pkt
}

fn drain_flows(ring: &FlowRing) -> Vec<flowprobe::flow::Flow> {
    let mut flows = Vec::new();
    while let Some(item) = ring.pop() {
        if let ExportItem::Flow(f) = item {
            flows.push(*f);
        }
    }
    flows
}

#[test]
fn udp_echo_makes_one_biflow() {
    let (mut cache, ring) = new_cache(300, 30);

    let client = ([10, 0, 0, 1], 1000);
    let server = ([10, 0, 0, 2], 53);
    cache.put_packet(&mut udp_packet(client, server, 88, 1));
    // The reply matches the reverse key and lands in the same record.
    cache.put_packet(&mut udp_packet(server, client, 148, 2));

    assert!(ring.is_empty());

    // Inactivity closes the flow during a later sweep.
    let mut sweeps = 0;
    while ring.is_empty() && sweeps < 1024 {
        cache.export_expired(Duration::from_secs(100));
        sweeps += 1;
    }

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.src_ip, IpAddr::from([10, 0, 0, 1]));
    assert_eq!(flow.src_port, 1000);
    assert_eq!(flow.src_packets, 1);
    assert_eq!(flow.dst_packets, 1);
    assert_eq!(flow.src_octets, 88);
    assert_eq!(flow.dst_octets, 148);
    assert_eq!(flow.end_reason, Some(EndReason::Inactive));
    assert_eq!(flow.time_first, Duration::from_secs(1));
    assert_eq!(flow.time_last, Duration::from_secs(2));
}

#[test]
fn reversed_packets_attribute_to_opposite_directions() {
    let (mut cache, ring) = new_cache(300, 30);

    let a = ([192, 168, 1, 1], 40000);
    let b = ([192, 168, 1, 2], 443);
    for ts in 1..4 {
        cache.put_packet(&mut udp_packet(a, b, 100, ts));
    }
    for ts in 4..6 {
        cache.put_packet(&mut udp_packet(b, a, 200, ts));
    }
    cache.finish();

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].src_packets, 3);
    assert_eq!(flows[0].dst_packets, 2);
    assert_eq!(flows[0].src_octets, 300);
    assert_eq!(flows[0].dst_octets, 400);
}

#[test]
fn syn_after_fin_reopens_flow() {
    const SYN: u8 = 0x02;
    const ACK: u8 = 0x10;
    const FIN: u8 = 0x01;

    let (mut cache, ring) = new_cache(300, 30);

    cache.put_packet(&mut tcp_packet(5000, SYN, 1));
    cache.put_packet(&mut tcp_packet(5000, ACK, 2));
    cache.put_packet(&mut tcp_packet(5000, FIN | ACK, 3));
    assert!(ring.is_empty());

    // Same 5-tuple, new connection.
    cache.put_packet(&mut tcp_packet(5000, SYN, 4));
    cache.finish();

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 2);

    let first = &flows[0];
    assert_eq!(first.end_reason, Some(EndReason::Eof));
    assert_eq!(first.src_packets, 3);
    assert_ne!(first.src_tcp_flags & FIN, 0);

    let second = &flows[1];
    assert_eq!(second.end_reason, Some(EndReason::Forced));
    assert_eq!(second.src_packets, 1);
    assert_eq!(second.time_first, Duration::from_secs(4));
}

#[test]
fn inactive_gap_splits_flow() {
    let (mut cache, ring) = new_cache(300, 30);

    let a = ([10, 1, 1, 1], 1234);
    let b = ([10, 1, 1, 2], 5678);
    cache.put_packet(&mut udp_packet(a, b, 100, 1));
    // Next packet of the same flow arrives after the inactive timeout;
    // the old flow is closed and the packet starts a fresh one.
    cache.put_packet(&mut udp_packet(a, b, 100, 40));
    cache.finish();

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[0].end_reason, Some(EndReason::Inactive));
    assert_eq!(flows[0].src_packets, 1);
    assert_eq!(flows[1].time_first, Duration::from_secs(40));
}

#[test]
fn active_timeout_closes_long_flow() {
    let (mut cache, ring) = new_cache(5, 30);

    let a = ([10, 2, 2, 1], 1111);
    let b = ([10, 2, 2, 2], 2222);
    for ts in 0..10 {
        cache.put_packet(&mut udp_packet(a, b, 100, ts));
    }
    cache.finish();

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 2);

    let first = &flows[0];
    assert_eq!(first.end_reason, Some(EndReason::Active));
    // Closed by the packet at t=5; it is still accounted first.
    assert_eq!(first.src_packets, 6);
    assert_eq!(first.time_last, Duration::from_secs(5));

    let second = &flows[1];
    assert_eq!(second.time_first, Duration::from_secs(6));
    assert_eq!(second.src_packets, 4);
}

#[test]
fn every_flow_is_exported_exactly_once() {
    let (mut cache, ring) = new_cache(300, 30);

    for port in 0..200u16 {
        cache.put_packet(&mut udp_packet(([10, 3, 0, 1], 10000 + port), ([10, 3, 0, 2], 53), 80, 1));
    }
    cache.finish();

    let flows = drain_flows(&ring);
    assert_eq!(flows.len(), 200);
    assert!(flows.iter().all(|f| f.end_reason.is_some()));
    assert_eq!(cache.stats().flows_created, 200);
}
