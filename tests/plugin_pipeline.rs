use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::flow::EndReason;
use flowprobe::packet::Packet;
use flowprobe::parser::ETHERTYPE_ARP;
use flowprobe::plugins::{ExtType, PluginChain, RecordExt};
use flowprobe::ring::{ExportItem, FlowRing};

fn new_cache(plugins: &str) -> (FlowCache, Arc<FlowRing>) {
    let cfg = CacheConfig {
        size: 256,
        line_size: 16,
        ..CacheConfig::default()
    };
    let ring = Arc::new(FlowRing::new(1024));
    let chain = PluginChain::from_spec(plugins).unwrap();
    let cache = FlowCache::new(&cfg, chain, ring.clone()).unwrap();
    (cache, ring)
}

fn tcp_payload_packet(payload: &[u8], src_port: u16, dst_port: u16, ts: u64) -> Packet {
    let mut pkt = Packet::default();
    pkt.timestamp = Duration::from_secs(ts);
    pkt.ethertype = 0x0800;
    pkt.ip_version = 4;
    pkt.ip_proto = 6;
    pkt.ip_length = 40 + payload.len() as u16;
    pkt.src_ip = IpAddr::from([10, 0, 0, 1]);
    pkt.dst_ip = IpAddr::from([10, 0, 0, 2]);
    pkt.src_port = src_port;
    pkt.dst_port = dst_port;
    pkt.frame = payload.to_vec();
    pkt
}

fn udp_payload_packet(payload: &[u8], src_port: u16, dst_port: u16, ts: u64) -> Packet {
    let mut pkt = tcp_payload_packet(payload, src_port, dst_port, ts);
    pkt.ip_proto = 17;
    pkt.ip_length = 28 + payload.len() as u16;
    pkt
}

const GET_ONE: &[u8] = b"GET /one HTTP/1.1\r\nHost: a.example\r\n\r\n";
const GET_TWO: &[u8] = b"GET /two HTTP/1.1\r\nHost: a.example\r\n\r\n";

#[test]
fn http_transaction_boundary_splits_flow() {
    let (mut cache, ring) = new_cache("http");

    cache.put_packet(&mut tcp_payload_packet(GET_ONE, 40000, 80, 1));
    assert!(ring.is_empty());

    // A second request on the same flow exports the first transaction
    // and restarts the record from this packet.
    cache.put_packet(&mut tcp_payload_packet(GET_TWO, 40000, 80, 2));

    let Some(ExportItem::Flow(first)) = ring.pop() else {
        panic!("first transaction should have been exported");
    };
    assert_eq!(first.end_reason, Some(EndReason::Forced));
    assert_eq!(first.src_packets, 1);
    let Some(RecordExt::Http(http)) = first.extension(ExtType::Http) else {
        panic!("http extension missing");
    };
    assert_eq!(http.uri, "/one");

    cache.finish();
    let Some(ExportItem::Flow(second)) = ring.pop() else {
        panic!("second transaction should remain in the cache");
    };
    assert_eq!(second.src_packets, 1);
    // The reinserted record restarts at the previous flow's last
    // timestamp and is updated by the triggering packet.
    assert_eq!(second.time_first, Duration::from_secs(1));
    assert_eq!(second.time_last, Duration::from_secs(2));
    let Some(RecordExt::Http(http)) = second.extension(ExtType::Http) else {
        panic!("http extension missing");
    };
    assert_eq!(http.uri, "/two");
}

#[test]
fn ntp_flow_is_flushed_on_creation() {
    let (mut cache, ring) = new_cache("ntp");

    let mut payload = vec![0u8; 48];
    payload[0] = 0b00_100_011;
    cache.put_packet(&mut udp_payload_packet(&payload, 50000, 123, 1));

    let Some(ExportItem::Flow(flow)) = ring.pop() else {
        panic!("ntp flow should flush immediately");
    };
    assert_eq!(flow.end_reason, Some(EndReason::Forced));
    let Some(RecordExt::Ntp(ntp)) = flow.extension(ExtType::Ntp) else {
        panic!("ntp extension missing");
    };
    assert_eq!(ntp.version, 4);
    assert_eq!(ntp.mode, 3);

    // The slot was emptied; nothing else to export.
    cache.finish();
    assert!(ring.pop().is_none());
}

#[test]
fn arp_packet_is_exported_standalone() {
    let (mut cache, ring) = new_cache("arp");

    let mut arp = Vec::new();
    arp.extend_from_slice(&1u16.to_be_bytes());
    arp.extend_from_slice(&0x0800u16.to_be_bytes());
    arp.push(6);
    arp.push(4);
    arp.extend_from_slice(&2u16.to_be_bytes()); // reply
    arp.extend_from_slice(&[0xaa; 6]);
    arp.extend_from_slice(&[10, 0, 0, 1]);
    arp.extend_from_slice(&[0xbb; 6]);
    arp.extend_from_slice(&[10, 0, 0, 2]);

    let mut pkt = Packet::default();
    pkt.timestamp = Duration::from_secs(1);
    pkt.ethertype = ETHERTYPE_ARP;
    pkt.frame = arp;

    cache.put_packet(&mut pkt);

    let Some(ExportItem::Packet(rec)) = ring.pop() else {
        panic!("arp should export a standalone packet record");
    };
    assert_eq!(rec.ethertype, ETHERTYPE_ARP);
    let Some(RecordExt::Arp(ext)) = rec.exts.first() else {
        panic!("arp extension missing");
    };
    assert_eq!(ext.opcode, 2);

    // No flow was created for the packet.
    assert_eq!(cache.stats().flows_created, 0);
    assert_eq!(cache.stats().packets_standalone, 1);
    cache.finish();
    assert!(ring.pop().is_none());
}

#[test]
fn packet_accounting_balances() {
    let (mut cache, ring) = new_cache("arp");

    // One flow packet, one ARP packet, one undecodable frame.
    cache.put_packet(&mut udp_payload_packet(b"x", 1000, 2000, 1));
    let mut arp_pkt = Packet::default();
    arp_pkt.ethertype = ETHERTYPE_ARP;
    arp_pkt.frame = vec![0u8; 28];
    cache.put_packet(&mut arp_pkt);
    let mut junk = Packet::default();
    junk.ethertype = 0x9999;
    cache.put_packet(&mut junk);

    let stats = cache.stats();
    assert_eq!(stats.packets_seen, 3);
    assert_eq!(
        stats.packets_seen,
        stats.flows_created + stats.packets_standalone + stats.packets_rejected
    );
    drop(ring);
}
