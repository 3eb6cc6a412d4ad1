use std::hint::black_box;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};

use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::packet::Packet;
use flowprobe::plugins::PluginChain;
use flowprobe::ring::FlowRing;

fn make_packet(flow_id: u16, ts: u64) -> Packet {
    let mut pkt = Packet::default();
    pkt.timestamp = Duration::from_secs(ts);
    pkt.ip_version = 4;
    pkt.ip_proto = 17;
    pkt.ip_length = 100;
    pkt.src_ip = IpAddr::from([10, (flow_id >> 8) as u8, flow_id as u8, 1]);
    pkt.dst_ip = IpAddr::from([10, 0, 0, 2]);
    pkt.src_port = 10000 + flow_id;
    pkt.dst_port = 53;
    pkt
}

fn cache_put(c: &mut Criterion) {
    c.bench_function("cache_put_1k_flows", |b| {
        let cfg = CacheConfig {
            size: 1 << 14,
            line_size: 16,
            ..CacheConfig::default()
        };
        let ring = Arc::new(FlowRing::new(1 << 14));
        let mut cache = FlowCache::new(&cfg, PluginChain::default(), ring.clone()).unwrap();
        let mut packets: Vec<Packet> = (0..1000).map(|i| make_packet(i, 1)).collect();

        b.iter(|| {
            for pkt in packets.iter_mut() {
                cache.put_packet(black_box(pkt));
            }
            while ring.pop().is_some() {}
        });
    });
}

criterion_group!(benches, cache_put);
criterion_main!(benches);
