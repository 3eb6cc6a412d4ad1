//! Line-associative flow cache.
//!
//! A fixed table of slots grouped into lines (associative buckets). The
//! line index comes from the key hash masked by `line_mask`; within a
//! line, a hit is promoted to the head (MRU) by shifting the slots in
//! between, and eviction takes the tail (LRU). A flow created after an
//! eviction opens its slot at mid-line so it is not immediately evicted
//! again.
//!
//! Timeout handling is amortized: after every packet a rolling index
//! advances by half a line and expires flows whose `time_last` is older
//! than the inactive timeout, so one full pass covers the entire table at
//! a bounded per-packet cost.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::ProbeError;
use crate::flow::{EndReason, Flow, FlowKey};
use crate::packet::{Packet, PacketRecord, tcp_flags};
use crate::plugins::{EXPORT_PACKET, FLOW_FLUSH, FLOW_FLUSH_WITH_REINSERT, PluginChain};
use crate::ring::{ExportItem, FlowRing};

pub const DEFAULT_CACHE_SIZE: u32 = 1 << 17;
pub const DEFAULT_LINE_SIZE: u32 = 16;
pub const DEFAULT_ACTIVE_TIMEOUT: f64 = 300.0;
pub const DEFAULT_INACTIVE_TIMEOUT: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Slot count, a power of two.
    pub size: u32,
    /// Slots per associative line, a power of two not larger than `size`.
    pub line_size: u32,
    pub active: Duration,
    pub inactive: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: DEFAULT_CACHE_SIZE,
            line_size: DEFAULT_LINE_SIZE,
            active: Duration::from_secs_f64(DEFAULT_ACTIVE_TIMEOUT),
            inactive: Duration::from_secs_f64(DEFAULT_INACTIVE_TIMEOUT),
        }
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    /// Hash of the flow's canonical key; 0 marks an empty slot.
    hash: u64,
    flow: Flow,
}

impl CacheSlot {
    fn is_empty(&self) -> bool {
        self.hash == 0
    }

    fn create(&mut self, pkt: &Packet, hash: u64) {
        self.hash = hash;
        self.flow.create_from(pkt);
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub packets_seen: u64,
    /// Packets exported standalone via `EXPORT_PACKET`.
    pub packets_standalone: u64,
    /// Packets that produced no key (non-IP).
    pub packets_rejected: u64,
    pub flows_created: u64,
    pub hits: u64,
    pub empty: u64,
    pub not_empty: u64,
    pub expired: u64,
    pub flushed: u64,
    lookups: u64,
    lookups2: u64,
}

impl CacheStats {
    pub fn print_report(&self) {
        let avg = if self.hits != 0 {
            self.lookups as f64 / self.hits as f64
        } else {
            0.0
        };
        let var = if self.hits != 0 {
            self.lookups2 as f64 / self.hits as f64 - avg * avg
        } else {
            0.0
        };
        println!("Hits: {}", self.hits);
        println!("Empty: {}", self.empty);
        println!("Not empty: {}", self.not_empty);
        println!("Expired: {}", self.expired);
        println!("Flushed: {}", self.flushed);
        println!("Average Lookup: {:.2}", avg);
        println!("Variance Lookup: {:.2}", var);
    }
}

pub struct FlowCache {
    records: Vec<CacheSlot>,
    size: u32,
    line_size: u32,
    line_mask: u64,
    /// Offset within a line where a flow created after an eviction lands.
    new_idx: u32,
    timeout_idx: u32,
    active: Duration,
    inactive: Duration,
    plugins: PluginChain,
    out: Arc<FlowRing>,
    stats: CacheStats,
}

impl FlowCache {
    pub fn new(
        cfg: &CacheConfig,
        plugins: PluginChain,
        out: Arc<FlowRing>,
    ) -> Result<FlowCache, ProbeError> {
        if !cfg.size.is_power_of_two() || !cfg.line_size.is_power_of_two() {
            return Err(ProbeError::Config(
                "cache size and line size must be powers of two".into(),
            ));
        }
        if cfg.size < cfg.line_size {
            return Err(ProbeError::Config(
                "cache size must be at least one line".into(),
            ));
        }

        let mut records = Vec::with_capacity(cfg.size as usize);
        records.resize_with(cfg.size as usize, CacheSlot::default);

        Ok(FlowCache {
            records,
            size: cfg.size,
            line_size: cfg.line_size,
            line_mask: u64::from((cfg.size - 1) & !(cfg.line_size - 1)),
            new_idx: cfg.line_size / 2,
            timeout_idx: 0,
            active: cfg.active,
            inactive: cfg.inactive,
            plugins,
            out,
            stats: CacheStats::default(),
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Feeds one packet into the cache: updates the matching flow record
    /// or creates a new one, driving the plugin hooks along the way.
    pub fn put_packet(&mut self, pkt: &mut Packet) {
        self.stats.packets_seen += 1;
        self.process(pkt);
    }

    fn process(&mut self, pkt: &mut Packet) {
        let pre = self.plugins.pre_create(pkt);
        if pre & EXPORT_PACKET != 0 {
            // The packet is exported standalone; flow creation is
            // skipped even when the packet could have created one.
            self.stats.packets_standalone += 1;
            let rec = PacketRecord::from_packet(pkt);
            self.out.push(ExportItem::Packet(rec));
            return;
        }

        let Some((fwd, rev)) = FlowKey::from_packet(pkt) else {
            self.stats.packets_rejected += 1;
            return;
        };

        let line_size = self.line_size as usize;
        let mut hash = fwd.hash();
        let mut line = (hash & self.line_mask) as usize;
        let mut flow_index = 0usize;
        let mut found = false;
        let mut source_flow = true;

        for i in line..line + line_size {
            if self.records[i].hash == hash {
                flow_index = i;
                found = true;
                break;
            }
        }

        if !found {
            let rev_hash = rev.hash();
            let rev_line = (rev_hash & self.line_mask) as usize;
            for i in rev_line..rev_line + line_size {
                if self.records[i].hash == rev_hash {
                    flow_index = i;
                    found = true;
                    source_flow = false;
                    hash = rev_hash;
                    line = rev_line;
                    break;
                }
            }
        }

        if found {
            let distance = (flow_index - line + 1) as u64;
            self.stats.lookups += distance;
            self.stats.lookups2 += distance * distance;
            self.stats.hits += 1;

            // Promote the hit to the head of its line.
            self.records[line..=flow_index].rotate_right(1);
            flow_index = line;
        } else {
            // No match in either direction; take the first empty slot of
            // the forward line.
            for i in line..line + line_size {
                if self.records[i].is_empty() {
                    flow_index = i;
                    found = true;
                    break;
                }
            }
            if found {
                self.stats.empty += 1;
            } else {
                // Line is full: evict the tail and open a slot mid-line.
                flow_index = line + line_size - 1;
                self.plugins.pre_export(&mut self.records[flow_index].flow);
                self.records[flow_index].flow.end_reason = Some(EndReason::NoResources);
                self.export_at(flow_index);
                self.stats.expired += 1;
                self.stats.not_empty += 1;

                let new_index = line + self.new_idx as usize;
                self.records[new_index..=flow_index].rotate_right(1);
                flow_index = new_index;
            }
        }

        pkt.source_pkt = source_flow;

        // A SYN on a flow already carrying FIN or RST in this direction
        // starts a new connection: close the old flow and reprocess.
        let finished_flags = if source_flow {
            self.records[flow_index].flow.src_tcp_flags
        } else {
            self.records[flow_index].flow.dst_tcp_flags
        };
        if pkt.tcp_flags & tcp_flags::SYN != 0
            && finished_flags & (tcp_flags::FIN | tcp_flags::RST) != 0
        {
            self.records[flow_index].flow.end_reason = Some(EndReason::Eof);
            self.export_at(flow_index);
            self.process(pkt);
            return;
        }

        if self.records[flow_index].is_empty() {
            self.records[flow_index].create(pkt, hash);
            self.stats.flows_created += 1;
            let ret = self.plugins.post_create(&mut self.records[flow_index].flow, pkt);
            if ret & FLOW_FLUSH != 0 {
                self.records[flow_index].flow.end_reason = Some(EndReason::Forced);
                self.export_at(flow_index);
                self.stats.flushed += 1;
            }
        } else {
            if pkt
                .timestamp
                .saturating_sub(self.records[flow_index].flow.time_last)
                >= self.inactive
            {
                self.records[flow_index].flow.end_reason = Some(EndReason::Inactive);
                self.plugins.pre_export(&mut self.records[flow_index].flow);
                self.export_at(flow_index);
                self.stats.expired += 1;
                self.process(pkt);
                return;
            }

            let ret = self.plugins.pre_update(&mut self.records[flow_index].flow, pkt);
            if ret & FLOW_FLUSH != 0 {
                self.flush_slot(pkt, flow_index, ret, source_flow);
                return;
            }

            self.records[flow_index].flow.update_from(pkt, source_flow);
            let ret = self.plugins.post_update(&mut self.records[flow_index].flow, pkt);
            if ret & FLOW_FLUSH != 0 {
                self.flush_slot(pkt, flow_index, ret, source_flow);
                return;
            }

            if pkt
                .timestamp
                .saturating_sub(self.records[flow_index].flow.time_first)
                >= self.active
            {
                self.records[flow_index].flow.end_reason = Some(EndReason::Active);
                self.plugins.pre_export(&mut self.records[flow_index].flow);
                self.export_at(flow_index);
                self.stats.expired += 1;
            }
        }

        self.export_expired(pkt.timestamp);
    }

    /// Plugin-requested flush. With reinsert, the current counters and
    /// extensions are exported as one record and the slot restarts from
    /// the triggering packet, keeping endpoint identity.
    fn flush_slot(&mut self, pkt: &mut Packet, idx: usize, ret: u32, source_flow: bool) {
        self.stats.flushed += 1;

        if ret & FLOW_FLUSH_WITH_REINSERT == FLOW_FLUSH_WITH_REINSERT {
            let exported = {
                let flow = &mut self.records[idx].flow;
                let exts = std::mem::take(&mut flow.exts);
                let mut copy = flow.clone();
                copy.exts = exts;
                copy.end_reason = Some(EndReason::Forced);
                copy
            };
            self.out.push(ExportItem::Flow(Box::new(exported)));

            {
                let flow = &mut self.records[idx].flow;
                flow.soft_clean();
                flow.update_from(pkt, source_flow);
            }
            let ret = self.plugins.post_create(&mut self.records[idx].flow, pkt);
            if ret & FLOW_FLUSH != 0 {
                self.flush_slot(pkt, idx, ret, source_flow);
            }
        } else {
            self.records[idx].flow.end_reason = Some(EndReason::Forced);
            self.export_at(idx);
        }
    }

    /// Moves the slot's flow out to the export ring and empties the slot.
    /// Never blocks; the ring counts records it cannot take.
    fn export_at(&mut self, idx: usize) {
        let slot = &mut self.records[idx];
        let flow = std::mem::take(&mut slot.flow);
        slot.hash = 0;
        self.out.push(ExportItem::Flow(Box::new(flow)));
    }

    /// Rolling timeout sweep: examines half a line's worth of slots and
    /// expires flows idle longer than the inactive timeout. Consecutive
    /// calls cover the whole table.
    pub fn export_expired(&mut self, now: Duration) {
        let start = self.timeout_idx as usize;
        let end = start + self.new_idx as usize;
        for i in start..end {
            let expired = {
                let slot = &self.records[i];
                !slot.is_empty() && now.saturating_sub(slot.flow.time_last) >= self.inactive
            };
            if expired {
                self.records[i].flow.end_reason = Some(EndReason::Inactive);
                self.plugins.pre_export(&mut self.records[i].flow);
                self.export_at(i);
                self.stats.expired += 1;
            }
        }
        self.timeout_idx = (self.timeout_idx + self.new_idx) & (self.size - 1);
    }

    /// Exports every remaining flow with a forced end reason and runs the
    /// plugin finish hooks.
    pub fn finish(&mut self) {
        self.plugins.finish();
        for i in 0..self.records.len() {
            if !self.records[i].is_empty() {
                self.plugins.pre_export(&mut self.records[i].flow);
                self.records[i].flow.end_reason = Some(EndReason::Forced);
                self.export_at(i);
                self.stats.expired += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn small_cache() -> (FlowCache, Arc<FlowRing>) {
        // One line spanning the whole table: every flow collides.
        let cfg = CacheConfig {
            size: 16,
            line_size: 16,
            ..CacheConfig::default()
        };
        let ring = Arc::new(FlowRing::new(1024));
        let cache = FlowCache::new(&cfg, PluginChain::default(), ring.clone()).unwrap();
        (cache, ring)
    }

    fn udp_packet(src_port: u16, ts_secs: u64) -> Packet {
        let mut pkt = Packet::default();
        pkt.timestamp = Duration::from_secs(ts_secs);
        pkt.ip_version = 4;
        pkt.ip_proto = 17;
        pkt.ip_length = 100;
        pkt.src_ip = IpAddr::from([10, 0, 0, 1]);
        pkt.dst_ip = IpAddr::from([10, 0, 0, 2]);
        pkt.src_port = src_port;
        pkt.dst_port = 53;
        pkt
    }

    #[test]
    fn nonempty_slots_have_nonzero_hash() {
        let (mut cache, _ring) = small_cache();
        for p in 0..8 {
            cache.put_packet(&mut udp_packet(1000 + p, 1));
        }
        for slot in &cache.records {
            if !slot.is_empty() {
                assert_ne!(slot.hash, 0);
            }
        }
        assert_eq!(cache.stats.flows_created, 8);
    }

    #[test]
    fn hit_promotes_to_line_head() {
        let (mut cache, _ring) = small_cache();
        for p in 0..4 {
            cache.put_packet(&mut udp_packet(1000 + p, 1));
        }
        // Touch the flow sitting at the line tail.
        cache.put_packet(&mut udp_packet(1003, 2));
        assert_eq!(cache.records[0].flow.src_port, 1003);
        assert_eq!(cache.records[0].flow.src_packets, 2);
        assert_eq!(cache.records[1].flow.src_port, 1000);
    }

    #[test]
    fn full_line_evicts_tail_and_opens_mid_line() {
        let (mut cache, ring) = small_cache();
        for p in 0..16 {
            cache.put_packet(&mut udp_packet(1000 + p, 1));
        }
        // Promote everything except the flow with port 1003, leaving it
        // at the tail.
        for p in (0..16).rev() {
            if p != 3 {
                cache.put_packet(&mut udp_packet(1000 + p, 2));
            }
        }
        while ring.pop().is_some() {}

        cache.put_packet(&mut udp_packet(2000, 3));

        let Some(ExportItem::Flow(evicted)) = ring.pop() else {
            panic!("eviction should have exported a flow");
        };
        assert_eq!(evicted.src_port, 1003);
        assert_eq!(evicted.end_reason, Some(EndReason::NoResources));
        // The new flow occupies the mid-line slot.
        assert_eq!(cache.records[8].flow.src_port, 2000);
    }

    #[test]
    fn rolling_sweep_covers_table() {
        let (mut cache, ring) = small_cache();
        cache.put_packet(&mut udp_packet(1000, 1));
        // Sweep with a timestamp far past the inactive timeout; two
        // half-line passes cover all 16 slots.
        cache.export_expired(Duration::from_secs(100));
        cache.export_expired(Duration::from_secs(100));

        let Some(ExportItem::Flow(flow)) = ring.pop() else {
            panic!("sweep should have expired the flow");
        };
        assert_eq!(flow.end_reason, Some(EndReason::Inactive));
        assert_eq!(cache.timeout_idx, 8);
    }

    #[test]
    fn finish_forces_all_flows_out() {
        let (mut cache, ring) = small_cache();
        for p in 0..5 {
            cache.put_packet(&mut udp_packet(1000 + p, 1));
        }
        cache.finish();

        let mut reasons = Vec::new();
        while let Some(ExportItem::Flow(flow)) = ring.pop() {
            reasons.push(flow.end_reason);
        }
        assert_eq!(reasons.len(), 5);
        assert!(reasons.iter().all(|r| *r == Some(EndReason::Forced)));
    }
}
