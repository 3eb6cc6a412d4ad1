//! Biflow records and cache keys.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Serialize;

use crate::packet::Packet;
use crate::parser::IPPROTO_TCP;
use crate::plugins::{ExtType, RecordExt};

/// Key length of an IPv6 flow; IPv4 keys use the first 14 bytes.
/// Plugins do not participate in keying.
pub const MAX_KEY_LENGTH: usize = 38;

/// Why a flow left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EndReason {
    /// No packet seen for the inactive timeout.
    Inactive = 1,
    /// Flow lived longer than the active timeout.
    Active = 2,
    /// End of flow observed (new SYN on a finished TCP flow).
    Eof = 3,
    /// Forced out: shutdown or plugin-requested flush.
    Forced = 4,
    /// Evicted to make room in a full cache line.
    NoResources = 5,
}

/// Packed lookup key: `(src_port, dst_port, proto, ip_version, src_ip,
/// dst_ip)` in network byte order, 14 bytes for IPv4 and 38 for IPv6.
#[derive(Debug, Clone, Copy)]
pub struct FlowKey {
    bytes: [u8; MAX_KEY_LENGTH],
    len: u8,
}

impl FlowKey {
    /// Builds the forward and reverse keys for a packet, or `None` for
    /// non-IP packets.
    pub fn from_packet(pkt: &Packet) -> Option<(FlowKey, FlowKey)> {
        if pkt.ip_version != 4 && pkt.ip_version != 6 {
            return None;
        }
        let fwd = Self::build(
            pkt.ip_proto,
            pkt.ip_version,
            pkt.src_port,
            pkt.dst_port,
            &pkt.src_ip,
            &pkt.dst_ip,
        );
        let rev = Self::build(
            pkt.ip_proto,
            pkt.ip_version,
            pkt.dst_port,
            pkt.src_port,
            &pkt.dst_ip,
            &pkt.src_ip,
        );
        Some((fwd, rev))
    }

    fn build(
        proto: u8,
        ip_version: u8,
        src_port: u16,
        dst_port: u16,
        src_ip: &IpAddr,
        dst_ip: &IpAddr,
    ) -> FlowKey {
        let mut bytes = [0u8; MAX_KEY_LENGTH];
        bytes[0..2].copy_from_slice(&src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&dst_port.to_be_bytes());
        bytes[4] = proto;
        bytes[5] = ip_version;
        let len = match (src_ip, dst_ip) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                bytes[6..10].copy_from_slice(&s.octets());
                bytes[10..14].copy_from_slice(&d.octets());
                14
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                bytes[6..22].copy_from_slice(&s.octets());
                bytes[22..38].copy_from_slice(&d.octets());
                38
            }
            _ => {
                // Mixed families cannot occur for a decoded packet.
                14
            }
        };
        FlowKey { bytes, len }
    }

    /// FNV-1a over the packed key bytes. Fast, non-cryptographic; the
    /// value 0 is reserved for empty cache slots and in practice never
    /// produced by real keys.
    pub fn hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        for &b in &self.bytes[..usize::from(self.len)] {
            h ^= u64::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }
}

/// One bidirectional flow record. Endpoint identity is frozen at creation;
/// the packet that creates the flow defines the source direction.
#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub time_first: Duration,
    pub time_last: Duration,
    pub src_octets: u64,
    pub dst_octets: u64,
    pub src_packets: u32,
    pub dst_packets: u32,
    pub src_tcp_flags: u8,
    pub dst_tcp_flags: u8,

    pub ip_version: u8,
    pub ip_proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,

    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],

    pub end_reason: Option<EndReason>,

    /// Plugin extensions in insertion order.
    pub exts: Vec<RecordExt>,
}

impl Default for Flow {
    fn default() -> Self {
        Flow {
            time_first: Duration::ZERO,
            time_last: Duration::ZERO,
            src_octets: 0,
            dst_octets: 0,
            src_packets: 0,
            dst_packets: 0,
            src_tcp_flags: 0,
            dst_tcp_flags: 0,
            ip_version: 0,
            ip_proto: 0,
            src_port: 0,
            dst_port: 0,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_mac: [0; 6],
            dst_mac: [0; 6],
            end_reason: None,
            exts: Vec::new(),
        }
    }
}

impl Flow {
    /// Initializes the record from the packet that creates the flow.
    pub fn create_from(&mut self, pkt: &Packet) {
        self.time_first = pkt.timestamp;
        self.time_last = pkt.timestamp;

        self.src_mac = pkt.src_mac;
        self.dst_mac = pkt.dst_mac;

        self.ip_version = pkt.ip_version;
        self.ip_proto = pkt.ip_proto;
        self.src_ip = pkt.src_ip;
        self.dst_ip = pkt.dst_ip;
        self.src_port = pkt.src_port;
        self.dst_port = pkt.dst_port;

        self.src_packets = 1;
        self.src_octets = u64::from(pkt.ip_length);
        if pkt.ip_proto == IPPROTO_TCP {
            self.src_tcp_flags = pkt.tcp_flags;
        }
    }

    /// Accounts a packet into the direction it belongs to.
    pub fn update_from(&mut self, pkt: &Packet, source: bool) {
        self.time_last = pkt.timestamp;
        if source {
            self.src_packets += 1;
            self.src_octets += u64::from(pkt.ip_length);
            if pkt.ip_proto == IPPROTO_TCP {
                self.src_tcp_flags |= pkt.tcp_flags;
            }
        } else {
            self.dst_packets += 1;
            self.dst_octets += u64::from(pkt.ip_length);
            if pkt.ip_proto == IPPROTO_TCP {
                self.dst_tcp_flags |= pkt.tcp_flags;
            }
        }
    }

    /// Resets counters while keeping endpoint identity, for the
    /// flush-with-reinsert path. `time_first` restarts at `time_last`.
    pub fn soft_clean(&mut self) {
        self.exts.clear();
        self.time_first = self.time_last;
        self.src_packets = 0;
        self.dst_packets = 0;
        self.src_octets = 0;
        self.dst_octets = 0;
        self.src_tcp_flags = 0;
        self.dst_tcp_flags = 0;
        self.end_reason = None;
    }

    pub fn add_extension(&mut self, ext: RecordExt) {
        self.exts.push(ext);
    }

    /// First extension of the given type, if present.
    pub fn extension(&self, tag: ExtType) -> Option<&RecordExt> {
        self.exts.iter().find(|e| e.ext_type() == tag)
    }

    pub fn extension_mut(&mut self, tag: ExtType) -> Option<&mut RecordExt> {
        self.exts.iter_mut().find(|e| e.ext_type() == tag)
    }

    /// Bitmask of extension types present, used as the template key.
    pub fn ext_bitmask(&self) -> u64 {
        self.exts.iter().fold(0u64, |m, e| m | e.ext_type().bit())
    }
}
