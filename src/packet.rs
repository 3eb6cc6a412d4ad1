use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Serialize;

use crate::plugins::RecordExt;

/// Upper bound on the bytes kept from a single frame.
pub const MAX_PKT_SIZE: usize = 1600;

/// Number of packets carried by one [`PacketBlock`].
pub const PKT_BLOCK_SIZE: usize = 32;

/// TCP control bits as accumulated into flow records.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// A decoded frame up to the transport layer.
///
/// The raw frame bytes are retained (truncated to the snapshot length) so
/// plugins can inspect the application payload; `payload_offset` delimits
/// where it starts. The `source_pkt` direction flag is assigned by the flow
/// cache, not by capture.
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    pub timestamp: Duration,

    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,

    pub ip_length: u16,
    pub ip_version: u8,
    pub ip_ttl: u8,
    pub ip_proto: u8,
    pub ip_tos: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,

    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub tcp_seq: u32,
    pub tcp_ack: u32,

    /// Raw frame bytes, bounded by the snapshot length.
    pub frame: Vec<u8>,
    /// Offset of the application payload within `frame`.
    pub payload_offset: usize,
    /// True when this packet travels in the source direction of its flow.
    pub source_pkt: bool,

    /// Extensions attached by `pre_create` hooks for the standalone
    /// packet-export path.
    pub exts: Vec<RecordExt>,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            timestamp: Duration::ZERO,
            dst_mac: [0; 6],
            src_mac: [0; 6],
            ethertype: 0,
            ip_length: 0,
            ip_version: 0,
            ip_ttl: 0,
            ip_proto: 0,
            ip_tos: 0,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            frame: Vec::new(),
            payload_offset: 0,
            source_pkt: true,
            exts: Vec::new(),
        }
    }
}

impl Packet {
    /// Application payload, empty when the frame was truncated before it.
    pub fn payload(&self) -> &[u8] {
        &self.frame[self.payload_offset.min(self.frame.len())..]
    }

    /// Resets per-packet state so the storage buffers can be reused
    /// without reallocating the frame backing store.
    pub fn reset(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        *self = Packet::default();
        self.frame = frame;
        self.frame.clear();
    }
}

/// Standalone record for packets exported without a flow
/// (the `EXPORT_PACKET` path, e.g. ARP).
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub timestamp: Duration,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ethertype: u16,
    pub exts: Vec<RecordExt>,
}

impl PacketRecord {
    /// Moves the packet's extension chain into a standalone record.
    pub fn from_packet(pkt: &mut Packet) -> Self {
        PacketRecord {
            timestamp: pkt.timestamp,
            src_mac: pkt.src_mac,
            dst_mac: pkt.dst_mac,
            ethertype: pkt.ethertype,
            exts: std::mem::take(&mut pkt.exts),
        }
    }
}

/// A preallocated batch of packets moved through the input queue as one
/// unit. Blocks rotate between the capture worker and the storage worker;
/// the packet array and its frame buffers are never reallocated.
#[derive(Debug)]
pub struct PacketBlock {
    pub pkts: Vec<Packet>,
    /// Number of valid packets in `pkts`.
    pub cnt: usize,
    /// Sum of captured frame bytes in this block.
    pub bytes: u64,
}

impl PacketBlock {
    pub fn new(size: usize) -> Self {
        let mut pkts = Vec::with_capacity(size);
        for _ in 0..size {
            let mut p = Packet::default();
            p.frame = Vec::with_capacity(MAX_PKT_SIZE);
            pkts.push(p);
        }
        PacketBlock {
            pkts,
            cnt: 0,
            bytes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.pkts.len()
    }

    pub fn clear(&mut self) {
        self.cnt = 0;
        self.bytes = 0;
    }
}
