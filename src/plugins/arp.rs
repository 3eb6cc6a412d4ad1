//! ARP parser plugin.
//!
//! ARP frames carry no IP header, so no flow can be created for them.
//! Instead `pre_create` parses the frame, attaches the extension to the
//! packet itself and asks the cache to export it as a standalone record.

use nom::bytes::complete::take;
use nom_derive::{Nom, Parse};
use serde::Serialize;

use crate::export::fields::{FieldDef, IPFIX_ARP_TEMPLATE};
use crate::export::wire::{put_framed_str, put_varlen};
use crate::packet::Packet;
use crate::parser::ETHERTYPE_ARP;
use crate::plugins::{EXPORT_PACKET, ExtType, ProcessPlugin, RecordExt};

#[derive(Nom)]
struct ArpFixed {
    ha_format: u16,
    pa_format: u16,
    ha_length: u8,
    pa_length: u8,
    opcode: u16,
}

/// ARP extension record; addresses keep their wire length
/// (6/4 bytes for Ethernet/IPv4, other combinations pass through).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArpExt {
    pub ha_format: u16,
    pub pa_format: u16,
    pub opcode: u16,
    pub src_ha: Vec<u8>,
    pub src_pa: Vec<u8>,
    pub dst_ha: Vec<u8>,
    pub dst_pa: Vec<u8>,
}

impl ArpExt {
    pub fn fill_ipfix(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ha_format.to_be_bytes());
        buf.extend_from_slice(&self.pa_format.to_be_bytes());
        buf.extend_from_slice(&self.opcode.to_be_bytes());
        put_varlen(buf, &self.src_ha);
        put_varlen(buf, &self.src_pa);
        put_varlen(buf, &self.dst_ha);
        put_varlen(buf, &self.dst_pa);
    }

    pub fn fill_framed(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ha_format.to_be_bytes());
        buf.extend_from_slice(&self.pa_format.to_be_bytes());
        buf.extend_from_slice(&self.opcode.to_be_bytes());
        put_framed_str(buf, &self.src_ha);
        put_framed_str(buf, &self.src_pa);
        put_framed_str(buf, &self.dst_ha);
        put_framed_str(buf, &self.dst_pa);
    }
}

#[derive(Debug, Default, Clone)]
pub struct ArpPlugin {
    total: u64,
}

impl ProcessPlugin for ArpPlugin {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn ext_type(&self) -> ExtType {
        ExtType::Arp
    }

    fn pre_create(&mut self, pkt: &mut Packet) -> u32 {
        if pkt.ethertype != ETHERTYPE_ARP {
            return 0;
        }
        let Some(ext) = self.parse_arp(pkt.payload()) else {
            return 0;
        };
        pkt.exts.push(RecordExt::Arp(ext));
        EXPORT_PACKET
    }

    fn finish(&mut self) {
        tracing::info!(total = self.total, "arp plugin stats");
    }

    fn ipfix_fields(&self) -> &'static [FieldDef] {
        IPFIX_ARP_TEMPLATE
    }

    fn framed_fields(&self) -> &'static str {
        "ARP_HA_FORMAT,ARP_PA_FORMAT,ARP_OPCODE,ARP_SRC_HA,ARP_SRC_PA,ARP_DST_HA,ARP_DST_PA"
    }

    /// ARP has no ports; every frame must keep its payload.
    fn needs_every_packet(&self) -> bool {
        true
    }

    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(self.clone())
    }
}

impl ArpPlugin {
    fn parse_arp(&mut self, payload: &[u8]) -> Option<ArpExt> {
        self.total += 1;
        let (rest, fixed) = ArpFixed::parse_be(payload).ok()?;

        let ha = usize::from(fixed.ha_length);
        let pa = usize::from(fixed.pa_length);
        let (rest, src_ha) = take::<_, _, nom::error::Error<&[u8]>>(ha)(rest).ok()?;
        let (rest, src_pa) = take::<_, _, nom::error::Error<&[u8]>>(pa)(rest).ok()?;
        let (rest, dst_ha) = take::<_, _, nom::error::Error<&[u8]>>(ha)(rest).ok()?;
        let (_, dst_pa) = take::<_, _, nom::error::Error<&[u8]>>(pa)(rest).ok()?;

        Some(ArpExt {
            ha_format: fixed.ha_format,
            pa_format: fixed.pa_format,
            opcode: fixed.opcode,
            src_ha: src_ha.to_vec(),
            src_pa: src_pa.to_vec(),
            dst_ha: dst_ha.to_vec(),
            dst_pa: dst_pa.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arp_request() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&1u16.to_be_bytes()); // Ethernet
        p.extend_from_slice(&0x0800u16.to_be_bytes()); // IPv4
        p.push(6);
        p.push(4);
        p.extend_from_slice(&1u16.to_be_bytes()); // request
        p.extend_from_slice(&[0xaa; 6]);
        p.extend_from_slice(&[10, 0, 0, 1]);
        p.extend_from_slice(&[0x00; 6]);
        p.extend_from_slice(&[10, 0, 0, 2]);
        p
    }

    #[test]
    fn parses_request() {
        let mut plugin = ArpPlugin::default();
        let ext = plugin.parse_arp(&arp_request()).unwrap();
        assert_eq!(ext.ha_format, 1);
        assert_eq!(ext.pa_format, 0x0800);
        assert_eq!(ext.opcode, 1);
        assert_eq!(ext.src_ha, vec![0xaa; 6]);
        assert_eq!(ext.src_pa, vec![10, 0, 0, 1]);
        assert_eq!(ext.dst_pa, vec![10, 0, 0, 2]);
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut plugin = ArpPlugin::default();
        assert!(plugin.parse_arp(&arp_request()[..10]).is_none());
    }

    #[test]
    fn arp_packet_exported_standalone() {
        let mut plugin = ArpPlugin::default();
        let mut pkt = Packet::default();
        pkt.ethertype = ETHERTYPE_ARP;
        pkt.frame = arp_request();
        assert_eq!(plugin.pre_create(&mut pkt), EXPORT_PACKET);
        assert_eq!(pkt.exts.len(), 1);
    }

    #[test]
    fn non_arp_ethertype_ignored() {
        let mut plugin = ArpPlugin::default();
        let mut pkt = Packet::default();
        pkt.ethertype = 0x0800;
        assert_eq!(plugin.pre_create(&mut pkt), 0);
    }
}
