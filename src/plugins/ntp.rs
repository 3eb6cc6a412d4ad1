//! NTP header parser plugin.
//!
//! NTP exchanges are single request/response datagrams, so flows on port
//! 123 are flushed right after creation; every exported record carries one
//! NTP message.

use nom_derive::{Nom, Parse};
use serde::Serialize;

use crate::export::fields::{FieldDef, IPFIX_NTP_TEMPLATE};
use crate::export::wire::{put_framed_str, put_varlen};
use crate::flow::Flow;
use crate::packet::Packet;
use crate::plugins::{ExtType, FLOW_FLUSH, ProcessPlugin, RecordExt};

const NTP_PORT: u16 = 123;
const NTP_HEADER_LEN: usize = 48;

/// Fixed NTP header after the leap/version/mode byte.
#[derive(Nom)]
struct NtpWire {
    stratum: u8,
    poll: u8,
    precision: u8,
    root_delay: u32,
    root_dispersion: u32,
    reference_id: u32,
    reference_ts: u64,
    origin_ts: u64,
    receive_ts: u64,
    transmit_ts: u64,
}

/// NTP extension record. The reference identifier and timestamps are kept
/// in their textual form (dotted quad, `seconds.fraction`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct NtpExt {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: u8,
    pub precision: u8,
    pub delay: u32,
    pub dispersion: u32,
    pub reference_id: String,
    pub reference: String,
    pub origin: String,
    pub receive: String,
    pub sent: String,
}

impl NtpExt {
    pub fn fill_ipfix(&self, buf: &mut Vec<u8>) {
        buf.push(self.leap);
        buf.push(self.version);
        buf.push(self.mode);
        buf.push(self.stratum);
        buf.push(self.poll);
        buf.push(self.precision);
        buf.extend_from_slice(&self.delay.to_be_bytes());
        buf.extend_from_slice(&self.dispersion.to_be_bytes());
        put_varlen(buf, self.reference_id.as_bytes());
        put_varlen(buf, self.reference.as_bytes());
        put_varlen(buf, self.origin.as_bytes());
        put_varlen(buf, self.receive.as_bytes());
        put_varlen(buf, self.sent.as_bytes());
    }

    pub fn fill_framed(&self, buf: &mut Vec<u8>) {
        buf.push(self.leap);
        buf.push(self.version);
        buf.push(self.mode);
        buf.push(self.stratum);
        buf.push(self.poll);
        buf.push(self.precision);
        buf.extend_from_slice(&self.delay.to_be_bytes());
        buf.extend_from_slice(&self.dispersion.to_be_bytes());
        put_framed_str(buf, self.reference_id.as_bytes());
        put_framed_str(buf, self.reference.as_bytes());
        put_framed_str(buf, self.origin.as_bytes());
        put_framed_str(buf, self.receive.as_bytes());
        put_framed_str(buf, self.sent.as_bytes());
    }
}

#[derive(Debug, Default, Clone)]
pub struct NtpPlugin {
    requests: u64,
    responses: u64,
    total: u64,
}

impl ProcessPlugin for NtpPlugin {
    fn name(&self) -> &'static str {
        "ntp"
    }

    fn ext_type(&self) -> ExtType {
        ExtType::Ntp
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> u32 {
        if pkt.src_port == NTP_PORT || pkt.dst_port == NTP_PORT {
            self.add_ext(flow, pkt);
            return FLOW_FLUSH;
        }
        0
    }

    fn finish(&mut self) {
        tracing::info!(
            requests = self.requests,
            responses = self.responses,
            total = self.total,
            "ntp plugin stats"
        );
    }

    fn ipfix_fields(&self) -> &'static [FieldDef] {
        IPFIX_NTP_TEMPLATE
    }

    fn framed_fields(&self) -> &'static str {
        "NTP_LEAP,NTP_VERSION,NTP_MODE,NTP_STRATUM,NTP_POLL,NTP_PRECISION,NTP_DELAY,\
         NTP_DISPERSION,NTP_REF_ID,NTP_REF,NTP_ORIG,NTP_RECV,NTP_SENT"
    }

    fn max_payload_len(&self) -> u16 {
        NTP_HEADER_LEN as u16
    }

    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(self.clone())
    }
}

impl NtpPlugin {
    fn add_ext(&mut self, flow: &mut Flow, pkt: &Packet) {
        if let Some(ext) = self.parse_ntp(pkt.payload()) {
            if pkt.dst_port == NTP_PORT {
                self.requests += 1;
            } else {
                self.responses += 1;
            }
            flow.add_extension(RecordExt::Ntp(ext));
        }
    }

    fn parse_ntp(&mut self, payload: &[u8]) -> Option<NtpExt> {
        if payload.len() < NTP_HEADER_LEN {
            return None;
        }
        self.total += 1;

        let flags = payload[0];
        let (_, wire) = NtpWire::parse_be(&payload[1..]).ok()?;

        let mut ext = NtpExt::default();
        ext.leap = flags >> 6;
        ext.version = (flags >> 3) & 0x07;
        ext.mode = flags & 0x07;
        ext.stratum = wire.stratum;
        ext.poll = wire.poll;
        ext.precision = wire.precision;
        ext.delay = wire.root_delay;
        ext.dispersion = wire.root_dispersion;
        ext.reference_id = dotted_quad(wire.reference_id);
        ext.reference = ntp_timestamp(wire.reference_ts);
        ext.origin = ntp_timestamp(wire.origin_ts);
        ext.receive = ntp_timestamp(wire.receive_ts);
        ext.sent = ntp_timestamp(wire.transmit_ts);
        Some(ext)
    }
}

fn dotted_quad(v: u32) -> String {
    let b = v.to_be_bytes();
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

/// NTP 64-bit timestamp rendered as `seconds.fraction`.
fn ntp_timestamp(v: u64) -> String {
    format!("{}.{}", v >> 32, v & 0xffff_ffff)
}
