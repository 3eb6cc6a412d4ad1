//! Length-framed record output.
//!
//! Mirrors the IPFIX field set without template negotiation on the wire:
//! the record layout is fixed per exporter at startup from the same field
//! lists. Every flow produces one message per attached extension, routed
//! to that plugin's output channel; flows without extensions go to the
//! basic channel. Messages are a 2-byte big-endian length followed by the
//! record.

use std::io::Write;

use tracing::warn;

use crate::export::ipfix::fill_basic_flow;
use crate::export::{ExportStats, FlowExporter};
use crate::flow::Flow;
use crate::packet::PacketRecord;
use crate::plugins::{EXTENSION_CNT, ExtType};
use crate::time::unix_millis;

#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Link identifier leading every record.
    pub link_bit_field: u64,
    /// Direction tag following the link field.
    pub dir_bit_field: u8,
    /// When set, the observation domain ID replaces the link field.
    pub odid: Option<u32>,
}

impl Default for FramedConfig {
    fn default() -> Self {
        FramedConfig {
            link_bit_field: 1,
            dir_bit_field: 0,
            odid: None,
        }
    }
}

/// One output channel: a byte sink shared with nothing else.
pub type Channel = Box<dyn Write + Send>;

pub struct FramedExporter {
    cfg: FramedConfig,
    channels: Vec<Channel>,
    /// Channel index per extension tag; unmapped tags fall back to the
    /// basic channel.
    ext_channel: [Option<usize>; EXTENSION_CNT],
    basic_channel: usize,
    buf: Vec<u8>,
    stats: ExportStats,
}

impl FramedExporter {
    /// Creates the exporter with its basic-flow channel (index 0).
    pub fn new(cfg: FramedConfig, basic: Channel) -> FramedExporter {
        FramedExporter {
            cfg,
            channels: vec![basic],
            ext_channel: [None; EXTENSION_CNT],
            basic_channel: 0,
            buf: Vec::new(),
            stats: ExportStats::default(),
        }
    }

    /// Registers the output channel for one plugin's records.
    pub fn add_plugin_channel(&mut self, tag: ExtType, sink: Channel) {
        self.channels.push(sink);
        self.ext_channel[tag as usize] = Some(self.channels.len() - 1);
    }

    fn fill_prefix(&mut self) {
        match self.cfg.odid {
            Some(odid) => self.buf.extend_from_slice(&odid.to_be_bytes()),
            None => self
                .buf
                .extend_from_slice(&self.cfg.link_bit_field.to_be_bytes()),
        }
        self.buf.push(self.cfg.dir_bit_field);
    }

    fn write_record(&mut self, channel: usize) -> bool {
        let len = self.buf.len().min(usize::from(u16::MAX)) as u16;
        let sink = &mut self.channels[channel];
        let ok = sink
            .write_all(&len.to_be_bytes())
            .and_then(|_| sink.write_all(&self.buf[..usize::from(len)]));
        if let Err(e) = ok {
            warn!("framed output write failed: {}", e);
            return false;
        }
        true
    }
}

impl FlowExporter for FramedExporter {
    fn export_flow(&mut self, flow: &Flow) {
        self.stats.flows_seen += 1;
        let dir = u16::from(self.cfg.dir_bit_field);

        if flow.exts.is_empty() {
            self.buf.clear();
            self.fill_prefix();
            fill_basic_flow(flow, dir, &mut self.buf);
            if !self.write_record(self.basic_channel) {
                self.stats.flows_dropped += 1;
            }
            return;
        }

        // One message per extension, each carrying the basic fields
        // followed by that plugin's fields.
        for i in 0..flow.exts.len() {
            self.buf.clear();
            self.fill_prefix();
            fill_basic_flow(flow, dir, &mut self.buf);
            let ext = &flow.exts[i];
            ext.fill_framed(&mut self.buf);
            let channel = self.ext_channel[ext.ext_type() as usize].unwrap_or(self.basic_channel);
            if !self.write_record(channel) {
                self.stats.flows_dropped += 1;
            }
        }
    }

    fn export_packet(&mut self, pkt: &PacketRecord) {
        self.stats.flows_seen += 1;
        for i in 0..pkt.exts.len() {
            self.buf.clear();
            self.fill_prefix();
            self.buf.extend_from_slice(&pkt.src_mac);
            self.buf.extend_from_slice(&pkt.dst_mac);
            self.buf.extend_from_slice(&pkt.ethertype.to_be_bytes());
            self.buf
                .extend_from_slice(&unix_millis(pkt.timestamp).to_be_bytes());
            let ext = &pkt.exts[i];
            ext.fill_framed(&mut self.buf);
            let channel = self.ext_channel[ext.ext_type() as usize].unwrap_or(self.basic_channel);
            if !self.write_record(channel) {
                self.stats.flows_dropped += 1;
            }
        }
    }

    fn flush(&mut self) {
        for sink in &mut self.channels {
            if let Err(e) = sink.flush() {
                warn!("framed output flush failed: {}", e);
            }
        }
    }

    fn shutdown(&mut self) {
        self.flush();
    }

    fn stats(&self) -> ExportStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{HttpExt, RecordExt};
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_flow() -> Flow {
        let mut flow = Flow::default();
        flow.ip_version = 4;
        flow.ip_proto = 6;
        flow.src_ip = IpAddr::from([10, 0, 0, 1]);
        flow.dst_ip = IpAddr::from([10, 0, 0, 2]);
        flow.src_port = 4000;
        flow.dst_port = 80;
        flow.src_packets = 2;
        flow.src_octets = 120;
        flow
    }

    #[test]
    fn basic_flow_goes_to_basic_channel() {
        let basic = SharedSink::default();
        let mut exp = FramedExporter::new(FramedConfig::default(), Box::new(basic.clone()));
        exp.export_flow(&sample_flow());

        let data = basic.0.lock().unwrap();
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        // link u64 + dir u8 + 78 basic bytes
        assert_eq!(len, 8 + 1 + 78);
        assert_eq!(data.len(), 2 + len);
    }

    #[test]
    fn extension_routes_to_plugin_channel() {
        let basic = SharedSink::default();
        let http = SharedSink::default();
        let mut exp = FramedExporter::new(FramedConfig::default(), Box::new(basic.clone()));
        exp.add_plugin_channel(ExtType::Http, Box::new(http.clone()));

        let mut flow = sample_flow();
        flow.add_extension(RecordExt::Http(HttpExt::default()));
        exp.export_flow(&flow);

        assert!(basic.0.lock().unwrap().is_empty());
        assert!(!http.0.lock().unwrap().is_empty());
    }

    #[test]
    fn odid_replaces_link_field() {
        let basic = SharedSink::default();
        let cfg = FramedConfig {
            odid: Some(7),
            ..FramedConfig::default()
        };
        let mut exp = FramedExporter::new(cfg, Box::new(basic.clone()));
        exp.export_flow(&sample_flow());

        let data = basic.0.lock().unwrap();
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        assert_eq!(len, 4 + 1 + 78);
        assert_eq!(&data[2..6], &7u32.to_be_bytes());
    }
}
