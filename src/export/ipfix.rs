//! IPFIX (RFC 7011) exporter.
//!
//! For every observed combination of template base (IPv4 flow, IPv6 flow,
//! standalone packet) and extension bitmask, one template is synthesized
//! lazily and given the next sequential ID starting at 258. Each template
//! owns a staging buffer into which data records are packed; `flush`
//! assembles the staged sets into messages bounded by the MTU and sends
//! them, templates first.
//!
//! Over UDP, templates are periodically retransmitted; the refresh timers
//! restart only when a template is actually sent. Over TCP, a send error
//! classified as connection loss closes the socket, resets the sequence
//! number and marks every template unexported; reconnection is attempted
//! no sooner than the reconnect timeout, and templates precede any data
//! on the new connection.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};

use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::export::fields::{self, FieldDef, VAR_LEN};
use crate::export::{ExportStats, FlowExporter};
use crate::flow::Flow;
use crate::packet::PacketRecord;
use crate::plugins::ExtType;
use crate::time::{now_unix_secs, unix_millis};

pub const IPFIX_VERSION: u16 = 10;
pub const IPFIX_HEADER_SIZE: usize = 16;
pub const IPFIX_SET_HEADER_SIZE: usize = 4;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const FIRST_TEMPLATE_ID: u16 = 258;

pub const DEFAULT_MTU: usize = 1458;
pub const DEFAULT_RECONNECT_TIMEOUT: u64 = 60;
pub const DEFAULT_TEMPLATE_REFRESH_TIME: u64 = 600;
pub const DEFAULT_TEMPLATE_REFRESH_PACKETS: u64 = 0;

#[derive(Debug, Clone)]
pub struct IpfixConfig {
    pub host: String,
    pub port: u16,
    pub udp: bool,
    pub mtu: usize,
    /// Observation domain ID carried in every message header.
    pub odid: u32,
    /// Value of the inputInterface element in basic flow records.
    pub dir_bit_field: u16,
    /// Seconds to wait between TCP reconnection attempts.
    pub reconnect_timeout: u64,
    /// UDP template refresh interval in seconds, 0 disables.
    pub template_refresh_time: u64,
    /// UDP template refresh interval in sent messages, 0 disables.
    pub template_refresh_packets: u64,
}

impl Default for IpfixConfig {
    fn default() -> Self {
        IpfixConfig {
            host: String::new(),
            port: 4739,
            udp: false,
            mtu: DEFAULT_MTU,
            odid: 0,
            dir_bit_field: 0,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            template_refresh_time: DEFAULT_TEMPLATE_REFRESH_TIME,
            template_refresh_packets: DEFAULT_TEMPLATE_REFRESH_PACKETS,
        }
    }
}

/// The base field list a template starts from; extension fields follow in
/// registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TemplateBase {
    V4,
    V6,
    Packet,
}

impl TemplateBase {
    fn fields(self) -> &'static [FieldDef] {
        match self {
            TemplateBase::V4 => fields::BASIC_TMPLT_V4,
            TemplateBase::V6 => fields::BASIC_TMPLT_V6,
            TemplateBase::Packet => fields::PACKET_TMPLT,
        }
    }
}

struct Template {
    id: u16,
    /// Encoded template record as it appears inside a template set.
    record: Vec<u8>,
    field_count: u16,
    /// Staged data set: 4-byte set header followed by data records.
    buffer: Vec<u8>,
    record_count: u16,
    exported: bool,
    last_export_time: u64,
    last_export_packet: u64,
}

enum SendOutcome {
    Sent,
    /// Connection was re-established; the caller should resend.
    Resend,
    Dropped,
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

pub struct IpfixExporter {
    cfg: IpfixConfig,
    templates: Vec<Template>,
    tmplt_map: HashMap<(TemplateBase, u64), usize>,
    sequence_num: u32,
    exported_messages: u64,
    transport: Option<Transport>,
    /// 0 while connected; otherwise the time of the last connect attempt
    /// (1 forces an immediate retry).
    last_reconnect: u64,
    msg_buf: Vec<u8>,
    stats: ExportStats,
}

impl IpfixExporter {
    pub fn new(cfg: IpfixConfig) -> Result<IpfixExporter, ProbeError> {
        if cfg.mtu <= IPFIX_HEADER_SIZE + IPFIX_SET_HEADER_SIZE {
            return Err(ProbeError::Config(format!(
                "IPFIX message MTU must exceed {} bytes",
                IPFIX_HEADER_SIZE + IPFIX_SET_HEADER_SIZE
            )));
        }

        let mut exporter = IpfixExporter {
            cfg,
            templates: Vec::new(),
            tmplt_map: HashMap::new(),
            sequence_num: 0,
            exported_messages: 0,
            transport: None,
            last_reconnect: 0,
            msg_buf: Vec::new(),
            stats: ExportStats::default(),
        };

        match exporter.connect_to_collector() {
            Ok(t) => exporter.transport = Some(t),
            Err(ProbeError::Io(e)) => {
                warn!("collector not reachable yet: {}", e);
                exporter.last_reconnect = now_unix_secs();
            }
            Err(e) => return Err(e),
        }
        Ok(exporter)
    }

    fn max_buffer_size(&self) -> usize {
        self.cfg.mtu - IPFIX_HEADER_SIZE
    }

    /// Resolves the collector address and opens a socket. Resolution
    /// failures are configuration errors; connection failures are I/O
    /// errors the caller may retry.
    fn connect_to_collector(&mut self) -> Result<Transport, ProbeError> {
        let addrs: Vec<SocketAddr> = (self.cfg.host.as_str(), self.cfg.port)
            .to_socket_addrs()
            .map_err(|e| {
                ProbeError::Config(format!(
                    "cannot resolve collector {}:{}: {}",
                    self.cfg.host, self.cfg.port, e
                ))
            })?
            .collect();

        let mut last_err =
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address");
        for addr in addrs {
            if self.cfg.udp {
                let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                match UdpSocket::bind(local).and_then(|s| s.connect(addr).map(|_| s)) {
                    Ok(sock) => {
                        debug!(%addr, "UDP export socket ready");
                        return Ok(Transport::Udp(sock));
                    }
                    Err(e) => last_err = e,
                }
            } else {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        debug!(%addr, "connected to collector");
                        return Ok(Transport::Tcp(stream));
                    }
                    Err(e) => last_err = e,
                }
            }
        }
        Err(ProbeError::Io(last_err))
    }

    /// Checks that the connection is usable, reconnecting if the retry
    /// timeout has elapsed. Returns false when the message should be
    /// dropped instead of sent. A successful reconnect retransmits all
    /// templates before any data.
    fn reconnect(&mut self) -> bool {
        if self.last_reconnect == 0 {
            return true;
        }
        let now = now_unix_secs();
        if self.last_reconnect + self.cfg.reconnect_timeout > now {
            return false;
        }
        match self.connect_to_collector() {
            Ok(t) => {
                self.transport = Some(t);
                self.last_reconnect = 0;
                self.expire_templates();
                self.send_templates();
                true
            }
            Err(_) => {
                self.last_reconnect = now;
                false
            }
        }
    }

    /// Marks every template unexported so the next template message
    /// carries all of them.
    fn expire_templates(&mut self) {
        let now = now_unix_secs();
        let messages = self.exported_messages;
        let udp = self.cfg.udp;
        for t in &mut self.templates {
            t.exported = false;
            if udp {
                t.last_export_time = now;
                t.last_export_packet = messages;
            }
        }
    }

    fn template_index(&mut self, base: TemplateBase, mask: u64) -> usize {
        if let Some(&idx) = self.tmplt_map.get(&(base, mask)) {
            return idx;
        }
        match base {
            // Both address-family variants are created together so the
            // collector learns them from one template message.
            TemplateBase::V4 | TemplateBase::V6 => {
                let v4 = self.create_template(TemplateBase::V4, mask);
                self.tmplt_map.insert((TemplateBase::V4, mask), v4);
                let v6 = self.create_template(TemplateBase::V6, mask);
                self.tmplt_map.insert((TemplateBase::V6, mask), v6);
                if base == TemplateBase::V4 { v4 } else { v6 }
            }
            TemplateBase::Packet => {
                let idx = self.create_template(TemplateBase::Packet, mask);
                self.tmplt_map.insert((TemplateBase::Packet, mask), idx);
                idx
            }
        }
    }

    fn create_template(&mut self, base: TemplateBase, mask: u64) -> usize {
        let id = FIRST_TEMPLATE_ID + self.templates.len() as u16;

        let mut field_count = 0u16;
        let mut record = Vec::with_capacity(128);
        record.extend_from_slice(&id.to_be_bytes());
        record.extend_from_slice(&[0, 0]); // field count patched below

        let push_field = |record: &mut Vec<u8>, f: &FieldDef| {
            let mut element_id = f.id;
            if f.en != 0 {
                element_id |= 0x8000;
            }
            record.extend_from_slice(&element_id.to_be_bytes());
            let wire_len: u16 = if f.len == VAR_LEN { 0xffff } else { f.len as u16 };
            record.extend_from_slice(&wire_len.to_be_bytes());
            if f.en != 0 {
                record.extend_from_slice(&f.en.to_be_bytes());
            }
        };

        for f in base.fields() {
            push_field(&mut record, f);
            field_count += 1;
        }
        for tag in ExtType::ALL {
            if mask & tag.bit() != 0 {
                for f in fields::ext_template(tag) {
                    push_field(&mut record, f);
                    field_count += 1;
                }
            }
        }
        record[2..4].copy_from_slice(&field_count.to_be_bytes());

        debug!(id, ?base, mask, field_count, "created template");

        let mut buffer = Vec::with_capacity(self.max_buffer_size());
        buffer.extend_from_slice(&id.to_be_bytes());
        buffer.extend_from_slice(&[0, 0]); // set length patched on assembly

        self.templates.push(Template {
            id,
            record,
            field_count,
            buffer,
            record_count: 0,
            exported: false,
            last_export_time: now_unix_secs(),
            last_export_packet: self.exported_messages,
        });
        self.templates.len() - 1
    }

    /// Appends one flow record to its template's staging buffer. Returns
    /// false (leaving the buffer untouched) when the record does not fit.
    fn fill_flow(&mut self, flow: &Flow, tidx: usize) -> bool {
        let max = self.max_buffer_size();
        let dir = self.cfg.dir_bit_field;
        let tmpl = &mut self.templates[tidx];
        let start = tmpl.buffer.len();

        fill_basic_flow(flow, dir, &mut tmpl.buffer);
        for tag in ExtType::ALL {
            if let Some(ext) = flow.exts.iter().rev().find(|e| e.ext_type() == tag) {
                ext.fill_ipfix(&mut tmpl.buffer);
            }
        }

        if tmpl.buffer.len() > max {
            tmpl.buffer.truncate(start);
            return false;
        }
        tmpl.record_count += 1;
        true
    }

    fn fill_packet(&mut self, pkt: &PacketRecord, tidx: usize) -> bool {
        let max = self.max_buffer_size();
        let tmpl = &mut self.templates[tidx];
        let start = tmpl.buffer.len();

        let buf = &mut tmpl.buffer;
        buf.extend_from_slice(&pkt.src_mac);
        buf.extend_from_slice(&pkt.dst_mac);
        buf.extend_from_slice(&pkt.ethertype.to_be_bytes());
        buf.extend_from_slice(&unix_millis(pkt.timestamp).to_be_bytes());
        for tag in ExtType::ALL {
            if let Some(ext) = pkt.exts.iter().rev().find(|e| e.ext_type() == tag) {
                ext.fill_ipfix(&mut tmpl.buffer);
            }
        }

        if tmpl.buffer.len() > max {
            tmpl.buffer.truncate(start);
            return false;
        }
        tmpl.record_count += 1;
        true
    }

    /// Builds a template-only message carrying every unexported template,
    /// marking them exported. Over UDP, templates whose refresh interval
    /// elapsed are expired first so they are included again.
    fn create_template_message(&mut self) -> Option<Vec<u8>> {
        let now = now_unix_secs();
        let udp = self.cfg.udp;
        let refresh_time = self.cfg.template_refresh_time;
        let refresh_packets = self.cfg.template_refresh_packets;
        let messages = self.exported_messages;

        let mut total = 0usize;
        for t in &mut self.templates {
            if udp {
                if refresh_time != 0 && t.last_export_time + refresh_time <= now {
                    debug!(id = t.id, "template refresh time expired");
                    t.exported = false;
                }
                if refresh_packets != 0 && t.last_export_packet + refresh_packets <= messages {
                    debug!(id = t.id, "template refresh packet count expired");
                    t.exported = false;
                }
            }
            if !t.exported {
                total += t.record.len();
            }
        }
        if total == 0 {
            return None;
        }

        let total = total + IPFIX_HEADER_SIZE + IPFIX_SET_HEADER_SIZE;
        let mut buf = vec![0u8; IPFIX_HEADER_SIZE];
        write_ipfix_header(
            &mut buf,
            total as u16,
            now as u32,
            self.sequence_num,
            self.cfg.odid,
        );
        buf.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        buf.extend_from_slice(&((total - IPFIX_HEADER_SIZE) as u16).to_be_bytes());

        for t in &mut self.templates {
            if !t.exported {
                buf.extend_from_slice(&t.record);
                t.exported = true;
                t.last_export_time = now;
                t.last_export_packet = messages;
            }
        }
        Some(buf)
    }

    /// Assembles the next data message from the staged template buffers
    /// into `msg_buf`. Buffers that fit are drained; the rest stay for the
    /// next round. Returns the message length and its record count, or
    /// (0, 0) when nothing is staged.
    fn create_data_message(&mut self) -> (usize, u32) {
        let mtu = self.cfg.mtu;
        self.msg_buf.clear();
        self.msg_buf.resize(IPFIX_HEADER_SIZE, 0);

        let mut flows = 0u32;
        for t in &mut self.templates {
            if t.record_count > 0 && self.msg_buf.len() + t.buffer.len() <= mtu {
                let set_len = t.buffer.len() as u16;
                t.buffer[2..4].copy_from_slice(&set_len.to_be_bytes());
                self.msg_buf.extend_from_slice(&t.buffer);
                flows += u32::from(t.record_count);
                t.buffer.truncate(IPFIX_SET_HEADER_SIZE);
                t.record_count = 0;
            }
        }
        if self.msg_buf.len() == IPFIX_HEADER_SIZE {
            return (0, 0);
        }

        let len = self.msg_buf.len();
        write_ipfix_header(
            &mut self.msg_buf,
            len as u16,
            now_unix_secs() as u32,
            self.sequence_num,
            self.cfg.odid,
        );
        (len, flows)
    }

    fn send_templates(&mut self) {
        if let Some(msg) = self.create_template_message() {
            // Templates are resent after reconnection anyway, so a failed
            // send is not retried here.
            self.send_message(&msg, 0);
        }
    }

    fn send_data(&mut self) {
        loop {
            let (len, flows) = self.create_data_message();
            if len == 0 {
                return;
            }
            let msg = std::mem::take(&mut self.msg_buf);
            if let SendOutcome::Resend = self.send_message(&msg[..len], flows) {
                let mut msg = msg;
                // Sequence numbers restart per connection.
                msg[12..16].copy_from_slice(&0u32.to_be_bytes());
                self.send_message(&msg[..len], flows);
                self.msg_buf = msg;
            } else {
                self.msg_buf = msg;
            }
        }
    }

    /// Sends one assembled message, counting `flows` data records into
    /// the sequence number on success.
    fn send_message(&mut self, msg: &[u8], flows: u32) -> SendOutcome {
        if !self.reconnect() {
            self.stats.flows_dropped += u64::from(flows);
            return SendOutcome::Dropped;
        }

        let result = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => stream.write_all(msg),
            Some(Transport::Udp(sock)) => sock.send(msg).map(|_| ()),
            None => {
                self.stats.flows_dropped += u64::from(flows);
                return SendOutcome::Dropped;
            }
        };

        match result {
            Ok(()) => {
                self.sequence_num = self.sequence_num.wrapping_add(flows);
                self.exported_messages += 1;
                SendOutcome::Sent
            }
            Err(e) if connection_lost(&e) => {
                warn!("collector closed connection: {}", e);
                self.transport = None;
                // Retry immediately on the next send attempt.
                self.last_reconnect = 1;
                self.sequence_num = 0;
                self.expire_templates();
                SendOutcome::Resend
            }
            Err(e) => {
                warn!("cannot send to collector: {}", e);
                self.stats.flows_dropped += u64::from(flows);
                SendOutcome::Dropped
            }
        }
    }
}

impl FlowExporter for IpfixExporter {
    fn export_flow(&mut self, flow: &Flow) {
        self.stats.flows_seen += 1;
        let base = if flow.ip_version == 6 {
            TemplateBase::V6
        } else {
            TemplateBase::V4
        };
        let tidx = self.template_index(base, flow.ext_bitmask());
        if !self.fill_flow(flow, tidx) {
            self.flush();
            if !self.fill_flow(flow, tidx) {
                self.stats.flows_dropped += 1;
            }
        }
    }

    fn export_packet(&mut self, pkt: &PacketRecord) {
        self.stats.flows_seen += 1;
        let mask = pkt.exts.iter().fold(0u64, |m, e| m | e.ext_type().bit());
        let tidx = self.template_index(TemplateBase::Packet, mask);
        if !self.fill_packet(pkt, tidx) {
            self.flush();
            if !self.fill_packet(pkt, tidx) {
                self.stats.flows_dropped += 1;
            }
        }
    }

    fn flush(&mut self) {
        self.send_templates();
        self.send_data();
    }

    fn shutdown(&mut self) {
        if self.transport.is_some() {
            self.flush();
        }
        self.transport = None;
    }

    fn stats(&self) -> ExportStats {
        self.stats
    }
}

fn write_ipfix_header(buf: &mut [u8], length: u16, export_time: u32, seq: u32, odid: u32) {
    buf[0..2].copy_from_slice(&IPFIX_VERSION.to_be_bytes());
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    buf[4..8].copy_from_slice(&export_time.to_be_bytes());
    buf[8..12].copy_from_slice(&seq.to_be_bytes());
    buf[12..16].copy_from_slice(&odid.to_be_bytes());
}

/// Appends the basic biflow fields in template order. Addresses pass
/// through byte for byte; everything else is network byte order.
pub(crate) fn fill_basic_flow(flow: &Flow, dir_bit_field: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&flow.src_octets.to_be_bytes());
    buf.extend_from_slice(&flow.dst_octets.to_be_bytes());
    buf.extend_from_slice(&u64::from(flow.src_packets).to_be_bytes());
    buf.extend_from_slice(&u64::from(flow.dst_packets).to_be_bytes());
    buf.extend_from_slice(&unix_millis(flow.time_first).to_be_bytes());
    buf.extend_from_slice(&unix_millis(flow.time_last).to_be_bytes());
    buf.push(flow.ip_version);
    buf.push(flow.ip_proto);
    buf.push(flow.src_tcp_flags);
    buf.push(flow.dst_tcp_flags);
    buf.extend_from_slice(&flow.src_port.to_be_bytes());
    buf.extend_from_slice(&flow.dst_port.to_be_bytes());
    buf.extend_from_slice(&dir_bit_field.to_be_bytes());
    match (&flow.src_ip, &flow.dst_ip) {
        (std::net::IpAddr::V4(s), std::net::IpAddr::V4(d)) => {
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
        }
        (std::net::IpAddr::V6(s), std::net::IpAddr::V6(d)) => {
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
        }
        _ => {
            buf.extend_from_slice(&[0; 4]);
            buf.extend_from_slice(&[0; 4]);
        }
    }
    buf.extend_from_slice(&flow.src_mac);
    buf.extend_from_slice(&flow.dst_mac);
}

fn connection_lost(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(
            libc::ECONNRESET
                | libc::EINTR
                | libc::ENOTCONN
                | libc::ENOTSOCK
                | libc::EPIPE
                | libc::EHOSTUNREACH
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::ENOBUFS
                | libc::ENOMEM
        )
    ) || matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{HttpExt, RecordExt};
    use std::net::IpAddr;

    fn test_exporter(mtu: usize) -> IpfixExporter {
        // Points at an unresolvable-free address but never connects;
        // these tests only exercise message assembly.
        let cfg = IpfixConfig {
            host: "127.0.0.1".into(),
            port: 0,
            udp: true,
            mtu,
            dir_bit_field: 1,
            ..IpfixConfig::default()
        };
        IpfixExporter {
            cfg,
            templates: Vec::new(),
            tmplt_map: HashMap::new(),
            sequence_num: 0,
            exported_messages: 0,
            transport: None,
            last_reconnect: now_unix_secs(),
            msg_buf: Vec::new(),
            stats: ExportStats::default(),
        }
    }

    fn v4_flow() -> Flow {
        let mut flow = Flow::default();
        flow.ip_version = 4;
        flow.ip_proto = 17;
        flow.src_ip = IpAddr::from([10, 0, 0, 1]);
        flow.dst_ip = IpAddr::from([10, 0, 0, 2]);
        flow.src_port = 1000;
        flow.dst_port = 53;
        flow.src_packets = 1;
        flow.src_octets = 88;
        flow
    }

    #[test]
    fn first_template_id_is_258() {
        let mut exp = test_exporter(DEFAULT_MTU);
        let idx = exp.template_index(TemplateBase::V4, 0);
        assert_eq!(exp.templates[idx].id, FIRST_TEMPLATE_ID);
        // The IPv6 twin is created eagerly with the next ID.
        assert_eq!(exp.templates.len(), 2);
        assert_eq!(exp.templates[1].id, FIRST_TEMPLATE_ID + 1);
    }

    #[test]
    fn template_record_encoding() {
        let mut exp = test_exporter(DEFAULT_MTU);
        let idx = exp.template_index(TemplateBase::V4, 0);
        let t = &exp.templates[idx];

        assert_eq!(t.field_count, 17);
        assert_eq!(&t.record[0..2], &FIRST_TEMPLATE_ID.to_be_bytes());
        assert_eq!(&t.record[2..4], &17u16.to_be_bytes());
        // First field: octetDeltaCount, IANA, length 8.
        assert_eq!(&t.record[4..6], &1u16.to_be_bytes());
        assert_eq!(&t.record[6..8], &8u16.to_be_bytes());
        // Second field: reverse octetDeltaCount with the enterprise bit
        // and enterprise number 29305.
        assert_eq!(&t.record[8..10], &(1u16 | 0x8000).to_be_bytes());
        assert_eq!(&t.record[10..12], &8u16.to_be_bytes());
        assert_eq!(&t.record[12..16], &29305u32.to_be_bytes());
    }

    #[test]
    fn varlen_fields_use_ffff_in_template() {
        let mut exp = test_exporter(DEFAULT_MTU);
        let idx = exp.template_index(TemplateBase::V4, ExtType::Http.bit());
        let t = &exp.templates[idx];
        assert_eq!(t.field_count, 17 + 7);
        assert!(
            t.record
                .windows(2)
                .any(|w| w == 0xffffu16.to_be_bytes())
        );
    }

    #[test]
    fn basic_record_length_v4() {
        let mut buf = Vec::new();
        fill_basic_flow(&v4_flow(), 1, &mut buf);
        // 8+8+8+8+8+8+1+1+1+1+2+2+2+4+4+6+6
        assert_eq!(buf.len(), 78);
    }

    #[test]
    fn data_message_assembly_and_sequence() {
        let mut exp = test_exporter(DEFAULT_MTU);
        let flow = v4_flow();
        let tidx = exp.template_index(TemplateBase::V4, 0);
        assert!(exp.fill_flow(&flow, tidx));
        assert!(exp.fill_flow(&flow, tidx));

        let (len, flows) = exp.create_data_message();
        assert_eq!(flows, 2);
        assert!(len <= DEFAULT_MTU);
        // Header: version 10, length, then a data set with ID 258.
        assert_eq!(&exp.msg_buf[0..2], &10u16.to_be_bytes());
        assert_eq!(&exp.msg_buf[2..4], &(len as u16).to_be_bytes());
        assert_eq!(&exp.msg_buf[16..18], &258u16.to_be_bytes());
        let set_len = u16::from_be_bytes([exp.msg_buf[18], exp.msg_buf[19]]);
        assert_eq!(set_len as usize, IPFIX_SET_HEADER_SIZE + 2 * 78);

        // Buffers were drained.
        let (len2, flows2) = exp.create_data_message();
        assert_eq!((len2, flows2), (0, 0));
    }

    #[test]
    fn template_message_marks_exported() {
        let mut exp = test_exporter(DEFAULT_MTU);
        exp.template_index(TemplateBase::V4, 0);
        let msg = exp.create_template_message().unwrap();
        assert_eq!(&msg[16..18], &TEMPLATE_SET_ID.to_be_bytes());
        assert!(exp.templates.iter().all(|t| t.exported));
        assert!(exp.create_template_message().is_none());
    }

    #[test]
    fn overflowing_record_is_rejected() {
        let mut exp = test_exporter(120);
        let flow = v4_flow();
        let tidx = exp.template_index(TemplateBase::V4, 0);
        // 104-byte cap fits one 78-byte record plus the set header only.
        assert!(exp.fill_flow(&flow, tidx));
        assert!(!exp.fill_flow(&flow, tidx));
        assert_eq!(exp.templates[tidx].record_count, 1);
    }

    #[test]
    fn http_extension_appends_after_basic_fields() {
        let mut exp = test_exporter(DEFAULT_MTU);
        let mut flow = v4_flow();
        flow.add_extension(RecordExt::Http(HttpExt {
            method: "GET".into(),
            ..HttpExt::default()
        }));
        let tidx = exp.template_index(TemplateBase::V4, flow.ext_bitmask());
        assert!(exp.fill_flow(&flow, tidx));
        let buf = &exp.templates[tidx].buffer;
        // Set header + basic fields, then the user agent (empty) and the
        // method as variable-length fields.
        assert_eq!(buf[IPFIX_SET_HEADER_SIZE + 78], 0);
        assert_eq!(buf[IPFIX_SET_HEADER_SIZE + 78 + 1], 3);
        assert_eq!(&buf[IPFIX_SET_HEADER_SIZE + 80..IPFIX_SET_HEADER_SIZE + 83], b"GET");
    }
}
