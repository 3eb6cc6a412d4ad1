//! SSDP (Simple Service Discovery Protocol) parser plugin.
//!
//! Collects service URNs, user agents, servers and the advertised
//! location port from NOTIFY and M-SEARCH messages sent to port 1900.
//! Repeated values accumulate into semicolon-separated lists, each value
//! stored once.

use serde::Serialize;

use crate::export::fields::{FieldDef, IPFIX_SSDP_TEMPLATE};
use crate::export::wire::{put_framed_str, put_varlen};
use crate::flow::Flow;
use crate::packet::Packet;
use crate::plugins::{ExtType, ProcessPlugin, RecordExt};

const SSDP_PORT: u16 = 1900;
const MAX_URN_LEN: usize = 511;
const MAX_SERVER_LEN: usize = 255;
const MAX_USER_AGENT_LEN: usize = 255;

/// SSDP extension record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SsdpExt {
    /// Port advertised by the Location header.
    pub port: u16,
    /// Notification types (URN suffixes), semicolon separated.
    pub nt: String,
    /// Search targets (URN suffixes), semicolon separated.
    pub st: String,
    pub user_agent: String,
    pub server: String,
}

impl SsdpExt {
    pub fn fill_ipfix(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.port.to_be_bytes());
        put_varlen(buf, self.nt.as_bytes());
        put_varlen(buf, self.user_agent.as_bytes());
        put_varlen(buf, self.st.as_bytes());
        put_varlen(buf, self.server.as_bytes());
    }

    pub fn fill_framed(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.port.to_be_bytes());
        put_framed_str(buf, self.nt.as_bytes());
        put_framed_str(buf, self.user_agent.as_bytes());
        put_framed_str(buf, self.st.as_bytes());
        put_framed_str(buf, self.server.as_bytes());
    }
}

#[derive(Debug, Default, Clone)]
pub struct SsdpPlugin {
    searches: u64,
    notifies: u64,
    total: u64,
}

impl ProcessPlugin for SsdpPlugin {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    fn ext_type(&self) -> ExtType {
        ExtType::Ssdp
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> u32 {
        if pkt.dst_port == SSDP_PORT {
            flow.add_extension(RecordExt::Ssdp(SsdpExt::default()));
            self.parse_message(flow, pkt);
        }
        0
    }

    fn pre_update(&mut self, flow: &mut Flow, pkt: &mut Packet) -> u32 {
        if pkt.dst_port == SSDP_PORT {
            self.parse_message(flow, pkt);
        }
        0
    }

    fn finish(&mut self) {
        tracing::info!(
            searches = self.searches,
            notifies = self.notifies,
            total = self.total,
            "ssdp plugin stats"
        );
    }

    fn ipfix_fields(&self) -> &'static [FieldDef] {
        IPFIX_SSDP_TEMPLATE
    }

    fn framed_fields(&self) -> &'static str {
        "SSDP_LOCATION_PORT,SSDP_NT,SSDP_USER_AGENT,SSDP_ST,SSDP_SERVER"
    }

    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(self.clone())
    }
}

enum MessageKind {
    Notify,
    Search,
}

impl SsdpPlugin {
    fn parse_message(&mut self, flow: &mut Flow, pkt: &Packet) {
        let payload = pkt.payload();
        let kind = if payload.starts_with(b"NOTIFY") {
            self.notifies += 1;
            MessageKind::Notify
        } else if payload.starts_with(b"M-SEARCH") {
            self.searches += 1;
            MessageKind::Search
        } else {
            return;
        };
        self.total += 1;

        let ip_version = pkt.ip_version;
        let Some(RecordExt::Ssdp(ext)) = flow.extension_mut(ExtType::Ssdp) else {
            return;
        };

        for line in payload.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let Some((key, value)) = split_header(line) else {
                continue;
            };
            match kind {
                MessageKind::Notify => {
                    if key.eq_ignore_ascii_case("nt") {
                        if let Some(urn) = strip_urn(value) {
                            append_value(&mut ext.nt, MAX_URN_LEN, urn);
                        }
                    } else if key.eq_ignore_ascii_case("location") {
                        let port = parse_loc_port(value, ip_version);
                        if port > 0 {
                            ext.port = port;
                        }
                    } else if key.eq_ignore_ascii_case("server") {
                        append_value(&mut ext.server, MAX_SERVER_LEN, value);
                    }
                }
                MessageKind::Search => {
                    if key.eq_ignore_ascii_case("st") {
                        if let Some(urn) = strip_urn(value) {
                            append_value(&mut ext.st, MAX_URN_LEN, urn);
                        }
                    } else if key.eq_ignore_ascii_case("user-agent") {
                        append_value(&mut ext.user_agent, MAX_USER_AGENT_LEN, value);
                    }
                }
            }
        }
    }
}

fn split_header(line: &[u8]) -> Option<(&str, &str)> {
    let text = std::str::from_utf8(line).ok()?;
    let (key, value) = text.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Only URN-qualified targets are stored; the `urn:` prefix is dropped.
fn strip_urn(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("urn")?.strip_prefix(':')?;
    Some(rest.trim_start())
}

/// Appends `value` to a semicolon-separated list unless already present
/// or the entry would exceed `max` bytes.
fn append_value(entry: &mut String, max: usize, value: &str) {
    if value.is_empty() || entry.split(';').any(|v| v == value) {
        return;
    }
    let extra = value.len() + if entry.is_empty() { 0 } else { 1 };
    if entry.len() + extra > max {
        return;
    }
    if !entry.is_empty() {
        entry.push(';');
    }
    entry.push_str(value);
}

/// Extracts the port from a Location URL such as
/// `http://192.168.1.1:5000/desc.xml` or `http://[fe80::1]:8080/`.
fn parse_loc_port(value: &str, ip_version: u8) -> u16 {
    let rest = value.split_once("://").map_or(value, |(_, r)| r);
    let after_host = if ip_version == 6 {
        match rest.split_once(']') {
            Some((_, r)) => r,
            None => rest,
        }
    } else {
        rest
    };
    let Some((_, port_part)) = after_host.split_once(':') else {
        return 0;
    };
    let digits: &str = port_part
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &[u8] = b"NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        NT: urn:schemas-upnp-org:device:Basic:1\r\n\
        LOCATION: http://192.168.1.5:49152/desc.xml\r\n\
        SERVER: Linux/5.4 UPnP/1.0 Demo/1.0\r\n\
        \r\n";

    const SEARCH: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        ST: urn:schemas-upnp-org:service:AVTransport:1\r\n\
        USER-AGENT: probe/1.0\r\n\
        \r\n";

    fn run(payload: &[u8]) -> (SsdpPlugin, Flow) {
        let mut plugin = SsdpPlugin::default();
        let mut flow = Flow::default();
        let mut pkt = Packet::default();
        pkt.ip_version = 4;
        pkt.dst_port = SSDP_PORT;
        pkt.frame = payload.to_vec();
        plugin.post_create(&mut flow, &pkt);
        (plugin, flow)
    }

    #[test]
    fn notify_extracts_nt_location_server() {
        let (_, flow) = run(NOTIFY);
        let Some(RecordExt::Ssdp(ext)) = flow.extension(ExtType::Ssdp) else {
            panic!("ssdp extension missing");
        };
        assert_eq!(ext.nt, "schemas-upnp-org:device:Basic:1");
        assert_eq!(ext.port, 49152);
        assert_eq!(ext.server, "Linux/5.4 UPnP/1.0 Demo/1.0");
    }

    #[test]
    fn search_extracts_st_and_agent() {
        let (plugin, flow) = run(SEARCH);
        let Some(RecordExt::Ssdp(ext)) = flow.extension(ExtType::Ssdp) else {
            panic!("ssdp extension missing");
        };
        assert_eq!(ext.st, "schemas-upnp-org:service:AVTransport:1");
        assert_eq!(ext.user_agent, "probe/1.0");
        assert_eq!(plugin.searches, 1);
    }

    #[test]
    fn values_accumulate_once() {
        let mut entry = String::new();
        append_value(&mut entry, 64, "a");
        append_value(&mut entry, 64, "b");
        append_value(&mut entry, 64, "a");
        assert_eq!(entry, "a;b");
    }

    #[test]
    fn ipv6_location_port() {
        assert_eq!(parse_loc_port("http://[fe80::1]:8080/x", 6), 8080);
        assert_eq!(parse_loc_port("http://10.0.0.1:49152/x", 4), 49152);
        assert_eq!(parse_loc_port("http://10.0.0.1/x", 4), 0);
    }
}
