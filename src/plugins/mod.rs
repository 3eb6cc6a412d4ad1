//! Process plugin contract and registry.
//!
//! A plugin parses application payloads and attaches typed extension
//! records to flows. The cache invokes plugins in registration order at
//! each lifecycle hook; returned flags OR together and the cache acts on
//! the union. Parse failures never propagate: a plugin that cannot make
//! sense of a payload attaches nothing and returns no flags.

mod arp;
mod http;
mod ntp;
mod ssdp;

pub use arp::{ArpExt, ArpPlugin};
pub use http::{HttpExt, HttpPlugin};
pub use ntp::{NtpExt, NtpPlugin};
pub use ssdp::{SsdpExt, SsdpPlugin};

use serde::Serialize;

use crate::error::ProbeError;
use crate::export::fields::FieldDef;
use crate::flow::Flow;
use crate::packet::{MAX_PKT_SIZE, Packet};

/// Flush (immediately export) the current flow and empty its slot.
/// Valid from `post_create`, `pre_update` and `post_update`.
pub const FLOW_FLUSH: u32 = 0x1;

/// Flush the current flow, then re-create it from the triggering packet.
/// Valid from `pre_update` and `post_update`; subsumes [`FLOW_FLUSH`].
pub const FLOW_FLUSH_WITH_REINSERT: u32 = 0x3;

/// Export the current packet as a standalone record and do not create a
/// flow for it. Only meaningful from `pre_create`.
pub const EXPORT_PACKET: u32 = 0x4;

/// Closed enumeration of extension tags. The discriminant doubles as the
/// bit position in the exporter's template bitmask, so at most 64 tags
/// can exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ExtType {
    Http = 0,
    Ntp = 1,
    Ssdp = 2,
    Arp = 3,
}

pub const EXTENSION_CNT: usize = 4;

impl ExtType {
    /// Registry order; also the order extension fields appear in
    /// synthesized templates.
    pub const ALL: [ExtType; EXTENSION_CNT] = [ExtType::Http, ExtType::Ntp, ExtType::Ssdp, ExtType::Arp];

    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

/// Extension record attached to a flow (or to a standalone packet).
/// One variant per plugin; the exporter dispatches on the tag.
#[derive(Debug, Clone, Serialize)]
pub enum RecordExt {
    Http(HttpExt),
    Ntp(NtpExt),
    Ssdp(SsdpExt),
    Arp(ArpExt),
}

impl RecordExt {
    pub fn ext_type(&self) -> ExtType {
        match self {
            RecordExt::Http(_) => ExtType::Http,
            RecordExt::Ntp(_) => ExtType::Ntp,
            RecordExt::Ssdp(_) => ExtType::Ssdp,
            RecordExt::Arp(_) => ExtType::Arp,
        }
    }

    /// Appends this extension's fields to an IPFIX data record, in the
    /// field order of the matching template.
    pub fn fill_ipfix(&self, buf: &mut Vec<u8>) {
        match self {
            RecordExt::Http(e) => e.fill_ipfix(buf),
            RecordExt::Ntp(e) => e.fill_ipfix(buf),
            RecordExt::Ssdp(e) => e.fill_ipfix(buf),
            RecordExt::Arp(e) => e.fill_ipfix(buf),
        }
    }

    /// Appends this extension's fields to a framed record. Variable-length
    /// fields carry a single length byte.
    pub fn fill_framed(&self, buf: &mut Vec<u8>) {
        match self {
            RecordExt::Http(e) => e.fill_framed(buf),
            RecordExt::Ntp(e) => e.fill_framed(buf),
            RecordExt::Ssdp(e) => e.fill_framed(buf),
            RecordExt::Arp(e) => e.fill_framed(buf),
        }
    }
}

/// Lifecycle contract between the flow cache and a protocol parser.
///
/// All hooks are optional; the default implementations do nothing and
/// return no flags. Hook return values are OR-ed across the chain.
pub trait ProcessPlugin: Send {
    fn name(&self) -> &'static str;

    /// The extension tag this plugin owns.
    fn ext_type(&self) -> ExtType;

    /// Called once before processing starts, with the user-supplied
    /// `key=value:key=value` parameter string.
    fn init(&mut self, _params: &str) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Called before a flow would be created for `pkt`.
    fn pre_create(&mut self, _pkt: &mut Packet) -> u32 {
        0
    }

    /// Called after a new flow record is created.
    fn post_create(&mut self, _flow: &mut Flow, _pkt: &Packet) -> u32 {
        0
    }

    /// Called before an existing record is updated.
    fn pre_update(&mut self, _flow: &mut Flow, _pkt: &mut Packet) -> u32 {
        0
    }

    /// Called after an existing record is updated.
    fn post_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> u32 {
        0
    }

    /// Called before a flow record leaves the cache.
    fn pre_export(&mut self, _flow: &mut Flow) {}

    /// Called when everything is processed.
    fn finish(&mut self) {}

    /// IPFIX fields this plugin contributes to templates.
    fn ipfix_fields(&self) -> &'static [FieldDef];

    /// Field template string for the framed-record output.
    fn framed_fields(&self) -> &'static str {
        ""
    }

    /// True when the plugin needs the full payload of every packet, even
    /// for endpoints outside its usual port set.
    fn needs_every_packet(&self) -> bool {
        false
    }

    /// Longest payload prefix the plugin inspects.
    fn max_payload_len(&self) -> u16 {
        MAX_PKT_SIZE as u16
    }

    /// Per-worker copy. Each storage worker runs its own instances; no
    /// state is shared between workers.
    fn clone_plugin(&self) -> Box<dyn ProcessPlugin>;
}

/// Names accepted by `-p`.
pub const SUPPORTED_PLUGINS: &[&str] = &["http", "ntp", "ssdp", "arp"];

fn create_plugin(name: &str) -> Option<Box<dyn ProcessPlugin>> {
    match name {
        "http" => Some(Box::new(HttpPlugin::default())),
        "ntp" => Some(Box::new(NtpPlugin::default())),
        "ssdp" => Some(Box::new(SsdpPlugin::default())),
        "arp" => Some(Box::new(ArpPlugin::default())),
        _ => None,
    }
}

/// Ordered plugin chain owned by one storage worker.
pub struct PluginChain {
    plugins: Vec<Box<dyn ProcessPlugin>>,
}

impl Default for PluginChain {
    fn default() -> Self {
        PluginChain { plugins: Vec::new() }
    }
}

impl PluginChain {
    /// Builds a chain from a `-p` specification:
    /// comma-separated plugin names, each with optional `:key=value:...`
    /// parameters, e.g. `http,ntp,ssdp:ports=1900`.
    pub fn from_spec(spec: &str) -> Result<PluginChain, ProbeError> {
        let mut chain = PluginChain::default();
        if spec.trim().is_empty() {
            return Ok(chain);
        }
        for item in spec.split(',') {
            let (name, params) = match item.split_once(':') {
                Some((n, p)) => (n.trim(), p),
                None => (item.trim(), ""),
            };
            let mut plugin = create_plugin(name).ok_or_else(|| {
                ProbeError::Config(format!(
                    "unknown plugin {:?} (supported: {})",
                    name,
                    SUPPORTED_PLUGINS.join(", ")
                ))
            })?;
            if chain.plugins.iter().any(|p| p.ext_type() == plugin.ext_type()) {
                return Err(ProbeError::Config(format!("plugin {:?} given twice", name)));
            }
            plugin.init(params)?;
            chain.plugins.push(plugin);
        }
        Ok(chain)
    }

    /// Per-worker copy of the whole chain.
    pub fn clone_chain(&self) -> PluginChain {
        PluginChain {
            plugins: self.plugins.iter().map(|p| p.clone_plugin()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn ProcessPlugin>> {
        self.plugins.iter()
    }

    /// Largest payload requirement across the chain.
    pub fn max_payload_len(&self) -> u16 {
        self.plugins
            .iter()
            .map(|p| p.max_payload_len())
            .max()
            .unwrap_or(MAX_PKT_SIZE as u16)
    }

    pub fn pre_create(&mut self, pkt: &mut Packet) -> u32 {
        let mut ret = 0;
        for p in &mut self.plugins {
            ret |= p.pre_create(pkt);
        }
        ret
    }

    pub fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> u32 {
        let mut ret = 0;
        for p in &mut self.plugins {
            ret |= p.post_create(flow, pkt);
        }
        ret
    }

    pub fn pre_update(&mut self, flow: &mut Flow, pkt: &mut Packet) -> u32 {
        let mut ret = 0;
        for p in &mut self.plugins {
            ret |= p.pre_update(flow, pkt);
        }
        ret
    }

    pub fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> u32 {
        let mut ret = 0;
        for p in &mut self.plugins {
            ret |= p.post_update(flow, pkt);
        }
        ret
    }

    pub fn pre_export(&mut self, flow: &mut Flow) {
        for p in &mut self.plugins {
            p.pre_export(flow);
        }
    }

    pub fn finish(&mut self) {
        for p in &mut self.plugins {
            p.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_from_spec() {
        let chain = PluginChain::from_spec("http,ntp").unwrap();
        assert_eq!(chain.iter().count(), 2);
        assert!(PluginChain::from_spec("").unwrap().is_empty());
    }

    #[test]
    fn unknown_plugin_rejected() {
        assert!(PluginChain::from_spec("http,nope").is_err());
    }

    #[test]
    fn duplicate_plugin_rejected() {
        assert!(PluginChain::from_spec("http,http").is_err());
    }

    #[test]
    fn ext_bits_are_distinct() {
        let mut seen = 0u64;
        for t in ExtType::ALL {
            assert_eq!(seen & t.bit(), 0);
            seen |= t.bit();
        }
    }
}
