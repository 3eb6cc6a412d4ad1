#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cli;
pub mod error;
pub mod export;
pub mod flow;
pub mod input;
pub mod packet;
pub mod parser;
pub mod plugins;
pub mod ring;
pub mod time;
pub mod worker;

pub use cache::{CacheConfig, CacheStats, FlowCache};
pub use cli::{Cli, Options, OutputSpec};
pub use error::ProbeError;
pub use export::framed::{FramedConfig, FramedExporter};
pub use export::ipfix::{IpfixConfig, IpfixExporter};
pub use export::{ExportStats, FlowExporter};
pub use flow::{EndReason, Flow, FlowKey};
pub use packet::{Packet, PacketBlock, PacketRecord};
pub use plugins::{ExtType, PluginChain, ProcessPlugin, RecordExt};
pub use ring::{ExportItem, FlowRing};
