//! Capture inputs: pcap/pcapng file replay and live AF_PACKET capture.

pub mod filter;
pub mod pcap;
#[cfg(target_os = "linux")]
pub mod raw;

use crate::error::ProbeError;
use crate::packet::PacketBlock;

pub use filter::PacketFilter;

/// Outcome of one block-sized read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The block carries at least one packet.
    Data,
    /// Nothing arrived within the read timeout; try again.
    Timeout,
    /// The source is exhausted.
    Eof,
}

/// A capture source delivering decoded packets in blocks.
pub trait PacketReceiver {
    /// Fills `block` with as many packets as are available, up to its
    /// capacity. Filtered-out and undecodable frames are skipped.
    fn receive(&mut self, block: &mut PacketBlock) -> Result<ReadStatus, ProbeError>;

    /// Frames taken from the source.
    fn seen(&self) -> u64;

    /// Frames decoded up to the transport layer and passed downstream.
    fn parsed(&self) -> u64;
}

/// One capture source named on the command line.
#[derive(Debug, Clone)]
pub enum InputSpec {
    /// `-r PATH`; `-` reads standard input.
    File(String),
    /// `-I NAME` (live capture).
    Interface(String),
}

/// Opens the capture source described by `spec`. Called from the input
/// worker thread so the receiver never crosses a thread boundary.
pub fn open(
    spec: &InputSpec,
    snaplen: usize,
    filter: Option<PacketFilter>,
) -> Result<Box<dyn PacketReceiver>, ProbeError> {
    match spec {
        InputSpec::File(path) => Ok(Box::new(pcap::PcapFileReader::open(path, snaplen, filter)?)),
        #[cfg(target_os = "linux")]
        InputSpec::Interface(name) => {
            Ok(Box::new(raw::RawSocketReader::open(name, snaplen, filter)?))
        }
        #[cfg(not(target_os = "linux"))]
        InputSpec::Interface(_) => Err(ProbeError::Capture(
            "live capture is only supported on Linux".into(),
        )),
    }
}
