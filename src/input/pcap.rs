//! Capture-file replay through `pcap-parser`.
//!
//! Handles both legacy pcap and pcapng, including per-interface timestamp
//! resolution for pcapng enhanced packet blocks.

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use pcap_parser::pcapng::{Block, OptionCode};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{PcapBlockOwned, PcapError, create_reader};

use crate::error::ProbeError;
use crate::input::{PacketFilter, PacketReceiver, ReadStatus};
use crate::packet::PacketBlock;
use crate::parser::parse_frame;
use crate::time::ts_from_parts;

const READER_BUFFER_SIZE: usize = 65536;

pub struct PcapFileReader {
    reader: Box<dyn PcapReaderIterator>,
    snaplen: usize,
    filter: Option<PacketFilter>,
    /// Timestamp resolution per pcapng interface, as the raw if_tsresol
    /// byte (default 6: microseconds).
    if_tsresol: Vec<u8>,
    seen: u64,
    parsed: u64,
    eof: bool,
}

impl PcapFileReader {
    pub fn open(
        path: &str,
        snaplen: usize,
        filter: Option<PacketFilter>,
    ) -> Result<PcapFileReader, ProbeError> {
        let input: Box<dyn Read + Send> = if path == "-" {
            Box::new(std::io::stdin())
        } else {
            Box::new(File::open(path).map_err(|e| {
                ProbeError::Capture(format!("cannot open capture file {:?}: {}", path, e))
            })?)
        };
        let reader = create_reader(READER_BUFFER_SIZE, input)
            .map_err(|e| ProbeError::Capture(format!("not a capture file: {:?}", e)))?;
        Ok(PcapFileReader {
            reader,
            snaplen,
            filter,
            if_tsresol: Vec::new(),
            seen: 0,
            parsed: 0,
            eof: false,
        })
    }
}

impl PacketReceiver for PcapFileReader {
    fn receive(&mut self, block: &mut PacketBlock) -> Result<ReadStatus, ProbeError> {
        block.clear();
        if self.eof {
            return Ok(ReadStatus::Eof);
        }

        let PcapFileReader {
            reader,
            snaplen,
            filter,
            if_tsresol,
            seen,
            parsed,
            eof,
        } = self;

        let mut stalled = 0u32;
        while block.cnt < block.capacity() {
            match reader.next() {
                Ok((offset, pblock)) => {
                    stalled = 0;
                    let frame: Option<(Duration, &[u8])> = match &pblock {
                        PcapBlockOwned::LegacyHeader(_) => None,
                        PcapBlockOwned::Legacy(b) => {
                            Some((ts_from_parts(u64::from(b.ts_sec), b.ts_usec), b.data))
                        }
                        PcapBlockOwned::NG(ng) => match ng {
                            Block::InterfaceDescription(idb) => {
                                let tsresol = idb
                                    .options
                                    .iter()
                                    .find(|o| o.code == OptionCode::IfTsresol)
                                    .and_then(|o| o.value.first().copied())
                                    .unwrap_or(6);
                                if_tsresol.push(tsresol);
                                None
                            }
                            Block::EnhancedPacket(epb) => {
                                let tsresol = if_tsresol
                                    .get(epb.if_id as usize)
                                    .copied()
                                    .unwrap_or(6);
                                let raw = u64::from(epb.ts_high) << 32 | u64::from(epb.ts_low);
                                Some((ng_timestamp(raw, tsresol), epb.data))
                            }
                            Block::SimplePacket(spb) => Some((Duration::ZERO, spb.data)),
                            _ => None,
                        },
                    };

                    if let Some((ts, data)) = frame {
                        *seen += 1;
                        let pkt = &mut block.pkts[block.cnt];
                        let ok = parse_frame(ts, data, *snaplen, pkt)
                            && filter.as_ref().is_none_or(|f| f.matches(pkt));
                        if ok {
                            *parsed += 1;
                            block.bytes += data.len() as u64;
                            block.cnt += 1;
                        }
                    }
                    reader.consume(offset);
                }
                Err(PcapError::Eof) => {
                    *eof = true;
                    break;
                }
                Err(PcapError::Incomplete(_)) => {
                    stalled += 1;
                    if stalled > 2 {
                        // Truncated trailing block; treat as end of file.
                        *eof = true;
                        break;
                    }
                    reader.refill().map_err(|e| ProbeError::Parse {
                        context: format!("pcap refill: {:?}", e),
                    })?;
                }
                Err(e) => {
                    return Err(ProbeError::Parse {
                        context: format!("pcap read: {:?}", e),
                    });
                }
            }
        }

        if block.cnt > 0 {
            Ok(ReadStatus::Data)
        } else {
            Ok(ReadStatus::Eof)
        }
    }

    fn seen(&self) -> u64 {
        self.seen
    }

    fn parsed(&self) -> u64 {
        self.parsed
    }
}

/// Converts a pcapng timestamp to a duration since the epoch. The
/// resolution byte encodes a negative power of ten, or of two when the
/// high bit is set.
fn ng_timestamp(raw: u64, tsresol: u8) -> Duration {
    let per_sec: u64 = if tsresol & 0x80 != 0 {
        1u64 << (tsresol & 0x7f).min(63)
    } else {
        10u64.pow(u32::from(tsresol).min(19))
    };
    if per_sec == 0 {
        return Duration::ZERO;
    }
    let secs = raw / per_sec;
    let frac = raw % per_sec;
    Duration::from_secs(secs) + Duration::from_nanos(frac.saturating_mul(1_000_000_000) / per_sec)
}
