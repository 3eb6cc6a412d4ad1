//! Worker loops and cooperative shutdown.
//!
//! One pipeline per capture input: a capture thread filling packet
//! blocks, a storage thread feeding a private flow cache, and one export
//! thread per exporter draining the export ring. Shutdown is staged: the
//! main thread raises `terminate_input`, `terminate_storage` and
//! `terminate_export` in order, and each stage drains its downstream
//! queue before exiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;
use tracing::{error, info};

use crate::cache::{CacheStats, FlowCache};
use crate::export::FlowExporter;
use crate::input::{InputSpec, PacketFilter, ReadStatus};
use crate::ring::{ExportItem, FlowRing};
use crate::time::now_unix;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Installs SIGINT/SIGTERM handlers that raise the stop flag, and ignores
/// SIGPIPE so a dying collector surfaces as a send error instead of
/// killing the process.
pub fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe.
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Shared termination flags, one per pipeline stage.
#[derive(Default)]
pub struct ShutdownHandle {
    pub terminate_input: AtomicBool,
    pub terminate_storage: AtomicBool,
    pub terminate_export: AtomicBool,
}

impl ShutdownHandle {
    pub fn new() -> Arc<ShutdownHandle> {
        Arc::new(ShutdownHandle::default())
    }
}

#[derive(Debug, Default)]
pub struct InputStats {
    pub packets: u64,
    pub parsed: u64,
    pub bytes: u64,
    /// Nanoseconds spent pushing blocks into the input queue.
    pub qtime_ns: u64,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct StorageStats {
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
pub struct OutputStats {
    pub biflows: u64,
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
}

/// Capture loop: opens the source, fills recycled blocks and pushes them
/// downstream until EOF, the packet limit, or shutdown.
pub fn input_worker(
    spec: InputSpec,
    snaplen: usize,
    filter: Option<PacketFilter>,
    pkt_limit: u64,
    pipe_full: crossbeam::channel::Sender<crate::packet::PacketBlock>,
    pipe_free: crossbeam::channel::Receiver<crate::packet::PacketBlock>,
    shutdown: Arc<ShutdownHandle>,
) -> InputStats {
    let mut stats = InputStats::default();

    let mut receiver = match crate::input::open(&spec, snaplen, filter) {
        Ok(r) => r,
        Err(e) => {
            error!("cannot open input {:?}: {}", spec, e);
            stats.error = Some(e.to_string());
            return stats;
        }
    };

    let mut pending: Option<crate::packet::PacketBlock> = None;
    while !shutdown.terminate_input.load(Ordering::Relaxed) && !stop_requested() {
        // Reuse a block the storage worker has finished with.
        let mut block = match pending.take() {
            Some(b) => b,
            None => match pipe_free.recv_timeout(Duration::from_millis(10)) {
                Ok(b) => b,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        if pkt_limit != 0 && receiver.parsed() >= pkt_limit {
            break;
        }

        match receiver.receive(&mut block) {
            Ok(ReadStatus::Data) => {
                if pkt_limit != 0 && receiver.parsed() > pkt_limit {
                    let over = (receiver.parsed() - pkt_limit) as usize;
                    block.cnt = block.cnt.saturating_sub(over);
                }
                stats.bytes += block.bytes;
                let start = Instant::now();
                if pipe_full.send(block).is_err() {
                    break;
                }
                stats.qtime_ns += start.elapsed().as_nanos() as u64;
            }
            Ok(ReadStatus::Timeout) => {
                std::thread::sleep(Duration::from_micros(1));
                pending = Some(block);
            }
            Ok(ReadStatus::Eof) => break,
            Err(e) => {
                error!("input {:?} failed: {}", spec, e);
                stats.error = Some(e.to_string());
                break;
            }
        }
    }

    stats.packets = receiver.seen();
    stats.parsed = receiver.parsed();
    stats
}

/// Storage loop: feeds blocks into the cache; when idle, advances the
/// timeout sweep against the wall clock. On exit the cache is finished,
/// forcing every remaining flow to the exporter.
pub fn storage_worker(
    mut cache: FlowCache,
    pipe_full: crossbeam::channel::Receiver<crate::packet::PacketBlock>,
    pipe_free: crossbeam::channel::Sender<crate::packet::PacketBlock>,
    stats_interval: Option<Duration>,
    shutdown: Arc<ShutdownHandle>,
) -> StorageStats {
    let mut last_stats = Instant::now();

    loop {
        match pipe_full.try_recv() {
            Ok(mut block) => {
                for i in 0..block.cnt {
                    cache.put_packet(&mut block.pkts[i]);
                }
                block.clear();
                let _ = pipe_free.send(block);
            }
            Err(_) => {
                if shutdown.terminate_storage.load(Ordering::Relaxed) && pipe_full.is_empty() {
                    break;
                }
                cache.export_expired(now_unix());
                std::thread::sleep(Duration::from_micros(1));
            }
        }

        if let Some(interval) = stats_interval {
            if last_stats.elapsed() >= interval {
                last_stats = Instant::now();
                cache.stats().print_report();
            }
        }
    }

    cache.finish();
    StorageStats {
        cache: cache.stats().clone(),
    }
}

/// Export loop: drains the ring into the exporter, flushing after one
/// second of idleness, optionally rate-capped to `fps` records a second.
pub fn export_worker(
    mut exporter: Box<dyn FlowExporter>,
    ring: Arc<FlowRing>,
    fps: u32,
    shutdown: Arc<ShutdownHandle>,
) -> OutputStats {
    let mut stats = OutputStats::default();
    let time_per_pkt = if fps != 0 {
        Duration::from_secs(1) / fps
    } else {
        Duration::ZERO
    };

    let mut begin = Instant::now();
    let mut last_flush = Instant::now();
    let mut pkts_from_begin: u32 = 0;

    loop {
        let Some(item) = ring.pop() else {
            if last_flush.elapsed() > Duration::from_secs(1) {
                last_flush = Instant::now();
                exporter.flush();
            }
            if shutdown.terminate_export.load(Ordering::Relaxed) && ring.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_micros(1));
            continue;
        };

        match &item {
            ExportItem::Flow(flow) => {
                stats.biflows += 1;
                stats.bytes += flow.src_octets + flow.dst_octets;
                stats.packets += u64::from(flow.src_packets) + u64::from(flow.dst_packets);
                exporter.export_flow(flow);
            }
            ExportItem::Packet(pkt) => {
                stats.packets += 1;
                exporter.export_packet(pkt);
            }
        }

        pkts_from_begin += 1;
        if fps == 0 {
            continue;
        }

        // Sleep until this record's expected send slot; the window
        // restarts after fps records.
        let elapsed = begin.elapsed();
        let next_start = time_per_pkt * pkts_from_begin;
        if next_start > elapsed {
            let mut diff = next_start - elapsed;
            if diff >= Duration::from_secs(1) {
                diff = Duration::from_secs(1) - Duration::from_micros(1);
            }
            std::thread::sleep(diff);
        }
        if pkts_from_begin >= fps {
            begin = Instant::now();
            pkts_from_begin = 0;
        }
    }

    exporter.shutdown();
    let exp = exporter.stats();
    stats.dropped = exp.flows_dropped + ring.dropped();
    info!(
        flows_seen = exp.flows_seen,
        dropped = stats.dropped,
        "exporter finished"
    );
    stats
}

/// Final counter summary printed at shutdown.
pub fn print_summary(inputs: &[InputStats], outputs: &[OutputStats]) {
    let mut packets = 0u64;
    let mut parsed = 0u64;
    let mut bytes = 0u64;
    let mut qtime = 0u64;
    for i in inputs {
        packets += i.packets;
        parsed += i.parsed;
        bytes += i.bytes;
        qtime += i.qtime_ns;
    }
    println!("Packets seen: {}", packets);
    println!("Packets parsed: {}", parsed);
    println!("Bytes seen: {}", bytes);
    println!("Queue push time: {} ns", qtime);

    let mut biflows = 0u64;
    let mut obytes = 0u64;
    let mut opackets = 0u64;
    let mut dropped = 0u64;
    for o in outputs {
        biflows += o.biflows;
        obytes += o.bytes;
        opackets += o.packets;
        dropped += o.dropped;
    }
    println!("Biflows exported: {}", biflows);
    println!("Bytes exported: {}", obytes);
    println!("Packets exported: {}", opackets);
    println!("Biflows dropped: {}", dropped);
}
