use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::cli::{Cli, Options, OutputSpec};
use flowprobe::error::ProbeError;
use flowprobe::export::FlowExporter;
use flowprobe::export::framed::{FramedConfig, FramedExporter};
use flowprobe::export::ipfix::{IpfixConfig, IpfixExporter};
use flowprobe::input::PacketFilter;
use flowprobe::packet::PKT_BLOCK_SIZE;
use flowprobe::plugins::PluginChain;
use flowprobe::ring::{BlockPipe, FlowRing};
use flowprobe::worker::{
    self, InputStats, OutputStats, ShutdownHandle, StorageStats, export_worker, input_worker,
    storage_worker,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct Pipeline {
    input: JoinHandle<InputStats>,
    storage: JoinHandle<StorageStats>,
}

fn run(cli: Cli) -> Result<(), ProbeError> {
    let opts = Options::from_cli(cli)?;
    let chain = PluginChain::from_spec(&opts.plugins)?;
    let filter = opts
        .filter
        .as_deref()
        .map(PacketFilter::parse)
        .transpose()?;

    worker::install_signal_handlers();

    let ring = Arc::new(FlowRing::new(opts.oqueue));
    let exporter = build_exporter(&opts, &chain)?;
    let shutdown = ShutdownHandle::new();

    // Plugins that inspect payloads may need more of each frame than the
    // configured snapshot length.
    let snaplen = if chain.is_empty() {
        opts.snaplen
    } else {
        opts.snaplen.max(usize::from(chain.max_payload_len()))
    };

    let export_handle = {
        let ring = ring.clone();
        let shutdown = shutdown.clone();
        let fps = opts.fps;
        std::thread::Builder::new()
            .name("export".into())
            .spawn(move || export_worker(exporter, ring, fps, shutdown))
            .expect("spawn export worker")
    };

    let mut pipelines = Vec::new();
    for (idx, spec) in opts.inputs.iter().enumerate() {
        let pipe = BlockPipe::new(opts.iqueue, PKT_BLOCK_SIZE);
        let cache_cfg = CacheConfig {
            size: opts.cache_size,
            line_size: opts.line_size,
            active: opts.active,
            inactive: opts.inactive,
        };
        let cache = FlowCache::new(&cache_cfg, chain.clone_chain(), ring.clone())?;

        let input = {
            let spec = spec.clone();
            let filter = filter.clone();
            let shutdown = shutdown.clone();
            let full_tx = pipe.full_tx.clone();
            let free_rx = pipe.free_rx.clone();
            let count = opts.count;
            std::thread::Builder::new()
                .name(format!("input{}", idx))
                .spawn(move || input_worker(spec, snaplen, filter, count, full_tx, free_rx, shutdown))
                .expect("spawn input worker")
        };

        let storage = {
            let shutdown = shutdown.clone();
            let full_rx = pipe.full_rx.clone();
            let free_tx = pipe.free_tx.clone();
            let stats_interval = opts.stats_interval;
            std::thread::Builder::new()
                .name(format!("storage{}", idx))
                .spawn(move || storage_worker(cache, full_rx, free_tx, stats_interval, shutdown))
                .expect("spawn storage worker")
        };

        pipelines.push(Pipeline { input, storage });
    }

    // Wait until every input drains on its own or a signal asks us to
    // stop, then take the workers down stage by stage, each stage
    // draining its queue first.
    loop {
        if worker::stop_requested() {
            info!("stop requested");
            break;
        }
        if pipelines.iter().all(|p| p.input.is_finished()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    shutdown.terminate_input.store(true, Ordering::SeqCst);
    let mut input_stats: Vec<InputStats> = Vec::new();
    let mut storage_handles = Vec::new();
    for p in pipelines {
        input_stats.push(p.input.join().unwrap_or_default());
        storage_handles.push(p.storage);
    }

    shutdown.terminate_storage.store(true, Ordering::SeqCst);
    let mut storage_stats: Vec<StorageStats> = Vec::new();
    for h in storage_handles {
        storage_stats.push(h.join().unwrap_or_default());
    }

    shutdown.terminate_export.store(true, Ordering::SeqCst);
    let output_stats: OutputStats = export_handle.join().unwrap_or_default();

    worker::print_summary(&input_stats, std::slice::from_ref(&output_stats));
    if opts.stats_interval.is_some() {
        for s in &storage_stats {
            s.cache.print_report();
        }
    }

    if let Some(msg) = input_stats.iter().find_map(|s| s.error.clone()) {
        return Err(ProbeError::Capture(msg));
    }
    Ok(())
}

fn build_exporter(
    opts: &Options,
    chain: &PluginChain,
) -> Result<Box<dyn FlowExporter>, ProbeError> {
    match &opts.output {
        OutputSpec::Ipfix { host, port, udp } => {
            let cfg = IpfixConfig {
                host: host.clone(),
                port: *port,
                udp: *udp,
                mtu: opts.mtu,
                odid: opts.link_bit_field as u32,
                dir_bit_field: u16::from(opts.dir_bit_field),
                ..IpfixConfig::default()
            };
            Ok(Box::new(IpfixExporter::new(cfg)?))
        }
        OutputSpec::Framed { prefix } => {
            let cfg = FramedConfig {
                link_bit_field: opts.link_bit_field,
                dir_bit_field: opts.dir_bit_field,
                odid: opts.odid.then_some(opts.link_bit_field as u32),
            };
            let open_channel = |i: usize| -> Result<Box<dyn Write + Send>, ProbeError> {
                let path = format!("{}.{}", prefix, i);
                let file = File::create(&path).map_err(|e| {
                    ProbeError::Config(format!("cannot create output {:?}: {}", path, e))
                })?;
                Ok(Box::new(BufWriter::new(file)))
            };
            let mut exp = FramedExporter::new(cfg, open_channel(0)?);
            for (i, plugin) in chain.iter().enumerate() {
                exp.add_plugin_channel(plugin.ext_type(), open_channel(i + 1)?);
            }
            Ok(Box::new(exp))
        }
    }
}
