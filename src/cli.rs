//! Command line interface and option resolution.

use std::time::Duration;

use clap::Parser;

use crate::cache::{DEFAULT_ACTIVE_TIMEOUT, DEFAULT_INACTIVE_TIMEOUT, DEFAULT_LINE_SIZE};
use crate::error::ProbeError;
use crate::export::ipfix::DEFAULT_MTU;
use crate::input::InputSpec;

const DEFAULT_CACHE_SIZE_EXPONENT: u32 = 17;
const SNAPLEN_MIN: usize = 120;
const SNAPLEN_MAX: usize = 65535;

#[derive(Parser, Debug)]
#[command(
    name = "flowprobe",
    version,
    about = "Passive IPFIX flow exporter with pluggable application-layer parsers"
)]
pub struct Cli {
    /// Capture from a network interface; may repeat, one worker each.
    #[arg(short = 'I', long = "interface", value_name = "NAME")]
    pub interface: Vec<String>,

    /// Read packets from a capture file; `-` reads standard input.
    #[arg(short = 'r', long = "file", value_name = "PATH")]
    pub file: Vec<String>,

    /// Stop after this many packets per input.
    #[arg(short = 'c', long = "count", value_name = "N")]
    pub count: Option<u64>,

    /// Snapshot length in bytes, clamped to [120, 65535].
    #[arg(short = 'l', long = "snapshot-len", value_name = "N", default_value_t = 1600)]
    pub snapshot_len: usize,

    /// Active:inactive timeouts in seconds, e.g. `300:30`.
    #[arg(short = 't', long = "timeout", value_name = "A:I", default_value = "default")]
    pub timeout: String,

    /// Cache size as a power-of-two exponent (4-30).
    #[arg(short = 's', long = "cache-size", value_name = "K", default_value = "default")]
    pub cache_size: String,

    /// Print cache statistics every T seconds.
    #[arg(short = 'S', long = "cache-statistics", value_name = "T")]
    pub cache_statistics: Option<f64>,

    /// Link identifier carried in framed output (and the IPFIX
    /// observation domain ID).
    #[arg(short = 'L', long = "link-bit-field", value_name = "V", default_value_t = 1)]
    pub link_bit_field: u64,

    /// Direction tag carried in exported records.
    #[arg(short = 'D', long = "dir-bit-field", value_name = "V", default_value_t = 0)]
    pub dir_bit_field: u8,

    /// Packet filter expression.
    #[arg(short = 'F', long = "filter", value_name = "EXPR")]
    pub filter: Option<String>,

    /// Emit the observation domain ID in place of the link field
    /// (framed output).
    #[arg(short = 'O', long = "odid")]
    pub odid: bool,

    /// IPFIX collector endpoint `HOST:PORT`; brackets around the host
    /// are tolerated.
    #[arg(short = 'x', long = "ipfix", value_name = "HOST:PORT")]
    pub ipfix: Option<String>,

    /// Use UDP transport to the collector (default TCP).
    #[arg(short = 'u', long = "udp")]
    pub udp: bool,

    /// Write framed records to `PREFIX.<channel>` files instead of IPFIX.
    #[arg(short = 'U', long = "framed", value_name = "PREFIX")]
    pub framed: Option<String>,

    /// Input queue depth.
    #[arg(short = 'q', long = "iqueue", value_name = "N", default_value_t = 64)]
    pub iqueue: usize,

    /// Export queue depth.
    #[arg(short = 'Q', long = "oqueue", value_name = "N", default_value_t = 16536)]
    pub oqueue: usize,

    /// Export rate cap in flows per second, 0 disables.
    #[arg(short = 'e', long = "fps", value_name = "N", default_value_t = 0)]
    pub fps: u32,

    /// IPFIX message MTU.
    #[arg(short = 'm', long = "mtu", value_name = "N", default_value_t = DEFAULT_MTU)]
    pub mtu: usize,

    /// Comma-separated plugins, each with optional `:key=value`
    /// parameters.
    #[arg(short = 'p', long = "plugins", value_name = "LIST", default_value = "")]
    pub plugins: String,
}

/// Output stage selected on the command line.
#[derive(Debug, Clone)]
pub enum OutputSpec {
    Ipfix { host: String, port: u16, udp: bool },
    Framed { prefix: String },
}

/// Fully resolved runtime options.
#[derive(Debug, Clone)]
pub struct Options {
    pub inputs: Vec<InputSpec>,
    pub count: u64,
    pub snaplen: usize,
    pub active: Duration,
    pub inactive: Duration,
    pub cache_size: u32,
    pub line_size: u32,
    pub stats_interval: Option<Duration>,
    pub link_bit_field: u64,
    pub dir_bit_field: u8,
    pub filter: Option<String>,
    pub odid: bool,
    pub output: OutputSpec,
    pub iqueue: usize,
    pub oqueue: usize,
    pub fps: u32,
    pub mtu: usize,
    pub plugins: String,
}

impl Options {
    pub fn from_cli(cli: Cli) -> Result<Options, ProbeError> {
        let mut inputs: Vec<InputSpec> = Vec::new();
        for name in &cli.interface {
            inputs.push(InputSpec::Interface(name.clone()));
        }
        for path in &cli.file {
            inputs.push(InputSpec::File(path.clone()));
        }
        if inputs.is_empty() {
            return Err(ProbeError::Config(
                "no input given; use -I interface or -r file".into(),
            ));
        }

        let (active, inactive) = parse_timeouts(&cli.timeout)?;
        let cache_size = parse_cache_size(&cli.cache_size)?;

        let output = match (&cli.ipfix, &cli.framed) {
            (Some(_), Some(_)) => {
                return Err(ProbeError::Config(
                    "cannot export IPFIX and framed records at the same time".into(),
                ));
            }
            (Some(endpoint), None) => {
                let (host, port) = parse_endpoint(endpoint)?;
                OutputSpec::Ipfix {
                    host,
                    port,
                    udp: cli.udp,
                }
            }
            (None, Some(prefix)) => OutputSpec::Framed {
                prefix: prefix.clone(),
            },
            (None, None) => {
                return Err(ProbeError::Config(
                    "no output given; use -x host:port or -U prefix".into(),
                ));
            }
        };

        if cli.iqueue == 0 || cli.oqueue == 0 {
            return Err(ProbeError::Config("queue depth must not be zero".into()));
        }

        Ok(Options {
            inputs,
            count: cli.count.unwrap_or(0),
            snaplen: cli.snapshot_len.clamp(SNAPLEN_MIN, SNAPLEN_MAX),
            active,
            inactive,
            cache_size,
            line_size: DEFAULT_LINE_SIZE,
            stats_interval: match cli.cache_statistics {
                Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
                Some(_) => {
                    return Err(ProbeError::Config(
                        "statistics interval must be positive".into(),
                    ));
                }
                None => None,
            },
            link_bit_field: cli.link_bit_field,
            dir_bit_field: cli.dir_bit_field,
            filter: cli.filter,
            odid: cli.odid,
            output,
            iqueue: cli.iqueue,
            oqueue: cli.oqueue,
            fps: cli.fps,
            mtu: cli.mtu,
            plugins: cli.plugins,
        })
    }
}

/// Parses `active:inactive` timeouts in (possibly fractional) seconds.
fn parse_timeouts(spec: &str) -> Result<(Duration, Duration), ProbeError> {
    if spec == "default" {
        return Ok((
            Duration::from_secs_f64(DEFAULT_ACTIVE_TIMEOUT),
            Duration::from_secs_f64(DEFAULT_INACTIVE_TIMEOUT),
        ));
    }
    let (active, inactive) = spec
        .split_once(':')
        .ok_or_else(|| ProbeError::Config(format!("bad timeout {:?}, expected A:I", spec)))?;
    let active: f64 = active
        .parse()
        .map_err(|_| ProbeError::Config(format!("bad active timeout {:?}", active)))?;
    let inactive: f64 = inactive
        .parse()
        .map_err(|_| ProbeError::Config(format!("bad inactive timeout {:?}", inactive)))?;
    if active < 0.0 || inactive < 0.0 {
        return Err(ProbeError::Config("timeouts must not be negative".into()));
    }
    Ok((
        Duration::from_secs_f64(active),
        Duration::from_secs_f64(inactive),
    ))
}

/// Parses the cache size exponent; `default` is 2^17 slots.
fn parse_cache_size(spec: &str) -> Result<u32, ProbeError> {
    let exponent: u32 = if spec == "default" {
        DEFAULT_CACHE_SIZE_EXPONENT
    } else {
        spec.parse()
            .map_err(|_| ProbeError::Config(format!("bad cache size exponent {:?}", spec)))?
    };
    if !(4..=30).contains(&exponent) {
        return Err(ProbeError::Config(format!(
            "cache size exponent {} out of range 4-30",
            exponent
        )));
    }
    Ok(1u32 << exponent)
}

/// Parses `HOST:PORT`, tolerating brackets around the host.
fn parse_endpoint(spec: &str) -> Result<(String, u16), ProbeError> {
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| ProbeError::Config(format!("bad endpoint {:?}, expected host:port", spec)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProbeError::Config(format!("bad endpoint {:?}", spec)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ProbeError::Config(format!("bad port {:?}", port)))?;
    Ok((host.to_string(), port))
}
