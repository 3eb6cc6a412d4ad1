use std::fmt;

/// Error type shared by configuration, capture and export code paths.
///
/// Plugin parse failures are deliberately not represented here: a plugin
/// that cannot parse a payload simply attaches no extension and returns no
/// flags, and the packet continues through the pipeline.
#[derive(Debug)]
pub enum ProbeError {
    /// Invalid command line or option value. Reported before any worker
    /// thread is started; the process exits with status 1.
    Config(String),

    /// Capture source could not be opened or died mid-read.
    Capture(String),

    /// Malformed capture data (bad pcap framing, truncated block).
    Parse {
        /// Description of what was being parsed
        context: String,
    },

    /// Transport-level I/O error from the exporter.
    Io(std::io::Error),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Config(msg) => write!(f, "configuration error: {}", msg),
            ProbeError::Capture(msg) => write!(f, "capture error: {}", msg),
            ProbeError::Parse { context } => write!(f, "parse error: {}", context),
            ProbeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Io(e)
    }
}
