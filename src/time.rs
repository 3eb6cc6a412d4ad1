use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Builds a packet timestamp from the seconds and microseconds fields of a
/// capture record header.
pub fn ts_from_parts(secs: u64, usecs: u32) -> Duration {
    Duration::from_secs(secs) + Duration::from_micros(usecs.into())
}

/// Wall clock as a duration since the Unix epoch.
pub fn now_unix() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Wall clock in whole seconds since the Unix epoch, as carried by the
/// IPFIX message header export time field.
pub fn now_unix_secs() -> u64 {
    now_unix().as_secs()
}

/// Milliseconds since the Unix epoch, the resolution of the
/// flowStartMilliseconds / flowEndMilliseconds elements.
pub fn unix_millis(ts: Duration) -> u64 {
    ts.as_secs() * 1000 + u64::from(ts.subsec_millis())
}
