use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds for the long-identifier header timestamp. Clamps to
/// zero if the clock is before the epoch rather than failing the datagram.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
