use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock before unix epoch")
        .as_secs()
}
