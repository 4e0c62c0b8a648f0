mod errorext;
pub use errorext::{HandleErr, Ignore};

mod tracing;
pub use tracing::init_tracing;

use std::time::SystemTime;

/// Seconds since the unix epoch, saturating at zero on clock weirdness.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}
