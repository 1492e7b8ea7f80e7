/// Frame hex-dump helpers
///
/// Emitted through the `log` facade when a context's debug flag is set:
/// a spaced hex dump at `debug!` level and a compact form at `trace!`.
use log::{debug, log_enabled, trace, Level};

use crate::backend::BackendKind;

/// Format bytes as spaced uppercase hex pairs
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dump one frame in both spaced and compact form
pub fn log_frame(kind: BackendKind, direction: &str, data: &[u8]) {
    if log_enabled!(Level::Debug) {
        debug!(
            "[{}] {} {} bytes: {}",
            kind,
            direction,
            data.len(),
            format_hex_packet(data)
        );
    }
    if log_enabled!(Level::Trace) {
        trace!("[{}] {} {}", kind, direction, hex::encode_upper(data));
    }
}
