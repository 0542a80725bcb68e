//! Small helpers shared by the broker modules.

use chrono::Utc;
use serde_json::Value;

/// Current wall-clock time as milliseconds since the UNIX epoch.
pub fn now_epoch_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Convert a whole-second interval from configuration into milliseconds.
pub fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

/// Render a payload for log lines, capped at `max_chars` characters.
///
/// Cuts on character boundaries so multi-byte payloads never split a code point.
pub fn payload_preview(payload: &Value, max_chars: usize) -> String {
    let rendered = payload.to_string();
    match rendered.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", rendered[..idx].trim_end()),
        None => rendered,
    }
}
