// Timestamp helpers for state entries and install logs.

use chrono::Utc;

/// Returns the current UTC time in RFC 3339 format, the representation
/// every `updated_at` state field and log line uses.
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// A compact local timestamp used for session directory names:
/// `YYYYMMDD-HHMMSS`.
pub fn session_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}
