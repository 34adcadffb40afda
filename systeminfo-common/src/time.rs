use chrono::Utc;

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}
