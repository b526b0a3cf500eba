//! Utility functions
//!
//! Kafka error code descriptions and byte formatting for log output.

/// Kafka protocol error codes the client reacts to
pub mod error_codes {
    pub const NONE: i16 = 0;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const NOT_ENOUGH_REPLICAS: i16 = 19;
    pub const NOT_ENOUGH_REPLICAS_AFTER_APPEND: i16 = 20;
}

/// Maps a Kafka error code to a readable description
pub fn kafka_error_message(code: i16) -> String {
    let message = match code {
        0 => "NONE",
        1 => "OFFSET_OUT_OF_RANGE - invalid offset specified",
        2 => "CORRUPT_MESSAGE - message failed checksum",
        3 => "UNKNOWN_TOPIC_OR_PARTITION - topic/partition doesn't exist",
        5 => "LEADER_NOT_AVAILABLE - partition leader unavailable",
        6 => "NOT_LEADER_OR_FOLLOWER - broker is not the leader",
        7 => "REQUEST_TIMED_OUT - broker did not respond in time",
        10 => "MESSAGE_TOO_LARGE - message exceeds broker limits",
        17 => "INVALID_TOPIC_EXCEPTION - topic name is invalid",
        18 => "RECORD_LIST_TOO_LARGE - batch exceeds broker limits",
        19 => "NOT_ENOUGH_REPLICAS - too few in-sync replicas",
        20 => "NOT_ENOUGH_REPLICAS_AFTER_APPEND - written to fewer replicas than required",
        21 => "INVALID_REQUIRED_ACKS - acks value rejected",
        29 => "TOPIC_AUTHORIZATION_FAILED - insufficient permissions",
        35 => "UNSUPPORTED_VERSION - request version not supported",
        41 => "NOT_CONTROLLER - broker is not the controller",
        87 => "INVALID_RECORD - record format invalid",
        _ => return format!("Unknown Kafka error code: {}", code),
    };
    message.to_string()
}

/// Whether a request failing with `code` may succeed when retried
pub fn is_retriable(code: i16) -> bool {
    use error_codes::*;
    matches!(
        code,
        LEADER_NOT_AVAILABLE
            | NOT_LEADER_OR_FOLLOWER
            | REQUEST_TIMED_OUT
            | NOT_ENOUGH_REPLICAS
            | NOT_ENOUGH_REPLICAS_AFTER_APPEND
    )
}

/// Formats a byte count into a human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
