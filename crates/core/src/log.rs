use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric log level carried by the `MF-Log-Level` loopback header (spec §6).
/// Grounded in `ops::LogLevel`, but kept local since the simulator does not share
/// the production crate's catalog-task framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
    /// Level 5: logging disabled for the emitting call site.
    Not = 5,
}

impl LogLevel {
    pub fn from_header(value: u8) -> Option<LogLevel> {
        match value {
            0 => Some(LogLevel::Error),
            1 => Some(LogLevel::Warn),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Debug),
            4 => Some(LogLevel::Trace),
            5 => Some(LogLevel::Not),
            _ => None,
        }
    }
}

/// A single log record forwarded from the runtime via `POST /core/log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}
