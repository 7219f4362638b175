use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named indicator output consumed by strategies.
///
/// `raw_value` is an indicator-specific JSON document; the engine treats it
/// as opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub signal_type: String,
    pub name: String,
    pub reason: String,
    pub raw_value: String,
    pub symbol: String,
    pub indicator_type: String,
}
