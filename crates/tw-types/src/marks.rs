use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::market::MarketData;

/// Colors available for bar annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkColor {
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Gray,
}

impl fmt::Display for MarkColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarkColor::Red => "red",
            MarkColor::Green => "green",
            MarkColor::Blue => "blue",
            MarkColor::Yellow => "yellow",
            MarkColor::Orange => "orange",
            MarkColor::Purple => "purple",
            MarkColor::Gray => "gray",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkShape {
    Circle,
    Square,
    Triangle,
}

impl fmt::Display for MarkShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarkShape::Circle => "circle",
            MarkShape::Square => "square",
            MarkShape::Triangle => "triangle",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for MarkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarkLevel::Info => "INFO",
            MarkLevel::Warning => "WARNING",
            MarkLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Optional pointer from a mark back to the signal that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRef {
    pub signal_type: String,
    pub name: String,
    pub time: DateTime<Utc>,
    pub symbol: String,
}

/// Strategy-supplied annotation payload, before the store assigns an id
/// and ties it to a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkSpec {
    pub color: MarkColor,
    pub shape: MarkShape,
    pub level: MarkLevel,
    pub title: String,
    pub message: String,
    pub category: String,
    #[serde(default)]
    pub signal: Option<SignalRef>,
}

/// A mark as recorded: append-only, ids strictly increasing per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub id: u64,
    pub market_data: MarketData,
    pub color: MarkColor,
    pub shape: MarkShape,
    pub level: MarkLevel,
    pub title: String,
    pub message: String,
    pub category: String,
    pub signal: Option<SignalRef>,
}

impl Mark {
    pub fn from_spec(id: u64, market_data: MarketData, spec: MarkSpec) -> Self {
        Self {
            id,
            market_data,
            color: spec.color,
            shape: spec.shape,
            level: spec.level,
            title: spec.title,
            message: spec.message,
            category: spec.category,
            signal: spec.signal,
        }
    }
}

/// Log severity understood by the strategy-visible logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// One strategy log line, stamped with the current bar's time and symbol.
///
/// Fields use a BTreeMap so persisted rows serialize in a stable order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub level: LogLevel,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mark_from_spec() {
        let bar = MarketData::new(
            "AAPL",
            Utc::now(),
            dec!(1),
            dec!(2),
            dec!(1),
            dec!(2),
            dec!(100),
        );
        let spec = MarkSpec {
            color: MarkColor::Green,
            shape: MarkShape::Triangle,
            level: MarkLevel::Info,
            title: "entry".to_string(),
            message: "crossed above".to_string(),
            category: "signal".to_string(),
            signal: None,
        };
        let mark = Mark::from_spec(3, bar.clone(), spec);
        assert_eq!(mark.id, 3);
        assert_eq!(mark.market_data, bar);
        assert_eq!(mark.color, MarkColor::Green);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Error);
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }
}
