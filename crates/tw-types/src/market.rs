use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single OHLCV bar as delivered by the data source.
///
/// Timestamps are strictly monotonic per symbol within a data file; when
/// multiple symbols interleave the engine merges them by timestamp with a
/// stable file-then-row tie break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Row identifier carried through from the data file, if present.
    #[serde(default)]
    pub id: Option<String>,
}

impl MarketData {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Identifier used by mark rows: the file-supplied id when present,
    /// `<symbol>:<epoch-seconds>` otherwise.
    pub fn data_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}:{}", self.symbol, self.timestamp.timestamp()),
        }
    }

    /// Typical price (HLC/3).
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }
}

/// Time bucket used when resampling ranges of bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    FourHour,
    Day,
    Week,
}

impl Interval {
    pub fn as_seconds(&self) -> i64 {
        match self {
            Interval::Minute => 60,
            Interval::FiveMinute => 300,
            Interval::FifteenMinute => 900,
            Interval::Hour => 3600,
            Interval::FourHour => 14400,
            Interval::Day => 86400,
            Interval::Week => 604800,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::Minute => "1m",
            Interval::FiveMinute => "5m",
            Interval::FifteenMinute => "15m",
            Interval::Hour => "1h",
            Interval::FourHour => "4h",
            Interval::Day => "1d",
            Interval::Week => "1w",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::Minute),
            "5m" => Ok(Interval::FiveMinute),
            "15m" => Ok(Interval::FifteenMinute),
            "1h" => Ok(Interval::Hour),
            "4h" => Ok(Interval::FourHour),
            "1d" => Ok(Interval::Day),
            "1w" => Ok(Interval::Week),
            other => Err(format!("unknown interval: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar() -> MarketData {
        MarketData::new(
            "AAPL",
            Utc::now(),
            dec!(100),
            dec!(105),
            dec!(99),
            dec!(102),
            dec!(10000),
        )
    }

    #[test]
    fn test_typical_price() {
        let b = bar();
        assert_eq!(b.typical_price(), (dec!(105) + dec!(99) + dec!(102)) / dec!(3));
    }

    #[test]
    fn test_data_id_prefers_file_id() {
        let b = bar().with_id("row-42");
        assert_eq!(b.data_id(), "row-42");

        let b = bar();
        assert!(b.data_id().starts_with("AAPL:"));
    }

    #[test]
    fn test_interval_roundtrip() {
        for iv in [
            Interval::Minute,
            Interval::FiveMinute,
            Interval::FifteenMinute,
            Interval::Hour,
            Interval::FourHour,
            Interval::Day,
            Interval::Week,
        ] {
            assert_eq!(iv.to_string().parse::<Interval>().unwrap(), iv);
        }
        assert!("2h".parse::<Interval>().is_err());
    }
}
