use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use tw_data::BarSource;
use tw_types::{EngineResult, IndicatorError, MarketData};

use crate::registry::Indicator;
use crate::signal::Signal;

fn parse_config<T: for<'de> Deserialize<'de>>(
    config: &serde_json::Value,
) -> Result<T, IndicatorError> {
    serde_json::from_value(config.clone()).map_err(|e| IndicatorError::InvalidConfig {
        message: e.to_string(),
    })
}

fn closes(bars: &[MarketData]) -> Vec<Decimal> {
    bars.iter().map(|b| b.close).collect()
}

fn relation(close: Decimal, value: Decimal) -> &'static str {
    if close > value {
        "above"
    } else if close < value {
        "below"
    } else {
        "at"
    }
}

/// Simple moving average of the last `period` closes.
pub struct Sma {
    period: usize,
}

impl Default for Sma {
    fn default() -> Self {
        Self { period: 20 }
    }
}

#[derive(Deserialize)]
struct PeriodConfig {
    period: usize,
}

impl Indicator for Sma {
    fn configure(&mut self, config: &serde_json::Value) -> Result<(), IndicatorError> {
        let parsed: PeriodConfig = parse_config(config)?;
        if parsed.period < 2 {
            return Err(IndicatorError::InvalidConfig {
                message: format!("period must be >= 2, got {}", parsed.period),
            });
        }
        self.period = parsed.period;
        Ok(())
    }

    fn evaluate(&self, bar: &MarketData, source: &BarSource) -> EngineResult<Signal> {
        let bars = source.last_n(&bar.symbol, bar.timestamp, self.period)?;
        if bars.len() < self.period {
            return Err(IndicatorError::InsufficientData {
                needed: self.period,
                got: bars.len(),
            }
            .into());
        }

        let prices = closes(&bars);
        let value = prices.iter().sum::<Decimal>() / Decimal::from(self.period);

        Ok(Signal {
            timestamp: bar.timestamp,
            signal_type: relation(bar.close, value).to_string(),
            name: format!("sma_{}", self.period),
            reason: format!("close {} vs {}-bar simple average {}", bar.close, self.period, value),
            raw_value: json!({ "value": value.to_string(), "period": self.period }).to_string(),
            symbol: bar.symbol.clone(),
            indicator_type: "sma".to_string(),
        })
    }
}

/// Exponential moving average seeded with an SMA over the first period.
pub struct Ema {
    period: usize,
}

impl Default for Ema {
    fn default() -> Self {
        Self { period: 20 }
    }
}

impl Indicator for Ema {
    fn configure(&mut self, config: &serde_json::Value) -> Result<(), IndicatorError> {
        let parsed: PeriodConfig = parse_config(config)?;
        if parsed.period < 2 {
            return Err(IndicatorError::InvalidConfig {
                message: format!("period must be >= 2, got {}", parsed.period),
            });
        }
        self.period = parsed.period;
        Ok(())
    }

    fn evaluate(&self, bar: &MarketData, source: &BarSource) -> EngineResult<Signal> {
        // Three periods of history lets the average converge past its seed.
        let bars = source.last_n(&bar.symbol, bar.timestamp, self.period * 3)?;
        if bars.len() < self.period {
            return Err(IndicatorError::InsufficientData {
                needed: self.period,
                got: bars.len(),
            }
            .into());
        }

        let prices = closes(&bars);
        let seed: Decimal =
            prices[..self.period].iter().sum::<Decimal>() / Decimal::from(self.period);
        let k = Decimal::from(2) / Decimal::from(self.period + 1);

        let mut value = seed;
        for price in &prices[self.period..] {
            value = (*price - value) * k + value;
        }

        Ok(Signal {
            timestamp: bar.timestamp,
            signal_type: relation(bar.close, value).to_string(),
            name: format!("ema_{}", self.period),
            reason: format!(
                "close {} vs {}-bar exponential average {}",
                bar.close, self.period, value
            ),
            raw_value: json!({ "value": value.to_string(), "period": self.period }).to_string(),
            symbol: bar.symbol.clone(),
            indicator_type: "ema".to_string(),
        })
    }
}

/// Relative strength index over consecutive close-to-close changes.
pub struct Rsi {
    period: usize,
    overbought: Decimal,
    oversold: Decimal,
}

impl Default for Rsi {
    fn default() -> Self {
        Self {
            period: 14,
            overbought: Decimal::from(70),
            oversold: Decimal::from(30),
        }
    }
}

#[derive(Deserialize)]
struct RsiConfig {
    period: usize,
    #[serde(default)]
    overbought: Option<Decimal>,
    #[serde(default)]
    oversold: Option<Decimal>,
}

impl Rsi {
    fn compute(&self, prices: &[Decimal]) -> Decimal {
        let mut gains = Decimal::ZERO;
        let mut losses = Decimal::ZERO;
        for pair in prices.windows(2) {
            let change = pair[1] - pair[0];
            if change > Decimal::ZERO {
                gains += change;
            } else {
                losses += change.abs();
            }
        }

        let period = Decimal::from(self.period);
        let avg_gain = gains / period;
        let avg_loss = losses / period;

        if avg_loss.is_zero() {
            return Decimal::from(100);
        }
        if avg_gain.is_zero() {
            return Decimal::ZERO;
        }

        let rs = avg_gain / avg_loss;
        Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs))
    }
}

impl Indicator for Rsi {
    fn configure(&mut self, config: &serde_json::Value) -> Result<(), IndicatorError> {
        let parsed: RsiConfig = parse_config(config)?;
        if parsed.period < 2 {
            return Err(IndicatorError::InvalidConfig {
                message: format!("period must be >= 2, got {}", parsed.period),
            });
        }
        self.period = parsed.period;
        if let Some(overbought) = parsed.overbought {
            self.overbought = overbought;
        }
        if let Some(oversold) = parsed.oversold {
            self.oversold = oversold;
        }
        if self.oversold >= self.overbought {
            return Err(IndicatorError::InvalidConfig {
                message: format!(
                    "oversold {} must be below overbought {}",
                    self.oversold, self.overbought
                ),
            });
        }
        Ok(())
    }

    fn evaluate(&self, bar: &MarketData, source: &BarSource) -> EngineResult<Signal> {
        let bars = source.last_n(&bar.symbol, bar.timestamp, self.period + 1)?;
        if bars.len() < self.period + 1 {
            return Err(IndicatorError::InsufficientData {
                needed: self.period + 1,
                got: bars.len(),
            }
            .into());
        }

        let value = self.compute(&closes(&bars));
        let signal_type = if value > self.overbought {
            "overbought"
        } else if value < self.oversold {
            "oversold"
        } else {
            "neutral"
        };

        Ok(Signal {
            timestamp: bar.timestamp,
            signal_type: signal_type.to_string(),
            name: format!("rsi_{}", self.period),
            reason: format!("{}-bar RSI at {}", self.period, value),
            raw_value: json!({
                "value": value.to_string(),
                "period": self.period,
                "overbought": self.overbought.to_string(),
                "oversold": self.oversold.to_string(),
            })
            .to_string(),
            symbol: bar.symbol.clone(),
            indicator_type: "rsi".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::IndicatorRegistry;
    use duckdb::{params, Connection};
    use rust_decimal_macros::dec;
    use std::path::Path;
    use tempfile::tempdir;
    use tw_data::DbTarget;
    use tw_types::EngineError;

    fn fixture_source(dir: &Path, closes: &[f64]) -> BarSource {
        let file = dir.join("bars.parquet");
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE fixture(time TIMESTAMP, symbol VARCHAR, open DOUBLE, \
             high DOUBLE, low DOUBLE, close DOUBLE, volume DOUBLE)",
        )
        .unwrap();
        for (i, close) in closes.iter().enumerate() {
            let time = format!("2024-01-{:02} 00:00:00", i + 1);
            conn.execute(
                "INSERT INTO fixture VALUES (?, 'AAPL', ?, ?, ?, ?, 1000)",
                params![time, close, close + 1.0, close - 1.0, close],
            )
            .unwrap();
        }
        conn.execute_batch(&format!(
            "COPY fixture TO '{}' (FORMAT PARQUET)",
            file.to_string_lossy()
        ))
        .unwrap();
        BarSource::open(&file, &DbTarget::Memory).unwrap()
    }

    fn last_bar(source: &BarSource) -> MarketData {
        let mut stream = source.stream(None, None);
        let mut last = None;
        while let Some(bar) = stream.next_bar().unwrap() {
            last = Some(bar);
        }
        last.unwrap()
    }

    #[test]
    fn test_sma_value() {
        let dir = tempdir().unwrap();
        let source = fixture_source(dir.path(), &[100.0, 101.0, 102.0, 103.0, 104.0]);
        let bar = last_bar(&source);

        let mut registry = IndicatorRegistry::with_defaults();
        registry.configure("sma", r#"{"period": 5}"#).unwrap();
        let signal = registry.get_signal("sma", &bar, &source).unwrap();

        assert_eq!(signal.name, "sma_5");
        // (100+101+102+103+104)/5 = 102; close 104 sits above it.
        assert_eq!(signal.signal_type, "above");
        let raw: serde_json::Value = serde_json::from_str(&signal.raw_value).unwrap();
        assert_eq!(raw["value"], "102");
    }

    #[test]
    fn test_sma_insufficient_history() {
        let dir = tempdir().unwrap();
        let source = fixture_source(dir.path(), &[100.0, 101.0]);
        let bar = last_bar(&source);

        let mut registry = IndicatorRegistry::with_defaults();
        registry.configure("sma", r#"{"period": 5}"#).unwrap();
        let result = registry.get_signal("sma", &bar, &source);
        assert!(matches!(
            result,
            Err(EngineError::Indicator(IndicatorError::InsufficientData { .. }))
        ));
    }

    #[test]
    fn test_ema_tracks_rising_prices() {
        let dir = tempdir().unwrap();
        let closes: Vec<f64> = (0..12).map(|i| 100.0 + i as f64).collect();
        let source = fixture_source(dir.path(), &closes);
        let bar = last_bar(&source);

        let mut registry = IndicatorRegistry::with_defaults();
        registry.configure("ema", r#"{"period": 4}"#).unwrap();
        let signal = registry.get_signal("ema", &bar, &source).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&signal.raw_value).unwrap();
        let value: Decimal = raw["value"].as_str().unwrap().parse().unwrap();
        // EMA lags a rising series, so the close sits above it.
        assert!(value < bar.close);
        assert!(value > dec!(100));
        assert_eq!(signal.signal_type, "above");
    }

    #[test]
    fn test_rsi_extremes() {
        let dir = tempdir().unwrap();
        let rising: Vec<f64> = (0..6).map(|i| 100.0 + i as f64).collect();
        let source = fixture_source(dir.path(), &rising);
        let bar = last_bar(&source);

        let mut registry = IndicatorRegistry::with_defaults();
        registry.configure("rsi", r#"{"period": 5}"#).unwrap();
        let signal = registry.get_signal("rsi", &bar, &source).unwrap();

        // All gains, no losses: RSI pegs at 100.
        assert_eq!(signal.signal_type, "overbought");
        let raw: serde_json::Value = serde_json::from_str(&signal.raw_value).unwrap();
        assert_eq!(raw["value"], "100");
    }

    #[test]
    fn test_rsi_rejects_crossed_thresholds() {
        let mut rsi = Rsi::default();
        let config = serde_json::json!({"period": 14, "overbought": 20, "oversold": 40});
        assert!(rsi.configure(&config).is_err());
    }
}
