use std::collections::HashMap;

use tracing::debug;
use tw_data::BarSource;
use tw_types::{EngineResult, IndicatorError, MarketData};

use crate::builtin::{Ema, Rsi, Sma};
use crate::signal::Signal;

/// A pluggable signal transformer.
///
/// Implementations are configured once per run (JSON config) and evaluated
/// against individual bars; any history they need comes from the data
/// source, never from engine internals.
pub trait Indicator: Send {
    fn configure(&mut self, config: &serde_json::Value) -> Result<(), IndicatorError>;

    fn evaluate(&self, bar: &MarketData, source: &BarSource) -> EngineResult<Signal>;
}

struct Entry {
    indicator: Box<dyn Indicator>,
    config_digest: String,
}

/// Per-run registry of indicators keyed by kind string.
///
/// Signals are memoized per (kind, config, symbol, timestamp); the memo is
/// part of the current configuration, so reconfiguring an indicator never
/// serves stale values.
pub struct IndicatorRegistry {
    indicators: HashMap<String, Entry>,
    memo: HashMap<(String, String, String, i64), Signal>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self {
            indicators: HashMap::new(),
            memo: HashMap::new(),
        }
    }

    /// Registry with the built-in transformers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sma", Box::new(Sma::default()));
        registry.register("ema", Box::new(Ema::default()));
        registry.register("rsi", Box::new(Rsi::default()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, indicator: Box<dyn Indicator>) {
        self.indicators.insert(
            kind.into(),
            Entry {
                indicator,
                config_digest: "{}".to_string(),
            },
        );
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.indicators.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Install a JSON config on one indicator.
    pub fn configure(&mut self, kind: &str, config_json: &str) -> EngineResult<()> {
        let entry = self
            .indicators
            .get_mut(kind)
            .ok_or_else(|| IndicatorError::UnknownKind {
                kind: kind.to_string(),
            })?;
        let config: serde_json::Value =
            serde_json::from_str(config_json).map_err(|e| IndicatorError::InvalidConfig {
                message: e.to_string(),
            })?;
        entry.indicator.configure(&config)?;
        entry.config_digest = config.to_string();
        debug!(kind, config = %entry.config_digest, "configured indicator");
        Ok(())
    }

    /// Evaluate (or recall) the signal for `kind` at this bar.
    pub fn get_signal(
        &mut self,
        kind: &str,
        bar: &MarketData,
        source: &BarSource,
    ) -> EngineResult<Signal> {
        let entry = self
            .indicators
            .get(kind)
            .ok_or_else(|| IndicatorError::UnknownKind {
                kind: kind.to_string(),
            })?;

        let key = (
            kind.to_string(),
            entry.config_digest.clone(),
            bar.symbol.clone(),
            bar.timestamp.timestamp_micros(),
        );
        if let Some(signal) = self.memo.get(&key) {
            return Ok(signal.clone());
        }

        let signal = entry.indicator.evaluate(bar, source)?;
        self.memo.insert(key, signal.clone());
        Ok(signal)
    }

    /// Drop memoized signals; called between runs.
    pub fn reset(&mut self) {
        self.memo.clear();
    }
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
