use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use tw_types::{
    ExecuteOrder, LogLevel, MarkColor, MarkLevel, MarkShape, MarkSpec, MarketData, SetupError,
    Side,
};

use crate::api::{Host, HostError};
use crate::module::StrategyModule;

fn host_err(error: HostError) -> String {
    error.to_string()
}

fn signal_value(raw_value: &str) -> Result<Decimal, String> {
    let raw: serde_json::Value =
        serde_json::from_str(raw_value).map_err(|e| format!("bad signal payload: {}", e))?;
    raw.get("value")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "signal payload missing value".to_string())?
        .parse()
        .map_err(|e| format!("bad signal value: {}", e))
}

/// Buys once with everything affordable, then holds.
pub struct BuyAndHold {
    symbol: Option<String>,
    entered: bool,
}

#[derive(Debug, Default, Deserialize)]
struct BuyAndHoldConfig {
    #[serde(default)]
    symbol: Option<String>,
}

impl BuyAndHold {
    pub fn new() -> Self {
        Self {
            symbol: None,
            entered: false,
        }
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Box<dyn StrategyModule>, SetupError> {
        let config: BuyAndHoldConfig = if params.is_null() {
            BuyAndHoldConfig::default()
        } else {
            serde_json::from_value(params.clone()).map_err(|e| SetupError::StrategyLoad {
                message: format!("buy-and-hold params: {}", e),
            })?
        };
        Ok(Box::new(Self {
            symbol: config.symbol,
            entered: false,
        }))
    }
}

impl Default for BuyAndHold {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyModule for BuyAndHold {
    fn initialize(&mut self, config_yaml: &str) -> Result<(), String> {
        if config_yaml.trim().is_empty() {
            return Ok(());
        }
        let config: BuyAndHoldConfig =
            serde_yaml::from_str(config_yaml).map_err(|e| e.to_string())?;
        if config.symbol.is_some() {
            self.symbol = config.symbol;
        }
        Ok(())
    }

    fn process_data(&mut self, bar: &MarketData, host: &mut dyn Host) -> Result<(), String> {
        if self.entered {
            return Ok(());
        }
        if let Some(symbol) = &self.symbol {
            if symbol != &bar.symbol {
                return Ok(());
            }
        }

        let quantity = host
            .get_max_buy_quantity(&bar.symbol, bar.close)
            .map_err(host_err)?;
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        let order = ExecuteOrder::market(&bar.symbol, Side::Buy, quantity, bar.close, self.name())
            .with_reason("entry", "initial position");
        host.place_order(order).map_err(host_err)?;
        host.set_cache("entry_price", &bar.close.to_string())
            .map_err(host_err)?;
        host.mark(
            bar,
            MarkSpec {
                color: MarkColor::Green,
                shape: MarkShape::Circle,
                level: MarkLevel::Info,
                title: "Entry".to_string(),
                message: format!("bought {} {} at {}", quantity, bar.symbol, bar.close),
                category: "entry".to_string(),
                signal: None,
            },
        )
        .map_err(host_err)?;

        let mut fields = BTreeMap::new();
        fields.insert("quantity".to_string(), quantity.to_string());
        fields.insert("price".to_string(), bar.close.to_string());
        host.log(LogLevel::Info, "opened initial position", fields)
            .map_err(host_err)?;

        self.entered = true;
        Ok(())
    }

    fn name(&self) -> String {
        "Buy and Hold".to_string()
    }

    fn get_identifier(&self) -> String {
        "buy-and-hold".to_string()
    }

    fn get_description(&self) -> String {
        "Buys everything affordable on the first bar and holds to the end".to_string()
    }

    fn get_config_schema(&self) -> String {
        r#"{"type":"object","properties":{"symbol":{"type":"string"}}}"#.to_string()
    }
}

/// Golden/death cross over two simple moving averages.
///
/// Keeps its previous fast/slow relation in the run cache so crossovers
/// survive any engine-side re-instantiation.
pub struct SmaCross {
    short_period: usize,
    long_period: usize,
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmaCrossConfig {
    #[serde(default = "SmaCrossConfig::default_short")]
    short_period: usize,
    #[serde(default = "SmaCrossConfig::default_long")]
    long_period: usize,
    #[serde(default)]
    symbol: Option<String>,
}

impl SmaCrossConfig {
    fn default_short() -> usize {
        10
    }

    fn default_long() -> usize {
        30
    }
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            short_period: Self::default_short(),
            long_period: Self::default_long(),
            symbol: None,
        }
    }
}

impl SmaCross {
    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self {
            short_period,
            long_period,
            symbol: None,
        }
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Box<dyn StrategyModule>, SetupError> {
        let config: SmaCrossConfig = if params.is_null() {
            SmaCrossConfig::default()
        } else {
            serde_json::from_value(params.clone()).map_err(|e| SetupError::StrategyLoad {
                message: format!("sma-cross params: {}", e),
            })?
        };
        if config.short_period >= config.long_period {
            return Err(SetupError::StrategyLoad {
                message: format!(
                    "short_period {} must be below long_period {}",
                    config.short_period, config.long_period
                ),
            });
        }
        Ok(Box::new(Self {
            short_period: config.short_period,
            long_period: config.long_period,
            symbol: config.symbol,
        }))
    }

    fn sma_at(&self, host: &mut dyn Host, bar: &MarketData, period: usize) -> Result<Option<Decimal>, String> {
        host.configure_indicator("sma", &format!(r#"{{"period": {}}}"#, period))
            .map_err(host_err)?;
        match host.get_signal("sma", bar) {
            Ok(signal) => Ok(Some(signal_value(&signal.raw_value)?)),
            // Warm-up bars simply have no average yet.
            Err(error) if error.code == "insufficient_data" => Ok(None),
            Err(error) => Err(host_err(error)),
        }
    }
}

impl StrategyModule for SmaCross {
    fn initialize(&mut self, config_yaml: &str) -> Result<(), String> {
        if !config_yaml.trim().is_empty() {
            let config: SmaCrossConfig =
                serde_yaml::from_str(config_yaml).map_err(|e| e.to_string())?;
            self.short_period = config.short_period;
            self.long_period = config.long_period;
            if config.symbol.is_some() {
                self.symbol = config.symbol;
            }
        }
        if self.short_period >= self.long_period {
            return Err(format!(
                "short_period {} must be below long_period {}",
                self.short_period, self.long_period
            ));
        }
        Ok(())
    }

    fn process_data(&mut self, bar: &MarketData, host: &mut dyn Host) -> Result<(), String> {
        if let Some(symbol) = &self.symbol {
            if symbol != &bar.symbol {
                return Ok(());
            }
        }

        let (Some(short), Some(long)) = (
            self.sma_at(host, bar, self.short_period)?,
            self.sma_at(host, bar, self.long_period)?,
        ) else {
            return Ok(());
        };

        let relation = if short > long { "above" } else { "below" };
        let state_key = format!("sma_cross:{}", bar.symbol);
        let previous = host.get_cache(&state_key).map_err(host_err)?;
        host.set_cache(&state_key, relation).map_err(host_err)?;

        let Some(previous) = previous else {
            return Ok(());
        };
        if previous == relation {
            return Ok(());
        }

        let mut fields = BTreeMap::new();
        fields.insert("short".to_string(), short.to_string());
        fields.insert("long".to_string(), long.to_string());

        if relation == "above" {
            let quantity = host
                .get_max_buy_quantity(&bar.symbol, bar.close)
                .map_err(host_err)?;
            if quantity <= Decimal::ZERO {
                return Ok(());
            }
            let order =
                ExecuteOrder::market(&bar.symbol, Side::Buy, quantity, bar.close, self.name())
                    .with_reason("golden_cross", "fast average crossed above slow");
            host.place_order(order).map_err(host_err)?;
            host.mark(
                bar,
                MarkSpec {
                    color: MarkColor::Green,
                    shape: MarkShape::Triangle,
                    level: MarkLevel::Info,
                    title: "Golden cross".to_string(),
                    message: format!("sma{} crossed above sma{}", self.short_period, self.long_period),
                    category: "crossover".to_string(),
                    signal: None,
                },
            )
            .map_err(host_err)?;
            host.log(LogLevel::Info, "golden cross entry", fields)
                .map_err(host_err)?;
        } else {
            let held = host
                .get_max_sell_quantity(&bar.symbol)
                .map_err(host_err)?;
            if held <= Decimal::ZERO {
                return Ok(());
            }
            let order = ExecuteOrder::market(&bar.symbol, Side::Sell, held, bar.close, self.name())
                .with_reason("death_cross", "fast average crossed below slow");
            host.place_order(order).map_err(host_err)?;
            host.mark(
                bar,
                MarkSpec {
                    color: MarkColor::Red,
                    shape: MarkShape::Triangle,
                    level: MarkLevel::Info,
                    title: "Death cross".to_string(),
                    message: format!("sma{} crossed below sma{}", self.short_period, self.long_period),
                    category: "crossover".to_string(),
                    signal: None,
                },
            )
            .map_err(host_err)?;
            host.log(LogLevel::Info, "death cross exit", fields)
                .map_err(host_err)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        "SMA Crossover".to_string()
    }

    fn get_identifier(&self) -> String {
        "sma-cross".to_string()
    }

    fn get_description(&self) -> String {
        "Long on golden cross, flat on death cross".to_string()
    }

    fn get_config_schema(&self) -> String {
        r#"{"type":"object","properties":{"short_period":{"type":"integer","minimum":2},"long_period":{"type":"integer","minimum":3},"symbol":{"type":"string"}}}"#.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tw_indicators::Signal;
    use tw_types::{Order, OrderId, OrderStatus, Position, Trade, TradeFilter};

    /// Scripted host: preset signal values, recorded side effects.
    #[derive(Default)]
    struct ScriptedHost {
        sma_values: HashMap<usize, Decimal>,
        configured_period: usize,
        cache: HashMap<String, String>,
        placed: Vec<ExecuteOrder>,
        marks: Vec<MarkSpec>,
        logs: Vec<String>,
        max_buy: Decimal,
        max_sell: Decimal,
    }

    impl Host for ScriptedHost {
        fn get_range(
            &mut self,
            _req: crate::api::GetRangeRequest,
        ) -> crate::api::HostResult<Vec<MarketData>> {
            Ok(Vec::new())
        }
        fn read_last_data(&mut self, _symbol: &str) -> crate::api::HostResult<Option<MarketData>> {
            Ok(None)
        }
        fn execute_sql(
            &mut self,
            _req: crate::api::SqlRequest,
        ) -> crate::api::HostResult<crate::api::SqlResponse> {
            Ok(crate::api::SqlResponse { rows: Vec::new() })
        }
        fn count(
            &mut self,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> crate::api::HostResult<u64> {
            Ok(0)
        }
        fn configure_indicator(
            &mut self,
            _kind: &str,
            json_config: &str,
        ) -> crate::api::HostResult<()> {
            let config: serde_json::Value = serde_json::from_str(json_config).unwrap();
            self.configured_period = config["period"].as_u64().unwrap() as usize;
            Ok(())
        }
        fn get_signal(&mut self, _kind: &str, bar: &MarketData) -> crate::api::HostResult<Signal> {
            match self.sma_values.get(&self.configured_period) {
                Some(value) => Ok(Signal {
                    timestamp: bar.timestamp,
                    signal_type: "value".to_string(),
                    name: format!("sma_{}", self.configured_period),
                    reason: String::new(),
                    raw_value: serde_json::json!({"value": value.to_string()}).to_string(),
                    symbol: bar.symbol.clone(),
                    indicator_type: "sma".to_string(),
                }),
                None => Err(HostError::new("insufficient_data", "warm-up")),
            }
        }
        fn get_cache(&mut self, key: &str) -> crate::api::HostResult<Option<String>> {
            Ok(self.cache.get(key).cloned())
        }
        fn set_cache(&mut self, key: &str, value: &str) -> crate::api::HostResult<()> {
            self.cache.insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn place_order(&mut self, order: ExecuteOrder) -> crate::api::HostResult<OrderId> {
            self.placed.push(order);
            Ok(self.placed.len() as OrderId)
        }
        fn place_multiple_orders(
            &mut self,
            orders: Vec<ExecuteOrder>,
        ) -> crate::api::HostResult<Vec<OrderId>> {
            let mut ids = Vec::new();
            for order in orders {
                ids.push(self.place_order(order)?);
            }
            Ok(ids)
        }
        fn cancel_order(&mut self, _id: OrderId) -> crate::api::HostResult<()> {
            Ok(())
        }
        fn cancel_all_orders(&mut self) -> crate::api::HostResult<u32> {
            Ok(0)
        }
        fn get_order_status(&mut self, _id: OrderId) -> crate::api::HostResult<OrderStatus> {
            Ok(OrderStatus::Filled)
        }
        fn get_position(&mut self, _symbol: &str) -> crate::api::HostResult<Option<Position>> {
            Ok(None)
        }
        fn get_positions(&mut self) -> crate::api::HostResult<Vec<Position>> {
            Ok(Vec::new())
        }
        fn get_open_orders(&mut self) -> crate::api::HostResult<Vec<Order>> {
            Ok(Vec::new())
        }
        fn get_trades(&mut self, _filter: TradeFilter) -> crate::api::HostResult<Vec<Trade>> {
            Ok(Vec::new())
        }
        fn get_account_info(&mut self) -> crate::api::HostResult<crate::api::AccountInfo> {
            Ok(crate::api::AccountInfo {
                balance: dec!(10000),
                equity: dec!(10000),
                buying_power: dec!(100),
                realized_pnl: dec!(0),
                unrealized_pnl: dec!(0),
                total_fees: dec!(0),
                margin_used: dec!(0),
            })
        }
        fn get_max_buy_quantity(
            &mut self,
            _symbol: &str,
            _price: Decimal,
        ) -> crate::api::HostResult<Decimal> {
            Ok(self.max_buy)
        }
        fn get_max_sell_quantity(&mut self, _symbol: &str) -> crate::api::HostResult<Decimal> {
            Ok(self.max_sell)
        }
        fn mark(&mut self, _bar: &MarketData, spec: MarkSpec) -> crate::api::HostResult<()> {
            self.marks.push(spec);
            Ok(())
        }
        fn log(
            &mut self,
            _level: LogLevel,
            message: &str,
            _fields: BTreeMap<String, String>,
        ) -> crate::api::HostResult<()> {
            self.logs.push(message.to_string());
            Ok(())
        }
    }

    fn bar(close: Decimal) -> MarketData {
        MarketData::new("AAPL", Utc::now(), close, close, close, close, dec!(1000))
    }

    #[test]
    fn test_buy_and_hold_enters_once() {
        let mut strategy = BuyAndHold::new();
        strategy.initialize("").unwrap();

        let mut host = ScriptedHost {
            max_buy: dec!(66),
            ..Default::default()
        };
        strategy.process_data(&bar(dec!(150)), &mut host).unwrap();
        strategy.process_data(&bar(dec!(151)), &mut host).unwrap();

        assert_eq!(host.placed.len(), 1);
        assert_eq!(host.placed[0].quantity, dec!(66));
        assert_eq!(host.placed[0].side, Side::Buy);
        assert_eq!(host.marks.len(), 1);
        assert_eq!(host.cache.get("entry_price").unwrap(), "150");
    }

    #[test]
    fn test_buy_and_hold_skips_other_symbols() {
        let mut strategy = BuyAndHold::new();
        strategy.initialize("symbol: MSFT\n").unwrap();

        let mut host = ScriptedHost {
            max_buy: dec!(10),
            ..Default::default()
        };
        strategy.process_data(&bar(dec!(150)), &mut host).unwrap();
        assert!(host.placed.is_empty());
    }

    #[test]
    fn test_sma_cross_golden_then_death() {
        let mut strategy = SmaCross::new(10, 30);
        strategy.initialize("").unwrap();

        let mut host = ScriptedHost {
            max_buy: dec!(50),
            max_sell: dec!(50),
            ..Default::default()
        };

        // Bar 1: fast below slow establishes state, no order.
        host.sma_values = HashMap::from([(10, dec!(99)), (30, dec!(100))]);
        strategy.process_data(&bar(dec!(100)), &mut host).unwrap();
        assert!(host.placed.is_empty());

        // Bar 2: fast crosses above slow -> buy.
        host.sma_values = HashMap::from([(10, dec!(102)), (30, dec!(100))]);
        strategy.process_data(&bar(dec!(103)), &mut host).unwrap();
        assert_eq!(host.placed.len(), 1);
        assert_eq!(host.placed[0].side, Side::Buy);
        assert_eq!(host.placed[0].reason.code, "golden_cross");

        // Bar 3: unchanged relation, no churn.
        host.sma_values = HashMap::from([(10, dec!(104)), (30, dec!(101))]);
        strategy.process_data(&bar(dec!(105)), &mut host).unwrap();
        assert_eq!(host.placed.len(), 1);

        // Bar 4: fast drops below slow -> sell everything held.
        host.sma_values = HashMap::from([(10, dec!(98)), (30, dec!(101))]);
        strategy.process_data(&bar(dec!(97)), &mut host).unwrap();
        assert_eq!(host.placed.len(), 2);
        assert_eq!(host.placed[1].side, Side::Sell);
        assert_eq!(host.placed[1].reason.code, "death_cross");
        assert_eq!(host.marks.len(), 2);
    }

    #[test]
    fn test_sma_cross_waits_out_warmup() {
        let mut strategy = SmaCross::new(10, 30);
        strategy.initialize("").unwrap();

        let mut host = ScriptedHost::default(); // no signal values: warm-up
        strategy.process_data(&bar(dec!(100)), &mut host).unwrap();
        assert!(host.placed.is_empty());
        assert!(host.cache.is_empty());
    }

    #[test]
    fn test_sma_cross_rejects_bad_periods() {
        let mut strategy = SmaCross::new(30, 10);
        assert!(strategy.initialize("").is_err());
        assert!(SmaCross::from_params(&serde_json::json!({"short_period": 30, "long_period": 10})).is_err());
    }
}
