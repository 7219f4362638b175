use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};
use tw_types::{MarketData, SetupError, StrategyError};

use crate::api::Host;
use crate::codec::{decode_frame, encode_frame, CodecError, DEFAULT_MAX_FRAME_LEN};
use crate::module::{StrategyModule, TRADING_STRATEGY_API_VERSION};

/// Wraps a loaded strategy module with the boundary discipline: version
/// handshake at load, bar payloads passed by value through the frame
/// codec, panics contained as strategy errors.
pub struct StrategyRuntime {
    module: Box<dyn StrategyModule>,
    max_frame_len: usize,
}

impl StrategyRuntime {
    pub fn load(module: Box<dyn StrategyModule>) -> Result<Self, SetupError> {
        let version = module.trading_strategy_api_version();
        if version != TRADING_STRATEGY_API_VERSION {
            return Err(SetupError::ApiVersionMismatch {
                host: TRADING_STRATEGY_API_VERSION,
                module: version,
            });
        }
        debug!(identifier = %module.get_identifier(), "strategy module loaded");
        Ok(Self {
            module,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    pub fn with_frame_limit(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn name(&self) -> String {
        self.module.name()
    }

    pub fn identifier(&self) -> String {
        self.module.get_identifier()
    }

    pub fn description(&self) -> String {
        self.module.get_description()
    }

    pub fn config_schema(&self) -> String {
        self.module.get_config_schema()
    }

    pub fn initialize(&mut self, config_yaml: &str) -> Result<(), StrategyError> {
        let module = &mut self.module;
        let result = catch_unwind(AssertUnwindSafe(|| module.initialize(config_yaml)));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StrategyError::Initialization { message }),
            Err(panic) => Err(StrategyError::Trap {
                message: panic_message(panic),
            }),
        }
    }

    /// Drive one bar through the module.
    ///
    /// The bar is serialized and re-decoded so the module only ever sees
    /// its own copy; an oversized payload maps to the memory-limit error.
    pub fn process_data(
        &mut self,
        bar: &MarketData,
        host: &mut dyn Host,
    ) -> Result<(), StrategyError> {
        let frame = encode_frame(bar, self.max_frame_len).map_err(|e| frame_error(e, self.max_frame_len))?;
        let (guest_bar, _): (MarketData, usize) =
            decode_frame(&frame, self.max_frame_len).map_err(|e| frame_error(e, self.max_frame_len))?;

        let module = &mut self.module;
        let result = catch_unwind(AssertUnwindSafe(|| module.process_data(&guest_bar, host)));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StrategyError::Execution { message }),
            Err(panic) => {
                let message = panic_message(panic);
                warn!(%message, "strategy module trapped");
                Err(StrategyError::Trap { message })
            }
        }
    }
}

fn frame_error(error: CodecError, max_frame_len: usize) -> StrategyError {
    match error {
        CodecError::TooLarge { .. } => StrategyError::MemoryLimit {
            limit_bytes: max_frame_len,
        },
        other => StrategyError::Execution {
            message: other.to_string(),
        },
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Noop;

    impl StrategyModule for Noop {
        fn initialize(&mut self, _config_yaml: &str) -> Result<(), String> {
            Ok(())
        }

        fn process_data(&mut self, _bar: &MarketData, _host: &mut dyn Host) -> Result<(), String> {
            Ok(())
        }

        fn name(&self) -> String {
            "Noop".to_string()
        }

        fn get_identifier(&self) -> String {
            "noop".to_string()
        }
    }

    struct WrongVersion;

    impl StrategyModule for WrongVersion {
        fn trading_strategy_api_version(&self) -> u32 {
            99
        }

        fn initialize(&mut self, _config_yaml: &str) -> Result<(), String> {
            Ok(())
        }

        fn process_data(&mut self, _bar: &MarketData, _host: &mut dyn Host) -> Result<(), String> {
            Ok(())
        }

        fn name(&self) -> String {
            "WrongVersion".to_string()
        }

        fn get_identifier(&self) -> String {
            "wrong-version".to_string()
        }
    }

    struct Panicky;

    impl StrategyModule for Panicky {
        fn initialize(&mut self, _config_yaml: &str) -> Result<(), String> {
            Ok(())
        }

        fn process_data(&mut self, _bar: &MarketData, _host: &mut dyn Host) -> Result<(), String> {
            panic!("boom");
        }

        fn name(&self) -> String {
            "Panicky".to_string()
        }

        fn get_identifier(&self) -> String {
            "panicky".to_string()
        }
    }

    struct NullHost;

    impl crate::api::Host for NullHost {
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
            _json_config: &str,
        ) -> crate::api::HostResult<()> {
            Ok(())
        }
        fn get_signal(
            &mut self,
            _kind: &str,
            _bar: &MarketData,
        ) -> crate::api::HostResult<tw_indicators::Signal> {
            Err(crate::api::HostError::new("unknown_indicator", "none"))
        }
        fn get_cache(&mut self, _key: &str) -> crate::api::HostResult<Option<String>> {
            Ok(None)
        }
        fn set_cache(&mut self, _key: &str, _value: &str) -> crate::api::HostResult<()> {
            Ok(())
        }
        fn place_order(
            &mut self,
            _order: tw_types::ExecuteOrder,
        ) -> crate::api::HostResult<tw_types::OrderId> {
            Ok(1)
        }
        fn place_multiple_orders(
            &mut self,
            orders: Vec<tw_types::ExecuteOrder>,
        ) -> crate::api::HostResult<Vec<tw_types::OrderId>> {
            Ok((1..=orders.len() as u64).collect())
        }
        fn cancel_order(&mut self, _id: tw_types::OrderId) -> crate::api::HostResult<()> {
            Ok(())
        }
        fn cancel_all_orders(&mut self) -> crate::api::HostResult<u32> {
            Ok(0)
        }
        fn get_order_status(
            &mut self,
            _id: tw_types::OrderId,
        ) -> crate::api::HostResult<tw_types::OrderStatus> {
            Ok(tw_types::OrderStatus::Pending)
        }
        fn get_position(
            &mut self,
            _symbol: &str,
        ) -> crate::api::HostResult<Option<tw_types::Position>> {
            Ok(None)
        }
        fn get_positions(&mut self) -> crate::api::HostResult<Vec<tw_types::Position>> {
            Ok(Vec::new())
        }
        fn get_open_orders(&mut self) -> crate::api::HostResult<Vec<tw_types::Order>> {
            Ok(Vec::new())
        }
        fn get_trades(
            &mut self,
            _filter: tw_types::TradeFilter,
        ) -> crate::api::HostResult<Vec<tw_types::Trade>> {
            Ok(Vec::new())
        }
        fn get_account_info(&mut self) -> crate::api::HostResult<crate::api::AccountInfo> {
            Ok(crate::api::AccountInfo {
                balance: dec!(0),
                equity: dec!(0),
                buying_power: dec!(0),
                realized_pnl: dec!(0),
                unrealized_pnl: dec!(0),
                total_fees: dec!(0),
                margin_used: dec!(0),
            })
        }
        fn get_max_buy_quantity(
            &mut self,
            _symbol: &str,
            _price: rust_decimal::Decimal,
        ) -> crate::api::HostResult<rust_decimal::Decimal> {
            Ok(dec!(0))
        }
        fn get_max_sell_quantity(
            &mut self,
            _symbol: &str,
        ) -> crate::api::HostResult<rust_decimal::Decimal> {
            Ok(dec!(0))
        }
        fn mark(
            &mut self,
            _bar: &MarketData,
            _spec: tw_types::MarkSpec,
        ) -> crate::api::HostResult<()> {
            Ok(())
        }
        fn log(
            &mut self,
            _level: tw_types::LogLevel,
            _message: &str,
            _fields: std::collections::BTreeMap<String, String>,
        ) -> crate::api::HostResult<()> {
            Ok(())
        }
    }

    fn bar() -> MarketData {
        MarketData::new(
            "AAPL",
            Utc::now(),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100),
            dec!(1000),
        )
    }

    #[test]
    fn test_version_handshake() {
        assert!(StrategyRuntime::load(Box::new(Noop)).is_ok());
        let result = StrategyRuntime::load(Box::new(WrongVersion));
        assert!(matches!(
            result,
            Err(SetupError::ApiVersionMismatch { host: 1, module: 99 })
        ));
    }

    #[test]
    fn test_panic_becomes_trap() {
        let mut runtime = StrategyRuntime::load(Box::new(Panicky)).unwrap();
        let mut host = NullHost;
        let result = runtime.process_data(&bar(), &mut host);
        assert!(matches!(result, Err(StrategyError::Trap { message }) if message == "boom"));
    }

    #[test]
    fn test_process_data_passes_bar_through_codec() {
        struct Checker;
        impl StrategyModule for Checker {
            fn initialize(&mut self, _config_yaml: &str) -> Result<(), String> {
                Ok(())
            }
            fn process_data(
                &mut self,
                bar: &MarketData,
                _host: &mut dyn Host,
            ) -> Result<(), String> {
                if bar.symbol == "AAPL" {
                    Ok(())
                } else {
                    Err("wrong bar".to_string())
                }
            }
            fn name(&self) -> String {
                "Checker".to_string()
            }
            fn get_identifier(&self) -> String {
                "checker".to_string()
            }
        }

        let mut runtime = StrategyRuntime::load(Box::new(Checker)).unwrap();
        let mut host = NullHost;
        assert!(runtime.process_data(&bar(), &mut host).is_ok());
    }

    #[test]
    fn test_tiny_frame_limit_hits_memory_cap() {
        let mut runtime = StrategyRuntime::load(Box::new(Noop)).unwrap().with_frame_limit(8);
        let mut host = NullHost;
        let result = runtime.process_data(&bar(), &mut host);
        assert!(matches!(result, Err(StrategyError::MemoryLimit { .. })));
    }
}
