use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tw_indicators::Signal;
use tw_types::{
    EngineError, ExecuteOrder, IndicatorError, Interval, LogLevel, MarkSpec, MarketData, Order,
    OrderId, OrderStatus, Position, Trade, TradeFilter,
};

/// Error handed back to a strategy when a host call fails.
///
/// Host-side failures never unwind into the module; they come back as a
/// stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct HostError {
    pub code: String,
    pub message: String,
}

impl HostError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn budget_exhausted() -> Self {
        Self::new("call_budget_exhausted", "per-bar host call budget exhausted")
    }

    pub fn from_engine(error: &EngineError) -> Self {
        match error {
            EngineError::Order(e) => Self::new(e.reason_code(), e.to_string()),
            EngineError::Indicator(e) => {
                let code = match e {
                    IndicatorError::UnknownKind { .. } => "unknown_indicator",
                    IndicatorError::InvalidConfig { .. } => "invalid_indicator_config",
                    IndicatorError::InsufficientData { .. } => "insufficient_data",
                };
                Self::new(code, e.to_string())
            }
            EngineError::Data(e) => Self::new("data_error", e.to_string()),
            other => Self::new("internal_error", other.to_string()),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// Range query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRangeRequest {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub interval: Option<Interval>,
}

/// Parameterized SQL over the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRequest {
    pub query: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlResponse {
    pub rows: Vec<Vec<String>>,
}

/// Account snapshot crossing the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    /// In backtest this is the max affordable number of whole shares at
    /// the most recent close, not a dollar amount. Live trading reports
    /// dollars; use `get_max_buy_quantity` for a unit-stable accessor.
    pub buying_power: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_fees: Decimal,
    pub margin_used: Decimal,
}

/// Capability surface a strategy may call during `process_data`.
///
/// Calls are synchronous and observed in call order; fills of orders
/// submitted during the current bar are only visible from the next bar.
pub trait Host {
    fn get_range(&mut self, req: GetRangeRequest) -> HostResult<Vec<MarketData>>;

    /// Most recent bar at or before the current bar timestamp.
    fn read_last_data(&mut self, symbol: &str) -> HostResult<Option<MarketData>>;

    fn execute_sql(&mut self, req: SqlRequest) -> HostResult<SqlResponse>;

    fn count(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> HostResult<u64>;

    fn configure_indicator(&mut self, kind: &str, json_config: &str) -> HostResult<()>;

    fn get_signal(&mut self, kind: &str, bar: &MarketData) -> HostResult<Signal>;

    fn get_cache(&mut self, key: &str) -> HostResult<Option<String>>;

    fn set_cache(&mut self, key: &str, value: &str) -> HostResult<()>;

    fn place_order(&mut self, order: ExecuteOrder) -> HostResult<OrderId>;

    /// All-or-nothing validation; fills remain independent per order.
    fn place_multiple_orders(&mut self, orders: Vec<ExecuteOrder>) -> HostResult<Vec<OrderId>>;

    fn cancel_order(&mut self, id: OrderId) -> HostResult<()>;

    fn cancel_all_orders(&mut self) -> HostResult<u32>;

    fn get_order_status(&mut self, id: OrderId) -> HostResult<OrderStatus>;

    fn get_position(&mut self, symbol: &str) -> HostResult<Option<Position>>;

    fn get_positions(&mut self) -> HostResult<Vec<Position>>;

    fn get_open_orders(&mut self) -> HostResult<Vec<Order>>;

    fn get_trades(&mut self, filter: TradeFilter) -> HostResult<Vec<Trade>>;

    fn get_account_info(&mut self) -> HostResult<AccountInfo>;

    fn get_max_buy_quantity(&mut self, symbol: &str, price: Decimal) -> HostResult<Decimal>;

    fn get_max_sell_quantity(&mut self, symbol: &str) -> HostResult<Decimal>;

    fn mark(&mut self, bar: &MarketData, spec: MarkSpec) -> HostResult<()>;

    fn log(
        &mut self,
        level: LogLevel,
        message: &str,
        fields: BTreeMap<String, String>,
    ) -> HostResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::OrderError;

    #[test]
    fn test_order_errors_keep_reason_codes() {
        let error = EngineError::Order(OrderError::InsufficientBuyingPower);
        let host_error = HostError::from_engine(&error);
        assert_eq!(host_error.code, "insufficient_buying_power");
    }

    #[test]
    fn test_indicator_error_codes() {
        let error = EngineError::Indicator(IndicatorError::InsufficientData { needed: 20, got: 3 });
        assert_eq!(HostError::from_engine(&error).code, "insufficient_data");

        let error = EngineError::Indicator(IndicatorError::UnknownKind {
            kind: "vwap".to_string(),
        });
        assert_eq!(HostError::from_engine(&error).code, "unknown_indicator");
    }

    #[test]
    fn test_budget_code() {
        assert_eq!(HostError::budget_exhausted().code, "call_budget_exhausted");
    }
}
