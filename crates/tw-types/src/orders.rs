use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order identifier, assigned by the engine at submission time.
///
/// Sequential within a run so that repeated runs over the same inputs
/// produce byte-identical artifacts.
pub type OrderId = u64;

/// Direction of an order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order types supported by the simulated broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Whether an order opens/closes a long or a short exposure.
///
/// Short selling is not simulated; `Short` exists on the wire so that a
/// strategy submitting one gets a clean rejection instead of silent
/// misaccounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Long,
    Short,
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionType::Long => write!(f, "LONG"),
            PositionType::Short => write!(f, "SHORT"),
        }
    }
}

/// Order status during lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Why an order was placed (strategy-supplied) or refused (broker-supplied).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: String,
    pub message: String,
}

impl Reason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// An order as submitted by a strategy, before the engine assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOrder {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub strategy_name: String,
    pub reason: Reason,
    pub position_type: PositionType,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
}

impl ExecuteOrder {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        strategy_name: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price,
            strategy_name: strategy_name.into(),
            reason: Reason::default(),
            position_type: PositionType::Long,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        strategy_name: impl Into<String>,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            ..Self::market(symbol, side, quantity, price, strategy_name)
        }
    }

    pub fn with_reason(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Reason::new(code, message);
        self
    }
}

/// An order owned by the broker: submission fields plus engine-assigned
/// id, bar timestamp, lifecycle status and accrued fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub strategy_name: String,
    pub reason: Reason,
    pub position_type: PositionType,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub status: OrderStatus,
    pub fee: Decimal,
}

impl Order {
    pub fn from_submission(id: OrderId, timestamp: DateTime<Utc>, exec: ExecuteOrder) -> Self {
        Self {
            id,
            symbol: exec.symbol,
            side: exec.side,
            order_type: exec.order_type,
            quantity: exec.quantity,
            price: exec.price,
            strategy_name: exec.strategy_name,
            reason: exec.reason,
            position_type: exec.position_type,
            take_profit: exec.take_profit,
            stop_loss: exec.stop_loss,
            timestamp,
            status: OrderStatus::Pending,
            fee: Decimal::ZERO,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// Execution record, emitted only when an order reaches `Filled`.
///
/// `pnl` is the realized P&L of the matched outflow portion; unrealized
/// P&L never appears on a trade row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub order: Order,
    pub executed_at: DateTime<Utc>,
    pub executed_qty: Decimal,
    pub executed_price: Decimal,
    pub fee: Decimal,
    pub pnl: Decimal,
}

impl Trade {
    pub fn gross_amount(&self) -> Decimal {
        self.executed_qty * self.executed_price
    }
}

/// Filter accepted by the trade-history host call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeFilter {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl TradeFilter {
    pub fn matches(&self, trade: &Trade) -> bool {
        if let Some(symbol) = &self.symbol {
            if &trade.order.symbol != symbol {
                return false;
            }
        }
        if let Some(start) = self.start {
            if trade.executed_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if trade.executed_at > end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_submission_to_order() {
        let exec = ExecuteOrder::market("AAPL", Side::Buy, dec!(10), dec!(150), "demo")
            .with_reason("entry", "golden cross");
        let order = Order::from_submission(7, Utc::now(), exec);

        assert_eq!(order.id, 7);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.fee, Decimal::ZERO);
        assert_eq!(order.reason.code, "entry");
        assert!(!order.is_completed());
    }

    #[test]
    fn test_limit_constructor() {
        let exec = ExecuteOrder::limit("AAPL", Side::Sell, dec!(1), dec!(155), "demo");
        assert_eq!(exec.order_type, OrderType::Limit);
        assert_eq!(exec.position_type, PositionType::Long);
        assert!(exec.take_profit.is_none());
    }

    #[test]
    fn test_trade_filter() {
        let order = Order::from_submission(
            1,
            Utc::now(),
            ExecuteOrder::market("AAPL", Side::Buy, dec!(1), dec!(100), "demo"),
        );
        let trade = Trade {
            executed_at: order.timestamp,
            executed_qty: dec!(1),
            executed_price: dec!(100),
            fee: Decimal::ZERO,
            pnl: Decimal::ZERO,
            order,
        };

        assert!(TradeFilter::default().matches(&trade));
        let filter = TradeFilter {
            symbol: Some("MSFT".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&trade));
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }
}
