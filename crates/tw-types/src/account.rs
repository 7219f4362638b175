use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate long position for one symbol.
///
/// Inflows and outflows are tracked separately so realized P&L can be
/// computed against the average inflow cost. A position row exists iff
/// `qty() > 0`; when it returns to zero the ledger clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub total_long_in_qty: Decimal,
    pub total_long_out_qty: Decimal,
    pub total_long_in_amount: Decimal,
    pub total_long_out_amount: Decimal,
    pub total_long_in_fee: Decimal,
    pub total_long_out_fee: Decimal,
    pub open_timestamp: DateTime<Utc>,
    pub strategy_name: String,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        strategy_name: impl Into<String>,
        open_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            total_long_in_qty: Decimal::ZERO,
            total_long_out_qty: Decimal::ZERO,
            total_long_in_amount: Decimal::ZERO,
            total_long_out_amount: Decimal::ZERO,
            total_long_in_fee: Decimal::ZERO,
            total_long_out_fee: Decimal::ZERO,
            open_timestamp,
            strategy_name: strategy_name.into(),
        }
    }

    /// Currently held quantity: inflows minus outflows.
    pub fn qty(&self) -> Decimal {
        self.total_long_in_qty - self.total_long_out_qty
    }

    /// Average cost of the inflow side; zero while nothing has been bought.
    pub fn avg_cost(&self) -> Decimal {
        if self.total_long_in_qty.is_zero() {
            Decimal::ZERO
        } else {
            self.total_long_in_amount / self.total_long_in_qty
        }
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_long_in_fee + self.total_long_out_fee
    }

    pub fn is_flat(&self) -> bool {
        self.qty().is_zero()
    }
}

/// Account snapshot maintained by the ledger.
///
/// `buying_power` is a dollar amount here; the backtest host call converts
/// it to a share count before handing it to a strategy (see the sandbox
/// `AccountInfoResponse`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Decimal,
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_fees: Decimal,
    pub margin_used: Decimal,
}

impl Account {
    pub fn with_capital(initial_capital: Decimal) -> Self {
        Self {
            balance: initial_capital,
            equity: initial_capital,
            buying_power: initial_capital,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            margin_used: Decimal::ZERO,
        }
    }
}
