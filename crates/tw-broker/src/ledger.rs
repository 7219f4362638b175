use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use tw_types::{Account, Order, Position, Trade, TradeFilter};

/// Portfolio accounting for one run.
///
/// All mutations round to the configured decimal precision so repeated runs
/// stay bit-identical and balances never drift. Invariants maintained after
/// every fill:
///   balance = initial_capital + sell proceeds - buy costs (fees included)
///   buying_power <= balance (spot)
///   equity = balance + sum(position qty * last known price)
#[derive(Debug)]
pub struct Ledger {
    initial_capital: Decimal,
    precision: u32,
    account: Account,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    last_prices: HashMap<String, Decimal>,
}

impl Ledger {
    pub fn new(initial_capital: Decimal, precision: u32) -> Self {
        Self {
            initial_capital,
            precision,
            account: Account::with_capital(initial_capital),
            positions: HashMap::new(),
            trades: Vec::new(),
            last_prices: HashMap::new(),
        }
    }

    fn round(&self, value: Decimal) -> Decimal {
        value.round_dp(self.precision)
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Open positions sorted by symbol for deterministic snapshots.
    pub fn positions(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.positions.values().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn position_qty(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.qty())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn trades_matching(&self, filter: &TradeFilter) -> Vec<Trade> {
        let mut matched: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.get(symbol).copied()
    }

    /// Record the latest close and refresh mark-to-market totals.
    pub fn observe_price(&mut self, symbol: &str, close: Decimal) {
        self.last_prices.insert(symbol.to_string(), close);
        self.refresh_marks();
    }

    fn refresh_marks(&mut self) {
        let mut market_value = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for position in self.positions.values() {
            if let Some(price) = self.last_prices.get(&position.symbol) {
                market_value += position.qty() * *price;
                unrealized += position.qty() * (*price - position.avg_cost());
            }
        }
        self.account.equity = self.round(self.account.balance + market_value);
        self.account.unrealized_pnl = self.round(unrealized);
    }

    /// Apply a buy fill. The caller has already validated affordability.
    pub fn apply_buy(
        &mut self,
        order: &Order,
        price: Decimal,
        fee: Decimal,
        at: DateTime<Utc>,
    ) -> Trade {
        let precision = self.precision;
        let qty = order.quantity;
        let cost = (qty * price).round_dp(precision);

        self.account.balance = (self.account.balance - cost - fee).round_dp(precision);
        self.account.buying_power = self.account.balance;
        self.account.total_fees = (self.account.total_fees + fee).round_dp(precision);

        let position = self
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::open(order.symbol.clone(), order.strategy_name.clone(), at));
        position.total_long_in_qty += qty;
        position.total_long_in_amount = (position.total_long_in_amount + cost).round_dp(precision);
        position.total_long_in_fee = (position.total_long_in_fee + fee).round_dp(precision);

        self.refresh_marks();
        debug!(symbol = %order.symbol, %qty, %price, %fee, "buy fill applied");

        let trade = Trade {
            order: order.clone(),
            executed_at: at,
            executed_qty: qty,
            executed_price: price,
            fee,
            pnl: Decimal::ZERO,
        };
        self.trades.push(trade.clone());
        trade
    }

    /// Apply a sell fill against the long position; returns the trade with
    /// its realized P&L portion.
    pub fn apply_sell(
        &mut self,
        order: &Order,
        price: Decimal,
        fee: Decimal,
        at: DateTime<Utc>,
    ) -> Trade {
        let precision = self.precision;
        let qty = order.quantity;
        let proceeds = (qty * price).round_dp(precision);

        let position = self
            .positions
            .get_mut(&order.symbol)
            .expect("sell validated against an open position");
        let avg_cost = position.avg_cost();
        let pnl = (qty * (price - avg_cost) - fee).round_dp(precision);

        position.total_long_out_qty += qty;
        position.total_long_out_amount = (position.total_long_out_amount + proceeds).round_dp(precision);
        position.total_long_out_fee = (position.total_long_out_fee + fee).round_dp(precision);
        if position.is_flat() {
            self.positions.remove(&order.symbol);
        }

        self.account.balance = (self.account.balance + proceeds - fee).round_dp(precision);
        self.account.buying_power = self.account.balance;
        self.account.total_fees = (self.account.total_fees + fee).round_dp(precision);
        self.account.realized_pnl = (self.account.realized_pnl + pnl).round_dp(precision);

        self.refresh_marks();
        debug!(symbol = %order.symbol, %qty, %price, %fee, %pnl, "sell fill applied");

        let trade = Trade {
            order: order.clone(),
            executed_at: at,
            executed_qty: qty,
            executed_price: price,
            fee,
            pnl,
        };
        self.trades.push(trade.clone());
        trade
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tw_types::{ExecuteOrder, Side};

    fn order(id: u64, side: Side, qty: Decimal, price: Decimal) -> Order {
        Order::from_submission(
            id,
            Utc::now(),
            match side {
                Side::Buy => ExecuteOrder::market("AAPL", Side::Buy, qty, price, "t"),
                Side::Sell => ExecuteOrder::market("AAPL", Side::Sell, qty, price, "t"),
            },
        )
    }

    #[test]
    fn test_buy_then_sell_roundtrip() {
        let mut ledger = Ledger::new(dec!(10000), 8);
        let now = Utc::now();

        ledger.apply_buy(&order(1, Side::Buy, dec!(10), dec!(100)), dec!(100), dec!(0), now);
        assert_eq!(ledger.account().balance, dec!(9000));
        assert_eq!(ledger.position_qty("AAPL"), dec!(10));

        let trade = ledger.apply_sell(&order(2, Side::Sell, dec!(10), dec!(110)), dec!(110), dec!(0), now);
        assert_eq!(trade.pnl, dec!(100));
        assert_eq!(ledger.account().balance, dec!(10100));
        assert_eq!(ledger.account().realized_pnl, dec!(100));
        // Flat positions are cleared.
        assert!(ledger.position("AAPL").is_none());
    }

    #[test]
    fn test_partial_sell_uses_average_cost() {
        let mut ledger = Ledger::new(dec!(10000), 8);
        let now = Utc::now();

        ledger.apply_buy(&order(1, Side::Buy, dec!(4), dec!(100)), dec!(100), dec!(0), now);
        ledger.apply_buy(&order(2, Side::Buy, dec!(4), dec!(110)), dec!(110), dec!(0), now);
        // Average cost is 105.
        let trade = ledger.apply_sell(&order(3, Side::Sell, dec!(2), dec!(120)), dec!(120), dec!(0), now);
        assert_eq!(trade.pnl, dec!(30));
        assert_eq!(ledger.position_qty("AAPL"), dec!(6));
    }

    #[test]
    fn test_fees_accumulate() {
        let mut ledger = Ledger::new(dec!(10000), 8);
        let now = Utc::now();

        ledger.apply_buy(&order(1, Side::Buy, dec!(1), dec!(100)), dec!(100), dec!(1), now);
        ledger.apply_sell(&order(2, Side::Sell, dec!(1), dec!(100)), dec!(100), dec!(1), now);

        assert_eq!(ledger.account().total_fees, dec!(2));
        // Fees reduce both balance and realized P&L.
        assert_eq!(ledger.account().balance, dec!(9998));
        assert_eq!(ledger.account().realized_pnl, dec!(-1));
        let trade_fees: Decimal = ledger.trades().iter().map(|t| t.fee).sum();
        assert_eq!(trade_fees, ledger.account().total_fees);
    }

    #[test]
    fn test_equity_marks_to_market() {
        let mut ledger = Ledger::new(dec!(10000), 8);
        let now = Utc::now();

        ledger.apply_buy(&order(1, Side::Buy, dec!(10), dec!(100)), dec!(100), dec!(0), now);
        ledger.observe_price("AAPL", dec!(105));

        assert_eq!(ledger.account().equity, dec!(9000) + dec!(10) * dec!(105));
        assert_eq!(ledger.account().unrealized_pnl, dec!(50));
    }

    #[test]
    fn test_rounding_respects_precision() {
        let mut ledger = Ledger::new(dec!(10000), 2);
        let now = Utc::now();

        ledger.apply_buy(
            &order(1, Side::Buy, dec!(3), dec!(33.333333)),
            dec!(33.333333),
            dec!(0),
            now,
        );
        // 3 * 33.333333 = 99.999999, rounded to 100.00 at precision 2.
        assert_eq!(ledger.account().balance, dec!(9900.00));
    }
}
