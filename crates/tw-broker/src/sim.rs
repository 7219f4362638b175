use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use tw_types::{
    ExecuteOrder, MarketData, Order, OrderError, OrderId, OrderStatus, OrderType, PositionType,
    Reason, Side, Trade,
};

use crate::commission::Commission;
use crate::ledger::Ledger;

/// A terminal (or run-end) order row ready for persistence, with the trade
/// that accompanied it if the order filled.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order: Order,
    pub trade: Option<Trade>,
}

/// Reservation held while an order is in flight, so later submissions in
/// the same bar validate against projected state.
#[derive(Debug, Clone, Copy)]
struct Reserve {
    cost: Decimal,
    delta: Decimal,
}

/// Simulated broker for one run.
///
/// Validation is synchronous at submission time against *projected* state:
/// balance minus reserved buy cost, positions plus pending same-bar
/// deltas. Fills happen in the bar's fill phase in submission order, each
/// re-validated against the actual ledger; an earlier fill can therefore
/// fail a later one (`Pending -> Failed`).
pub struct SimBroker {
    ledger: Ledger,
    commission: Box<dyn Commission>,
    precision: u32,
    orders: HashMap<OrderId, Order>,
    market_queue: Vec<OrderId>,
    pending_limits: Vec<OrderId>,
    held_this_bar: Vec<OrderId>,
    reserves: HashMap<OrderId, Reserve>,
    reserved_cost: Decimal,
    projected_delta: HashMap<String, Decimal>,
    next_order_id: OrderId,
    bar_time: DateTime<Utc>,
    completed: Vec<OrderUpdate>,
}

impl SimBroker {
    pub fn new(initial_capital: Decimal, precision: u32, commission: Box<dyn Commission>) -> Self {
        Self {
            ledger: Ledger::new(initial_capital, precision),
            commission,
            precision,
            orders: HashMap::new(),
            market_queue: Vec::new(),
            pending_limits: Vec::new(),
            held_this_bar: Vec::new(),
            reserves: HashMap::new(),
            reserved_cost: Decimal::ZERO,
            projected_delta: HashMap::new(),
            next_order_id: 1,
            bar_time: DateTime::<Utc>::MIN_UTC,
            completed: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Mark the current bar: timestamps submissions and refreshes the
    /// ledger's view of this symbol's price.
    pub fn observe_bar(&mut self, bar: &MarketData) {
        self.bar_time = bar.timestamp;
        self.ledger.observe_price(&bar.symbol, bar.close);
    }

    fn projected_buying_power(&self) -> Decimal {
        self.ledger.account().balance - self.reserved_cost
    }

    fn projected_qty(&self, symbol: &str) -> Decimal {
        self.ledger.position_qty(symbol)
            + self
                .projected_delta
                .get(symbol)
                .copied()
                .unwrap_or(Decimal::ZERO)
    }

    fn validate_projected(
        &self,
        exec: &ExecuteOrder,
        symbol_known: bool,
        buying_power: Decimal,
        deltas: &HashMap<String, Decimal>,
    ) -> Result<(), OrderError> {
        if exec.quantity <= Decimal::ZERO || exec.quantity.round_dp(self.precision) != exec.quantity
        {
            return Err(OrderError::InvalidQuantity);
        }
        if exec.position_type == PositionType::Short {
            // Short exposure is not simulated.
            return Err(OrderError::InsufficientSellingPower);
        }
        match exec.side {
            Side::Buy => {
                if exec.quantity * exec.price > buying_power {
                    return Err(OrderError::InsufficientBuyingPower);
                }
            }
            Side::Sell => {
                let projected = self.ledger.position_qty(&exec.symbol)
                    + deltas.get(&exec.symbol).copied().unwrap_or(Decimal::ZERO);
                if exec.quantity > projected {
                    return Err(OrderError::InsufficientSellingPower);
                }
            }
        }
        if !symbol_known {
            return Err(OrderError::UnknownSymbol {
                symbol: exec.symbol.clone(),
            });
        }
        Ok(())
    }

    fn reserve_for(side: Side, quantity: Decimal, price: Decimal) -> Reserve {
        match side {
            Side::Buy => Reserve {
                cost: quantity * price,
                delta: quantity,
            },
            Side::Sell => Reserve {
                cost: Decimal::ZERO,
                delta: -quantity,
            },
        }
    }

    fn hold(&mut self, id: OrderId, reserve: Reserve, symbol: &str) {
        self.reserved_cost += reserve.cost;
        *self
            .projected_delta
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO) += reserve.delta;
        self.reserves.insert(id, reserve);
    }

    fn release(&mut self, id: OrderId, symbol: &str) {
        if let Some(reserve) = self.reserves.remove(&id) {
            self.reserved_cost -= reserve.cost;
            if let Some(delta) = self.projected_delta.get_mut(symbol) {
                *delta -= reserve.delta;
                if delta.is_zero() {
                    self.projected_delta.remove(symbol);
                }
            }
        }
    }

    fn fail_order(&mut self, mut order: Order, error: &OrderError) {
        order.status = OrderStatus::Failed;
        order.reason = Reason::new(error.reason_code(), error.to_string());
        self.orders.insert(order.id, order.clone());
        self.completed.push(OrderUpdate { order, trade: None });
    }

    /// Submit one order. Returns the assigned id and the validation
    /// outcome; rejected orders are recorded as `Failed` rows either way.
    pub fn submit(
        &mut self,
        exec: ExecuteOrder,
        symbol_known: bool,
    ) -> (OrderId, Result<(), OrderError>) {
        let id = self.next_order_id;
        self.next_order_id += 1;

        let validation = self.validate_projected(
            &exec,
            symbol_known,
            self.projected_buying_power(),
            &self.projected_delta,
        );
        let order = Order::from_submission(id, self.bar_time, exec);

        match validation {
            Ok(()) => {
                let symbol = order.symbol.clone();
                let reserve = Self::reserve_for(order.side, order.quantity, order.price);
                self.hold(id, reserve, &symbol);
                match order.order_type {
                    OrderType::Market => self.market_queue.push(id),
                    OrderType::Limit => {
                        self.pending_limits.push(id);
                        self.held_this_bar.push(id);
                    }
                }
                debug!(order_id = id, symbol = %order.symbol, side = %order.side, "order accepted");
                self.orders.insert(id, order);
                (id, Ok(()))
            }
            Err(error) => {
                debug!(order_id = id, code = error.reason_code(), "order rejected");
                self.fail_order(order, &error);
                (id, Err(error))
            }
        }
    }

    /// Atomic batch submission: every order must pass projected validation
    /// or none is enqueued. Fills remain independent per order.
    pub fn submit_batch(
        &mut self,
        execs: Vec<ExecuteOrder>,
        symbol_known: impl Fn(&str) -> bool,
    ) -> Result<Vec<OrderId>, (usize, OrderError)> {
        let mut buying_power = self.projected_buying_power();
        let mut deltas = self.projected_delta.clone();
        for (index, exec) in execs.iter().enumerate() {
            self.validate_projected(exec, symbol_known(&exec.symbol), buying_power, &deltas)
                .map_err(|e| (index, e))?;
            let reserve = Self::reserve_for(exec.side, exec.quantity, exec.price);
            buying_power -= reserve.cost;
            *deltas.entry(exec.symbol.clone()).or_insert(Decimal::ZERO) += reserve.delta;
        }

        let mut ids = Vec::with_capacity(execs.len());
        for exec in execs {
            let known = symbol_known(&exec.symbol);
            let (id, result) = self.submit(exec, known);
            debug_assert!(result.is_ok(), "batch order re-validation must succeed");
            ids.push(id);
        }
        Ok(ids)
    }

    fn fill_price_for(&self, order: &Order, bar: &MarketData) -> Option<Decimal> {
        if order.symbol == bar.symbol {
            Some(bar.close)
        } else {
            self.ledger.last_price(&order.symbol)
        }
    }

    fn execute_fill(&mut self, mut order: Order, price: Decimal) {
        // Re-validate against the actual ledger; an earlier fill in this
        // bar may have consumed the balance or the position.
        let check = match order.side {
            Side::Buy => {
                if order.quantity * price > self.ledger.account().balance {
                    Err(OrderError::InsufficientBuyingPower)
                } else {
                    Ok(())
                }
            }
            Side::Sell => {
                if order.quantity > self.ledger.position_qty(&order.symbol) {
                    Err(OrderError::InsufficientSellingPower)
                } else {
                    Ok(())
                }
            }
        };
        if let Err(error) = check {
            self.fail_order(order, &error);
            return;
        }

        let fee = self
            .commission
            .calculate(order.quantity, price)
            .round_dp(self.precision);
        order.status = OrderStatus::Filled;
        order.fee = fee;

        let trade = match order.side {
            Side::Buy => self.ledger.apply_buy(&order, price, fee, self.bar_time),
            Side::Sell => self.ledger.apply_sell(&order, price, fee, self.bar_time),
        };
        self.orders.insert(order.id, order.clone());
        self.completed.push(OrderUpdate {
            order,
            trade: Some(trade),
        });
    }

    /// Fill phase for market orders submitted during this bar, in
    /// submission order, priced at the bar close.
    pub fn fill_market_orders(&mut self, bar: &MarketData) {
        let queue = std::mem::take(&mut self.market_queue);
        for id in queue {
            let Some(order) = self.orders.get(&id).cloned() else {
                continue;
            };
            self.release(id, &order.symbol);
            match self.fill_price_for(&order, bar) {
                Some(price) => self.execute_fill(order, price),
                None => {
                    self.fail_order(order, &OrderError::PriceUnavailable);
                }
            }
        }
    }

    /// Match still-pending limit orders against this bar. Orders placed
    /// during this bar only become eligible from the next bar on.
    pub fn match_limit_orders(&mut self, bar: &MarketData) {
        let pending = std::mem::take(&mut self.pending_limits);
        for id in pending {
            let Some(order) = self.orders.get(&id).cloned() else {
                continue;
            };
            if self.held_this_bar.contains(&id) || order.symbol != bar.symbol {
                self.pending_limits.push(id);
                continue;
            }

            let fill_price = match order.side {
                Side::Buy if bar.low <= order.price => Some(order.price.min(bar.open)),
                Side::Sell if bar.high >= order.price => Some(order.price.max(bar.open)),
                _ => None,
            };
            match fill_price {
                Some(price) => {
                    self.release(id, &order.symbol);
                    self.execute_fill(order, price);
                }
                None => self.pending_limits.push(id),
            }
        }
    }

    /// Close out the bar: limits placed during it become eligible.
    pub fn end_bar(&mut self) {
        self.held_this_bar.clear();
    }

    pub fn cancel_order(&mut self, id: OrderId) -> Result<(), OrderError> {
        let order = self
            .orders
            .get(&id)
            .cloned()
            .ok_or(OrderError::NotFound { id })?;
        if order.status != OrderStatus::Pending {
            return Err(OrderError::NotPending { id });
        }

        self.release(id, &order.symbol);
        self.market_queue.retain(|o| *o != id);
        self.pending_limits.retain(|o| *o != id);
        self.held_this_bar.retain(|o| *o != id);

        let mut order = order;
        order.status = OrderStatus::Cancelled;
        self.orders.insert(id, order.clone());
        self.completed.push(OrderUpdate { order, trade: None });
        Ok(())
    }

    pub fn cancel_all_orders(&mut self) -> usize {
        let pending: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| o.id)
            .collect();
        let mut cancelled = 0;
        let mut ids = pending;
        ids.sort_unstable();
        for id in ids {
            if self.cancel_order(id).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn order_status(&self, id: OrderId) -> Option<OrderStatus> {
        self.orders.get(&id).map(|o| o.status)
    }

    /// Currently pending orders in id (submission) order.
    pub fn open_orders(&self) -> Vec<Order> {
        let mut open: Vec<Order> = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        open.sort_by_key(|o| o.id);
        open
    }

    /// Largest integer share count affordable at `price`, commission-aware.
    pub fn max_buy_quantity(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let available = self.projected_buying_power();
        let mut qty = (available / price).floor();
        if qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let fee = self.commission.calculate(qty, price);
        if qty * price + fee > available {
            qty = ((available - fee) / price).floor().max(Decimal::ZERO);
        }
        qty
    }

    pub fn max_sell_quantity(&self, symbol: &str) -> Decimal {
        self.projected_qty(symbol).max(Decimal::ZERO)
    }

    /// Integer share count affordable at the symbol's most recent close;
    /// the backtest meaning of "buying power" in account snapshots.
    pub fn max_affordable_shares(&self, symbol: &str) -> Decimal {
        match self.ledger.last_price(symbol) {
            Some(price) if price > Decimal::ZERO => {
                (self.ledger.account().balance / price).floor()
            }
            _ => Decimal::ZERO,
        }
    }

    /// Persist any orders still pending at run end, in id order.
    pub fn finalize(&mut self) {
        let mut open = self.open_orders();
        open.sort_by_key(|o| o.id);
        for order in open {
            self.completed.push(OrderUpdate { order, trade: None });
        }
    }

    /// Drain rows ready for the order/trade writers.
    pub fn take_updates(&mut self) -> Vec<OrderUpdate> {
        std::mem::take(&mut self.completed)
    }
}
