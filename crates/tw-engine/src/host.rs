use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use tw_broker::SimBroker;
use tw_data::{BarSource, RunCache};
use tw_indicators::{IndicatorRegistry, Signal};
use tw_sandbox::{AccountInfo, GetRangeRequest, Host, HostError, HostResult, SqlRequest, SqlResponse};
use tw_types::{
    EngineResult, ExecuteOrder, LogLevel, LogRecord, MarkSpec, MarketData, Order, OrderError,
    OrderId, OrderStatus, Position, Trade, TradeFilter,
};

use crate::stores::{LogStore, MarkStore};

/// Non-owning view over the run's subsystems, constructed per
/// `process_data` call. The engine keeps exclusive ownership; the host API
/// borrows for exactly one bar, which is what makes host calls observe
/// prior same-bar effects without any locking.
pub struct HostApi<'run> {
    source: &'run BarSource,
    broker: &'run mut SimBroker,
    cache: &'run mut RunCache,
    indicators: &'run mut IndicatorRegistry,
    marks: &'run mut MarkStore,
    logs: &'run mut LogStore,
    current_bar: &'run MarketData,
    cache_namespace: String,
    call_budget: Option<u32>,
    calls_made: u32,
}

impl<'run> HostApi<'run> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'run BarSource,
        broker: &'run mut SimBroker,
        cache: &'run mut RunCache,
        indicators: &'run mut IndicatorRegistry,
        marks: &'run mut MarkStore,
        logs: &'run mut LogStore,
        current_bar: &'run MarketData,
        cache_namespace: String,
        call_budget: Option<u32>,
    ) -> Self {
        Self {
            source,
            broker,
            cache,
            indicators,
            marks,
            logs,
            current_bar,
            cache_namespace,
            call_budget,
            calls_made: 0,
        }
    }

    fn charge(&mut self) -> HostResult<()> {
        self.calls_made += 1;
        match self.call_budget {
            Some(budget) if self.calls_made > budget => Err(HostError::budget_exhausted()),
            _ => Ok(()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.cache_namespace, key)
    }

    fn map<T>(result: EngineResult<T>) -> HostResult<T> {
        result.map_err(|e| HostError::from_engine(&e))
    }
}

impl Host for HostApi<'_> {
    fn get_range(&mut self, req: GetRangeRequest) -> HostResult<Vec<MarketData>> {
        self.charge()?;
        // The range is clamped to the current bar so a strategy cannot
        // read ahead of the stream.
        let end = req.end.min(self.current_bar.timestamp);
        Self::map(self.source.get_range(&req.symbol, req.start, end, req.interval))
    }

    fn read_last_data(&mut self, symbol: &str) -> HostResult<Option<MarketData>> {
        self.charge()?;
        Self::map(self.source.read_last(symbol, self.current_bar.timestamp))
    }

    fn execute_sql(&mut self, req: SqlRequest) -> HostResult<SqlResponse> {
        self.charge()?;
        let rows = Self::map(self.source.execute_sql(&req.query, &req.params))?;
        Ok(SqlResponse { rows })
    }

    fn count(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> HostResult<u64> {
        self.charge()?;
        Self::map(self.source.count(Some(start), Some(end)))
    }

    fn configure_indicator(&mut self, kind: &str, json_config: &str) -> HostResult<()> {
        self.charge()?;
        Self::map(self.indicators.configure(kind, json_config))
    }

    fn get_signal(&mut self, kind: &str, bar: &MarketData) -> HostResult<Signal> {
        self.charge()?;
        Self::map(self.indicators.get_signal(kind, bar, self.source))
    }

    fn get_cache(&mut self, key: &str) -> HostResult<Option<String>> {
        self.charge()?;
        let key = self.namespaced(key);
        Ok(self.cache.get(&key))
    }

    fn set_cache(&mut self, key: &str, value: &str) -> HostResult<()> {
        self.charge()?;
        let key = self.namespaced(key);
        self.cache.set(key, value);
        Ok(())
    }

    fn place_order(&mut self, order: ExecuteOrder) -> HostResult<OrderId> {
        self.charge()?;
        let known = self.source.has_symbol(&order.symbol);
        let (id, result) = self.broker.submit(order, known);
        match result {
            Ok(()) => Ok(id),
            Err(error) => Err(HostError::new(error.reason_code(), error.to_string())),
        }
    }

    fn place_multiple_orders(&mut self, orders: Vec<ExecuteOrder>) -> HostResult<Vec<OrderId>> {
        self.charge()?;
        let source = self.source;
        self.broker
            .submit_batch(orders, |symbol| source.has_symbol(symbol))
            .map_err(|(index, error)| {
                HostError::new(
                    error.reason_code(),
                    format!("order {} in batch: {}", index, error),
                )
            })
    }

    fn cancel_order(&mut self, id: OrderId) -> HostResult<()> {
        self.charge()?;
        self.broker
            .cancel_order(id)
            .map_err(|e| HostError::new(e.reason_code(), e.to_string()))
    }

    fn cancel_all_orders(&mut self) -> HostResult<u32> {
        self.charge()?;
        Ok(self.broker.cancel_all_orders() as u32)
    }

    fn get_order_status(&mut self, id: OrderId) -> HostResult<OrderStatus> {
        self.charge()?;
        self.broker.order_status(id).ok_or_else(|| {
            let error = OrderError::NotFound { id };
            HostError::new(error.reason_code(), error.to_string())
        })
    }

    fn get_position(&mut self, symbol: &str) -> HostResult<Option<Position>> {
        self.charge()?;
        Ok(self.broker.ledger().position(symbol).cloned())
    }

    fn get_positions(&mut self) -> HostResult<Vec<Position>> {
        self.charge()?;
        Ok(self.broker.ledger().positions().into_iter().cloned().collect())
    }

    fn get_open_orders(&mut self) -> HostResult<Vec<Order>> {
        self.charge()?;
        Ok(self.broker.open_orders())
    }

    fn get_trades(&mut self, filter: TradeFilter) -> HostResult<Vec<Trade>> {
        self.charge()?;
        Ok(self.broker.ledger().trades_matching(&filter))
    }

    fn get_account_info(&mut self) -> HostResult<AccountInfo> {
        self.charge()?;
        let account = self.broker.ledger().account();
        Ok(AccountInfo {
            balance: account.balance,
            equity: account.equity,
            // Backtest semantics: whole shares affordable at the current
            // symbol's most recent close.
            buying_power: self.broker.max_affordable_shares(&self.current_bar.symbol),
            realized_pnl: account.realized_pnl,
            unrealized_pnl: account.unrealized_pnl,
            total_fees: account.total_fees,
            margin_used: account.margin_used,
        })
    }

    fn get_max_buy_quantity(&mut self, _symbol: &str, price: Decimal) -> HostResult<Decimal> {
        self.charge()?;
        Ok(self.broker.max_buy_quantity(price))
    }

    fn get_max_sell_quantity(&mut self, symbol: &str) -> HostResult<Decimal> {
        self.charge()?;
        Ok(self.broker.max_sell_quantity(symbol))
    }

    fn mark(&mut self, bar: &MarketData, spec: MarkSpec) -> HostResult<()> {
        self.charge()?;
        self.marks.append(bar.clone(), spec);
        Ok(())
    }

    fn log(
        &mut self,
        level: LogLevel,
        message: &str,
        fields: BTreeMap<String, String>,
    ) -> HostResult<()> {
        self.charge()?;
        self.logs.append(LogRecord {
            timestamp: self.current_bar.timestamp,
            symbol: self.current_bar.symbol.clone(),
            level,
            message: message.to_string(),
            fields,
        });
        Ok(())
    }
}
