use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tw_broker::{commission_for, SimBroker};
use tw_data::{BarSource, DbTarget, RunCache};
use tw_indicators::IndicatorRegistry;
use tw_sandbox::StrategyRuntime;
use tw_types::{
    EngineConfig, EngineError, EngineResult, MarkColor, MarkLevel, MarkSpec, MarkShape, Run,
    StrategyError, Trade,
};

use crate::host::HostApi;
use crate::orchestrator::LifecycleCallbacks;
use crate::persist::{write_stats, RunWriters};
use crate::stats::{compute_stats, StrategyIdent, TradeStats};
use crate::stores::{LogStore, MarkStore};

/// What one run produced, for logging and callbacks.
#[derive(Debug)]
pub struct RunOutcome {
    pub bars: u64,
    pub orders: u64,
    pub trades: u64,
    pub stats: Vec<TradeStats>,
}

/// Execute one (strategy, config, data-file) run end to end.
///
/// Runs entirely on the caller's thread: the data source, the strategy
/// module and the parquet writers are all blocking, so the loop has no
/// await points and cancellation is observed by polling the token at bar
/// boundaries. Persistence is flushed even when the loop stops early
/// (cancellation, callback abort, fatal error), so partial outputs stay
/// self-consistent.
#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_run(
    config: &EngineConfig,
    runtime: &mut StrategyRuntime,
    strategy_config_yaml: &str,
    run: &Run,
    config_index: usize,
    config_name: &str,
    data_index: usize,
    db: &DbTarget,
    cancel: &CancellationToken,
    callbacks: &dyn LifecycleCallbacks,
) -> EngineResult<RunOutcome> {
    std::fs::create_dir_all(&run.result_folder)?;

    let source = BarSource::open(&run.data_file_path, db)?;
    let commission = commission_for(&config.broker)?;
    let mut broker = SimBroker::new(config.initial_capital, config.decimal_precision, commission);
    let mut cache = RunCache::new(config.cache_capacity);
    let mut indicators = IndicatorRegistry::with_defaults();
    let mut marks = MarkStore::new();
    let mut logs = LogStore::new();

    let total = source.count(config.start_time, config.end_time)?;
    callbacks.on_run_start(run, config_index, config_name, data_index, total)?;

    runtime.initialize(strategy_config_yaml)?;
    let mut writers = RunWriters::create(&run.result_folder)?;

    let mut orders_written = 0u64;
    let mut trades_written = 0u64;

    let loop_result = run_bars(
        config,
        runtime,
        &source,
        &mut broker,
        &mut cache,
        &mut indicators,
        &mut marks,
        &mut logs,
        &mut writers,
        total,
        cancel,
        callbacks,
        &mut orders_written,
        &mut trades_written,
    );

    // Flush whatever is in flight regardless of how the loop ended.
    broker.finalize();
    let flush_result = flush_pending(
        &mut broker,
        &mut marks,
        &mut logs,
        &mut writers,
        &mut orders_written,
        &mut trades_written,
    )
    .and_then(|_| writers.finish());

    let ident = StrategyIdent {
        id: runtime.identifier(),
        name: runtime.name(),
    };
    let stats = compute_stats(
        broker.ledger().trades(),
        &ident,
        &run.data_file_path,
        &run.result_folder.join(RunWriters::LOGS_FILE),
    );
    let stats_result = write_stats(&run.result_folder, &stats).map(|_| ());

    let bars = match loop_result {
        Ok(bars) => bars,
        Err(error) => return Err(error),
    };
    flush_result?;
    stats_result?;

    info!(
        run_id = %run.run_id,
        bars,
        orders = orders_written,
        trades = trades_written,
        final_equity = %broker.ledger().account().equity,
        "run complete"
    );
    Ok(RunOutcome {
        bars,
        orders: orders_written,
        trades: trades_written,
        stats,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_bars(
    config: &EngineConfig,
    runtime: &mut StrategyRuntime,
    source: &BarSource,
    broker: &mut SimBroker,
    cache: &mut RunCache,
    indicators: &mut IndicatorRegistry,
    marks: &mut MarkStore,
    logs: &mut LogStore,
    writers: &mut RunWriters,
    total: u64,
    cancel: &CancellationToken,
    callbacks: &dyn LifecycleCallbacks,
    orders_written: &mut u64,
    trades_written: &mut u64,
) -> EngineResult<u64> {
    let namespace = runtime.identifier();
    let mut stream = source.stream(config.start_time, config.end_time);
    let mut index = 0u64;

    while let Some(bar) = stream.next_bar()? {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        callbacks.on_process_data(index, total)?;

        broker.observe_bar(&bar);

        let process_result = {
            let mut host = HostApi::new(
                source,
                broker,
                cache,
                indicators,
                marks,
                logs,
                &bar,
                namespace.clone(),
                config.max_host_calls_per_bar,
            );
            runtime.process_data(&bar, &mut host)
        };
        match process_result {
            Ok(()) => {}
            // Running out of sandbox memory is fatal for the run.
            Err(error @ StrategyError::MemoryLimit { .. }) => return Err(error.into()),
            Err(error) => {
                warn!(%error, timestamp = %bar.timestamp, "strategy error; bar skipped");
                marks.append(
                    bar.clone(),
                    MarkSpec {
                        color: MarkColor::Red,
                        shape: MarkShape::Circle,
                        level: MarkLevel::Error,
                        title: "Strategy Error".to_string(),
                        message: error.to_string(),
                        category: "StrategyError".to_string(),
                        signal: None,
                    },
                );
            }
        }

        broker.fill_market_orders(&bar);
        broker.match_limit_orders(&bar);
        broker.end_bar();

        flush_pending(broker, marks, logs, writers, orders_written, trades_written)?;

        index += 1;
        if index % 10_000 == 0 {
            debug!(index, total, "dispatch progress");
        }
    }
    Ok(index)
}

fn flush_pending(
    broker: &mut SimBroker,
    marks: &mut MarkStore,
    logs: &mut LogStore,
    writers: &mut RunWriters,
    orders_written: &mut u64,
    trades_written: &mut u64,
) -> EngineResult<()> {
    let updates = broker.take_updates();
    let mut order_rows = Vec::with_capacity(updates.len());
    let mut trade_rows: Vec<Trade> = Vec::new();
    for update in updates {
        order_rows.push(update.order);
        if let Some(trade) = update.trade {
            trade_rows.push(trade);
        }
    }
    *orders_written += order_rows.len() as u64;
    *trades_written += trade_rows.len() as u64;

    writers.append_orders(&order_rows)?;
    writers.append_trades(&trade_rows)?;
    writers.append_marks(&marks.drain())?;
    writers.append_logs(&logs.drain())
}
