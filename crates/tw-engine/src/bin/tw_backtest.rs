use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tw_data::DbTarget;
use tw_engine::{Backtest, LifecycleCallbacks};
use tw_types::{EngineError, EngineResult, Run};

/// Run strategies over historical bars and write per-run artifacts.
#[derive(Debug, Parser)]
#[command(name = "tw-backtest", version, about)]
struct Cli {
    /// Engine config YAML (initial_capital, broker, precision, window).
    #[arg(long)]
    config: PathBuf,

    /// Folder receiving one sub-folder of artifacts per run.
    #[arg(long)]
    results: PathBuf,

    /// Data file glob (parquet or CSV).
    #[arg(long)]
    data: String,

    /// Strategy config glob; omit to run with an empty config.
    #[arg(long = "strategy-config")]
    strategy_config: Option<String>,

    /// Strategy module manifest (YAML, or a framed binary manifest).
    #[arg(long, alias = "strategy-wasm")]
    strategy: PathBuf,

    /// DuckDB catalog location for the data source.
    #[arg(long, default_value = ":memory:")]
    db: String,
}

struct ProgressCallbacks;

impl LifecycleCallbacks for ProgressCallbacks {
    fn on_backtest_start(
        &self,
        strategies: usize,
        configs: usize,
        data_files: usize,
    ) -> EngineResult<()> {
        info!(strategies, configs, data_files, "backtest started");
        Ok(())
    }

    fn on_run_start(
        &self,
        run: &Run,
        _config_index: usize,
        config_name: &str,
        _data_index: usize,
        total_points: u64,
    ) -> EngineResult<()> {
        info!(
            run_id = %run.run_id,
            strategy = %run.strategy_name,
            config = config_name,
            data = %run.data_file_path.display(),
            bars = total_points,
            "run started"
        );
        Ok(())
    }

    fn on_run_end(&self, run: &Run) -> EngineResult<()> {
        info!(run_id = %run.run_id, folder = %run.result_folder.display(), "run finished");
        Ok(())
    }

    fn on_backtest_end(&self, error: Option<&EngineError>) {
        match error {
            None => info!("backtest finished"),
            Some(EngineError::Cancelled) => info!("backtest cancelled"),
            Some(error) => error!(%error, "backtest failed"),
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> EngineResult<()> {
    let engine_yaml = std::fs::read_to_string(&cli.config)?;

    let mut backtest = Backtest::new();
    backtest.initialize(&engine_yaml)?;
    backtest.set_results_folder(&cli.results);
    backtest.set_data_path(&cli.data)?;
    backtest.set_db(DbTarget::parse(&cli.db));
    if let Some(pattern) = &cli.strategy_config {
        backtest.set_config_path(pattern)?;
    }
    backtest.load_strategy_from_file(&cli.strategy)?;

    backtest.run(&cancel, &ProgressCallbacks).await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c()
            .await
            .context("install ctrl-c handler")
            .is_ok()
        {
            info!("cancellation requested");
            signal_token.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(EngineError::Cancelled) => ExitCode::from(130),
        Err(error) => {
            error!(%error, "exiting with failure");
            ExitCode::FAILURE
        }
    }
}
