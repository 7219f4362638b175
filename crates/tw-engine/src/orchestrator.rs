use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tw_data::DbTarget;
use tw_sandbox::{StrategyLoader, StrategyManifest, StrategyRuntime};
use tw_types::{ConfigError, EngineConfig, EngineError, EngineResult, Run, SetupError};

use crate::dispatch::execute_run;

/// Hooks invoked around the backtest lifecycle. Any `Result`-returning
/// hook may abort the backtest by returning an error; `on_backtest_end`
/// is always invoked, error or not.
pub trait LifecycleCallbacks: Send + Sync {
    fn on_backtest_start(
        &self,
        _strategies: usize,
        _configs: usize,
        _data_files: usize,
    ) -> EngineResult<()> {
        Ok(())
    }

    fn on_strategy_start(&self, _index: usize, _name: &str, _total: usize) -> EngineResult<()> {
        Ok(())
    }

    fn on_run_start(
        &self,
        _run: &Run,
        _config_index: usize,
        _config_name: &str,
        _data_index: usize,
        _total_points: u64,
    ) -> EngineResult<()> {
        Ok(())
    }

    fn on_process_data(&self, _current: u64, _total: u64) -> EngineResult<()> {
        Ok(())
    }

    fn on_run_end(&self, _run: &Run) -> EngineResult<()> {
        Ok(())
    }

    fn on_strategy_end(&self, _index: usize, _name: &str, _total: usize) -> EngineResult<()> {
        Ok(())
    }

    fn on_backtest_end(&self, _error: Option<&EngineError>) {}
}

/// Callback set that does nothing.
pub struct NoopCallbacks;

impl LifecycleCallbacks for NoopCallbacks {}

/// Serializes callback invocations when runs execute in parallel; the
/// cross-run ordering is unspecified, but calls never interleave.
struct SerializedCallbacks<'a> {
    inner: &'a dyn LifecycleCallbacks,
    lock: &'a Mutex<()>,
}

impl LifecycleCallbacks for SerializedCallbacks<'_> {
    fn on_run_start(
        &self,
        run: &Run,
        config_index: usize,
        config_name: &str,
        data_index: usize,
        total_points: u64,
    ) -> EngineResult<()> {
        let _guard = self.lock.lock();
        self.inner
            .on_run_start(run, config_index, config_name, data_index, total_points)
    }

    fn on_process_data(&self, current: u64, total: u64) -> EngineResult<()> {
        let _guard = self.lock.lock();
        self.inner.on_process_data(current, total)
    }

    fn on_run_end(&self, run: &Run) -> EngineResult<()> {
        let _guard = self.lock.lock();
        self.inner.on_run_end(run)
    }
}

/// One strategy config as seen by the run product.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedConfig {
    pub name: String,
    pub yaml: String,
}

enum StrategySlot {
    /// A caller-supplied instance; re-initialized before every run.
    Instance(StrategyRuntime),
    /// A manifest; a fresh module is instantiated for every run.
    Manifest(StrategyManifest),
}

struct LoadedStrategy {
    name: String,
    slot: StrategySlot,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConfigSource {
    Path,
    Content,
}

/// The run orchestrator: expands {strategies x configs x data files} into
/// runs and drives each through the per-bar dispatch loop.
pub struct Backtest {
    engine_config: Option<EngineConfig>,
    configs: Vec<NamedConfig>,
    config_source: Option<ConfigSource>,
    data_files: Vec<PathBuf>,
    data_pattern: Option<String>,
    strategies: Vec<LoadedStrategy>,
    results_folder: Option<PathBuf>,
    db: DbTarget,
    loader: StrategyLoader,
}

impl Backtest {
    pub fn new() -> Self {
        Self {
            engine_config: None,
            configs: Vec::new(),
            config_source: None,
            data_files: Vec::new(),
            data_pattern: None,
            strategies: Vec::new(),
            results_folder: None,
            db: DbTarget::Memory,
            loader: StrategyLoader::with_builtins(),
        }
    }

    /// Parse and validate the engine config YAML.
    pub fn initialize(&mut self, engine_config_yaml: &str) -> EngineResult<()> {
        self.engine_config = Some(EngineConfig::from_yaml(engine_config_yaml)?);
        Ok(())
    }

    /// Resolve strategy configs from a file glob; exclusive with
    /// `set_config_content`.
    pub fn set_config_path(&mut self, pattern: &str) -> EngineResult<()> {
        if self.config_source == Some(ConfigSource::Content) {
            return Err(ConfigError::MutuallyExclusive {
                first: "set_config_path".to_string(),
                second: "set_config_content".to_string(),
            }
            .into());
        }
        let files = expand_pattern(pattern)?;
        if files.is_empty() {
            return Err(SetupError::NoConfigs.into());
        }
        self.configs = files
            .into_iter()
            .map(|path| {
                let yaml = std::fs::read_to_string(&path)?;
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned());
                Ok(NamedConfig { name, yaml })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        self.config_source = Some(ConfigSource::Path);
        Ok(())
    }

    /// Supply strategy configs inline; exclusive with `set_config_path`.
    pub fn set_config_content(&mut self, configs: Vec<String>) -> EngineResult<()> {
        if self.config_source == Some(ConfigSource::Path) {
            return Err(ConfigError::MutuallyExclusive {
                first: "set_config_content".to_string(),
                second: "set_config_path".to_string(),
            }
            .into());
        }
        self.configs = configs
            .into_iter()
            .enumerate()
            .map(|(i, yaml)| NamedConfig {
                name: format!("config-{}", i),
                yaml,
            })
            .collect();
        self.config_source = Some(ConfigSource::Content);
        Ok(())
    }

    /// Resolve the ordered list of data files from a glob.
    pub fn set_data_path(&mut self, pattern: &str) -> EngineResult<()> {
        let files = expand_pattern(pattern)?;
        if files.is_empty() {
            return Err(SetupError::NoDataFiles {
                pattern: pattern.to_string(),
            }
            .into());
        }
        self.data_files = files;
        self.data_pattern = Some(pattern.to_string());
        Ok(())
    }

    pub fn set_db(&mut self, db: DbTarget) {
        self.db = db;
    }

    /// Register an already-instantiated strategy runtime.
    pub fn load_strategy(&mut self, runtime: StrategyRuntime) {
        self.strategies.push(LoadedStrategy {
            name: runtime.name(),
            slot: StrategySlot::Instance(runtime),
        });
    }

    /// Register a strategy from a manifest file; instantiated fresh for
    /// every run.
    pub fn load_strategy_from_file(&mut self, path: &Path) -> EngineResult<()> {
        let manifest = StrategyLoader::manifest_from_file(path)?;
        self.load_manifest_strategy(manifest)
    }

    pub fn load_strategy_from_bytes(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let manifest = StrategyLoader::manifest_from_bytes(bytes)?;
        self.load_manifest_strategy(manifest)
    }

    fn load_manifest_strategy(&mut self, manifest: StrategyManifest) -> EngineResult<()> {
        // Instantiate once up front so load failures surface before any
        // run starts.
        let runtime = self.loader.load_manifest(&manifest)?;
        self.strategies.push(LoadedStrategy {
            name: runtime.name(),
            slot: StrategySlot::Manifest(manifest),
        });
        Ok(())
    }

    /// Access the strategy factory registry, e.g. to register custom
    /// module factories before loading manifests.
    pub fn loader_mut(&mut self) -> &mut StrategyLoader {
        &mut self.loader
    }

    pub fn set_results_folder(&mut self, path: impl Into<PathBuf>) {
        self.results_folder = Some(path.into());
    }

    /// Run the whole product. Blocks until every run finishes, the first
    /// error aborts, or the cancel token fires.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        callbacks: &dyn LifecycleCallbacks,
    ) -> EngineResult<()> {
        let result = self.run_inner(cancel, callbacks);
        callbacks.on_backtest_end(result.as_ref().err());
        result
    }

    fn run_inner(
        &mut self,
        cancel: &CancellationToken,
        callbacks: &dyn LifecycleCallbacks,
    ) -> EngineResult<()> {
        let config = self
            .engine_config
            .clone()
            .ok_or_else(|| ConfigError::MissingField {
                field: "engine config (initialize was not called)".to_string(),
            })?;
        if self.strategies.is_empty() {
            return Err(SetupError::NoStrategies.into());
        }
        if self.data_files.is_empty() {
            return Err(SetupError::NoDataFiles {
                pattern: self.data_pattern.clone().unwrap_or_else(|| "(unset)".to_string()),
            }
            .into());
        }
        let results_root = self
            .results_folder
            .clone()
            .ok_or(SetupError::ResultsFolderNotSet)?;
        std::fs::create_dir_all(&results_root)?;

        let configs = if self.configs.is_empty() {
            vec![NamedConfig {
                name: "default".to_string(),
                yaml: String::new(),
            }]
        } else {
            self.configs.clone()
        };
        let data_files = self.data_files.clone();

        callbacks.on_backtest_start(self.strategies.len(), configs.len(), data_files.len())?;
        info!(
            strategies = self.strategies.len(),
            configs = configs.len(),
            data_files = data_files.len(),
            "backtest starting"
        );

        let parallel = config.max_parallel_runs > 1;
        let all_manifests = self
            .strategies
            .iter()
            .all(|s| matches!(s.slot, StrategySlot::Manifest(_)));
        if parallel && !all_manifests {
            warn!("parallel runs require manifest-loaded strategies; running sequentially");
        }

        if parallel && all_manifests {
            self.run_product_parallel(&config, &configs, &data_files, &results_root, cancel, callbacks)
        } else {
            self.run_product_sequential(&config, &configs, &data_files, &results_root, cancel, callbacks)
        }
    }

    fn run_product_sequential(
        &mut self,
        config: &EngineConfig,
        configs: &[NamedConfig],
        data_files: &[PathBuf],
        results_root: &Path,
        cancel: &CancellationToken,
        callbacks: &dyn LifecycleCallbacks,
    ) -> EngineResult<()> {
        let total_strategies = self.strategies.len();
        let loader = &self.loader;

        for (sidx, strategy) in self.strategies.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            callbacks.on_strategy_start(sidx, &strategy.name, total_strategies)?;

            for (cidx, named) in configs.iter().enumerate() {
                for (didx, data_file) in data_files.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    let mut run =
                        Run::begin(results_root, &strategy.name, &named.name, data_file.clone());

                    match &mut strategy.slot {
                        StrategySlot::Instance(runtime) => {
                            execute_run(
                                config, runtime, &named.yaml, &run, cidx, &named.name, didx,
                                &self.db, cancel, callbacks,
                            )?;
                        }
                        StrategySlot::Manifest(manifest) => {
                            let mut runtime = loader.load_manifest(manifest)?;
                            execute_run(
                                config, &mut runtime, &named.yaml, &run, cidx, &named.name, didx,
                                &self.db, cancel, callbacks,
                            )?;
                        }
                    }

                    run.end_wall_time = Some(Utc::now());
                    callbacks.on_run_end(&run)?;
                }
            }

            callbacks.on_strategy_end(sidx, &strategy.name, total_strategies)?;
        }
        Ok(())
    }

    fn run_product_parallel(
        &mut self,
        config: &EngineConfig,
        configs: &[NamedConfig],
        data_files: &[PathBuf],
        results_root: &Path,
        cancel: &CancellationToken,
        callbacks: &dyn LifecycleCallbacks,
    ) -> EngineResult<()> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_parallel_runs)
            .build()
            .map_err(|e| {
                EngineError::Config(ConfigError::InvalidValue {
                    field: "max_parallel_runs".to_string(),
                    message: e.to_string(),
                })
            })?;

        let callback_lock = Mutex::new(());
        let serialized = SerializedCallbacks {
            inner: callbacks,
            lock: &callback_lock,
        };
        let total_strategies = self.strategies.len();
        let loader = &self.loader;
        let db = &self.db;

        for (sidx, strategy) in self.strategies.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            callbacks.on_strategy_start(sidx, &strategy.name, total_strategies)?;

            let StrategySlot::Manifest(manifest) = &strategy.slot else {
                // run_inner routes Instance slots to the sequential path.
                continue;
            };
            let strategy_name = &strategy.name;

            let mut product: Vec<(usize, usize)> = Vec::new();
            for cidx in 0..configs.len() {
                for didx in 0..data_files.len() {
                    product.push((cidx, didx));
                }
            }

            pool.install(|| {
                product.par_iter().try_for_each(|&(cidx, didx)| {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    let named = &configs[cidx];
                    let data_file = &data_files[didx];
                    let mut run =
                        Run::begin(results_root, strategy_name, &named.name, data_file.clone());

                    let mut runtime = loader.load_manifest(manifest)?;
                    execute_run(
                        config, &mut runtime, &named.yaml, &run, cidx, &named.name, didx, db,
                        cancel, &serialized,
                    )?;

                    run.end_wall_time = Some(Utc::now());
                    serialized.on_run_end(&run)
                })
            })?;

            callbacks.on_strategy_end(sidx, &strategy.name, total_strategies)?;
        }
        Ok(())
    }
}

impl Default for Backtest {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a path pattern into an ordered file list.
///
/// Accepts a literal file, a directory (all files inside, sorted), or a
/// pattern whose final component contains `*` wildcards.
pub fn expand_pattern(pattern: &str) -> EngineResult<Vec<PathBuf>> {
    let path = Path::new(pattern);
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        return Ok(files);
    }

    let Some(file_pattern) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&parent)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| wildcard_match(n, file_pattern))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// `*`-only wildcard matching over one path component.
fn wildcard_match(name: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }

    let mut pos = 0;
    if !name.starts_with(parts[0]) {
        return false;
    }
    pos += parts[0].len();

    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match name[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    name.len() >= pos + last.len() && name.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("bars.parquet", "*.parquet"));
        assert!(wildcard_match("bars.parquet", "bars.*"));
        assert!(wildcard_match("bars.parquet", "*"));
        assert!(wildcard_match("aapl-2024.parquet", "aapl-*.parquet"));
        assert!(!wildcard_match("bars.csv", "*.parquet"));
        assert!(!wildcard_match("bars.parquet", "msft-*"));
        assert!(wildcard_match("exact.yaml", "exact.yaml"));
    }

    #[test]
    fn test_expand_pattern() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.parquet"), b"x").unwrap();
        std::fs::write(dir.path().join("a.parquet"), b"x").unwrap();
        std::fs::write(dir.path().join("ignore.csv"), b"x").unwrap();

        let pattern = format!("{}/*.parquet", dir.path().to_string_lossy());
        let files = expand_pattern(&pattern).unwrap();
        assert_eq!(files.len(), 2);
        // Sorted order is part of the contract.
        assert!(files[0].ends_with("a.parquet"));
        assert!(files[1].ends_with("b.parquet"));

        // A directory lists every file inside.
        let all = expand_pattern(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(all.len(), 3);

        // No match is an empty list, the caller decides whether that is
        // an error.
        let none = expand_pattern(&format!("{}/*.json", dir.path().to_string_lossy())).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_config_sources_are_exclusive() {
        let mut backtest = Backtest::new();
        backtest
            .set_config_content(vec!["initial_capital: 1".to_string()])
            .unwrap();
        let result = backtest.set_config_path("configs/*.yaml");
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::MutuallyExclusive { .. }))
        ));
    }

    #[test]
    fn test_run_requires_configuration() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let mut backtest = Backtest::new();
        let result = runtime.block_on(backtest.run(&cancel, &NoopCallbacks));
        assert!(matches!(result, Err(EngineError::Config(_))));

        backtest.initialize("initial_capital: 1000\n").unwrap();
        let result = runtime.block_on(backtest.run(&cancel, &NoopCallbacks));
        assert!(matches!(
            result,
            Err(EngineError::Setup(SetupError::NoStrategies))
        ));
    }
}
