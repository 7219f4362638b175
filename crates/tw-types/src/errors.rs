use thiserror::Error;

/// Main error type for the Tradewind engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Indicator error: {0}")]
    Indicator(#[from] IndicatorError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Callback aborted run: {0}")]
    Callback(String),

    /// Returned when the cancel token fires; not treated as a failure by
    /// `on_backtest_end`.
    #[error("Backtest cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Pre-run configuration errors; the run never starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{first} and {second} are mutually exclusive")]
    MutuallyExclusive { first: String, second: String },

    #[error("Unknown broker: {name}")]
    UnknownBroker { name: String },
}

/// Fatal errors raised while assembling a run.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("No strategies loaded")]
    NoStrategies,

    #[error("No strategy configs resolved")]
    NoConfigs,

    #[error("No data files matched {pattern}")]
    NoDataFiles { pattern: String },

    #[error("Results folder not set")]
    ResultsFolderNotSet,

    #[error("Strategy load failed: {message}")]
    StrategyLoad { message: String },

    #[error("Strategy API version mismatch: host {host}, module {module}")]
    ApiVersionMismatch { host: u32, module: u32 },

    #[error("Unknown strategy identifier: {identifier}")]
    UnknownStrategy { identifier: String },
}

/// Data-source errors.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Query failed: {message}")]
    QueryFailed { message: String },

    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("Invalid data schema: {message}")]
    InvalidSchema { message: String },
}

/// Order rejections. Recovered locally: persisted as Failed orders with a
/// reason code while the strategy keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("Order quantity is not valid")]
    InvalidQuantity,

    #[error("Insufficient buying power")]
    InsufficientBuyingPower,

    #[error("Insufficient selling power")]
    InsufficientSellingPower,

    #[error("Unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("No price available for fill")]
    PriceUnavailable,

    #[error("Order not found: {id}")]
    NotFound { id: u64 },

    #[error("Order {id} is not pending")]
    NotPending { id: u64 },
}

impl OrderError {
    /// Reason code persisted on Failed order rows.
    pub fn reason_code(&self) -> &'static str {
        match self {
            OrderError::InvalidQuantity => "invalid_quantity",
            OrderError::InsufficientBuyingPower => "insufficient_buying_power",
            OrderError::InsufficientSellingPower => "insufficient_selling_power",
            OrderError::UnknownSymbol { .. } => "unknown_symbol",
            OrderError::PriceUnavailable => "price_unavailable",
            OrderError::NotFound { .. } => "order_not_found",
            OrderError::NotPending { .. } => "order_not_pending",
        }
    }
}

/// Indicator registry errors, surfaced to strategies as host error codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("Unknown indicator: {kind}")]
    UnknownKind { kind: String },

    #[error("Invalid indicator config: {message}")]
    InvalidConfig { message: String },

    #[error("Not enough history: need {needed} bars, have {got}")]
    InsufficientData { needed: usize, got: usize },
}

/// Strategy-module errors. Non-fatal per bar: recorded as a StrategyError
/// mark and the next bar is processed.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Strategy initialization failed: {message}")]
    Initialization { message: String },

    #[error("Strategy execution error: {message}")]
    Execution { message: String },

    #[error("Strategy module trapped: {message}")]
    Trap { message: String },

    #[error("Strategy exceeded memory limit of {limit_bytes} bytes")]
    MemoryLimit { limit_bytes: usize },
}

/// Artifact-writing errors; retried, fatal after the final attempt.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("Failed to flush output batch: {message}")]
    Flush { message: String },

    #[error("Failed to write stats: {message}")]
    Stats { message: String },
}

/// Result type alias for Tradewind operations
pub type EngineResult<T> = Result<T, EngineError>;
