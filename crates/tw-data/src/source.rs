use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use duckdb::types::Value;
use duckdb::{params, params_from_iter, Connection};
use rust_decimal::Decimal;
use tracing::{debug, info};

use tw_types::{DataError, EngineError, EngineResult, Interval, MarketData};

/// Where the DuckDB catalog lives for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTarget {
    Memory,
    File(PathBuf),
}

impl DbTarget {
    pub fn parse(s: &str) -> Self {
        if s == ":memory:" {
            DbTarget::Memory
        } else {
            DbTarget::File(PathBuf::from(s))
        }
    }
}

impl Default for DbTarget {
    fn default() -> Self {
        DbTarget::Memory
    }
}

/// Read-only columnar bar store for one run.
///
/// A DuckDB view is created over the data file (parquet, or CSV through
/// `read_csv_auto`) with the column contract
/// `time, symbol, open, high, low, close, volume[, id]`. Every query goes
/// through that view; the engine never mutates the underlying file. Bars
/// stream in strict `(time, file, row)` order.
pub struct BarSource {
    conn: Connection,
    has_id: bool,
    symbols: Vec<String>,
    symbol_set: HashSet<String>,
}

impl std::fmt::Debug for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarSource")
            .field("has_id", &self.has_id)
            .field("symbols", &self.symbols)
            .finish()
    }
}

fn dberr(e: duckdb::Error) -> EngineError {
    DataError::Database {
        message: e.to_string(),
    }
    .into()
}

fn us(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_us(v: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(v).ok_or_else(|| {
        DataError::InvalidSchema {
            message: format!("timestamp out of range: {}", v),
        }
        .into()
    })
}

fn decimal(v: f64, column: &str) -> EngineResult<Decimal> {
    Decimal::try_from(v).map_err(|_| {
        DataError::InvalidSchema {
            message: format!("{} value {} is not representable", column, v),
        }
        .into()
    })
}

impl BarSource {
    /// Open a source over one data file. The file is validated against the
    /// column contract; the known-symbol set is resolved eagerly so symbol
    /// checks during the run stay off the database.
    pub fn open(data_file: &Path, db: &DbTarget) -> EngineResult<Self> {
        let conn = match db {
            DbTarget::Memory => Connection::open_in_memory().map_err(dberr)?,
            DbTarget::File(path) => Connection::open(path).map_err(dberr)?,
        };

        let file_str = data_file.to_string_lossy().replace('\'', "''");
        let is_csv = data_file
            .extension()
            .map(|e| e.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);

        // src_file/src_row give the stable file-then-row tie break for
        // bars that share a timestamp.
        let view_sql = if is_csv {
            format!(
                "CREATE OR REPLACE VIEW bars AS \
                 SELECT *, filename AS src_file, row_number() OVER () AS src_row \
                 FROM read_csv_auto('{}', filename=true)",
                file_str
            )
        } else {
            format!(
                "CREATE OR REPLACE VIEW bars AS \
                 SELECT *, filename AS src_file, file_row_number AS src_row \
                 FROM read_parquet('{}', filename=true, file_row_number=true)",
                file_str
            )
        };
        conn.execute_batch(&view_sql).map_err(dberr)?;

        let mut source = Self {
            conn,
            has_id: false,
            symbols: Vec::new(),
            symbol_set: HashSet::new(),
        };
        source.inspect_schema()?;
        source.load_symbols()?;

        info!(
            file = %data_file.display(),
            symbols = source.symbols.len(),
            "opened bar source"
        );
        Ok(source)
    }

    fn inspect_schema(&mut self) -> EngineResult<()> {
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info('bars')")
            .map_err(dberr)?;
        let mut rows = stmt.query(params![]).map_err(dberr)?;

        let mut columns = HashSet::new();
        while let Some(row) = rows.next().map_err(dberr)? {
            let name: String = row.get(1).map_err(dberr)?;
            columns.insert(name.to_lowercase());
        }

        for required in ["time", "symbol", "open", "high", "low", "close", "volume"] {
            if !columns.contains(required) {
                return Err(DataError::InvalidSchema {
                    message: format!("missing required column: {}", required),
                }
                .into());
            }
        }
        self.has_id = columns.contains("id");
        Ok(())
    }

    fn load_symbols(&mut self) -> EngineResult<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT symbol FROM bars ORDER BY symbol")
            .map_err(dberr)?;
        let mut rows = stmt.query(params![]).map_err(dberr)?;
        while let Some(row) = rows.next().map_err(dberr)? {
            let symbol: String = row.get(0).map_err(dberr)?;
            self.symbol_set.insert(symbol.clone());
            self.symbols.push(symbol);
        }
        Ok(())
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.symbol_set.contains(symbol)
    }

    fn id_select(&self) -> &'static str {
        if self.has_id {
            "CAST(id AS VARCHAR)"
        } else {
            "NULL"
        }
    }

    fn row_to_bar(row: &duckdb::Row<'_>) -> EngineResult<MarketData> {
        let ts: i64 = row.get(0).map_err(dberr)?;
        let symbol: String = row.get(1).map_err(dberr)?;
        let open: f64 = row.get(2).map_err(dberr)?;
        let high: f64 = row.get(3).map_err(dberr)?;
        let low: f64 = row.get(4).map_err(dberr)?;
        let close: f64 = row.get(5).map_err(dberr)?;
        let volume: f64 = row.get(6).map_err(dberr)?;
        let id: Option<String> = row.get(7).map_err(dberr)?;

        Ok(MarketData {
            symbol,
            timestamp: from_us(ts)?,
            open: decimal(open, "open")?,
            high: decimal(high, "high")?,
            low: decimal(low, "low")?,
            close: decimal(close, "close")?,
            volume: decimal(volume, "volume")?,
            id,
        })
    }

    fn window_clause(start: Option<i64>, end: Option<i64>) -> (String, Vec<i64>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(start) = start {
            clauses.push("epoch_us(time) >= ?".to_string());
            binds.push(start);
        }
        if let Some(end) = end {
            clauses.push("epoch_us(time) <= ?".to_string());
            binds.push(end);
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (sql, binds)
    }

    /// Number of bar rows inside the (optional) time window.
    pub fn count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<u64> {
        let (clause, binds) = Self::window_clause(start.map(us), end.map(us));
        let sql = format!("SELECT count(*) FROM bars {}", clause);
        let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
        let count: i64 = stmt
            .query_row(params_from_iter(binds.iter()), |row| row.get(0))
            .map_err(dberr)?;
        Ok(count as u64)
    }

    fn fetch_chunk(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
        offset: u64,
    ) -> EngineResult<Vec<MarketData>> {
        let (clause, binds) = Self::window_clause(start, end);
        let sql = format!(
            "SELECT epoch_us(time), symbol, open, high, low, close, volume, {} \
             FROM bars {} ORDER BY time, src_file, src_row LIMIT {} OFFSET {}",
            self.id_select(),
            clause,
            limit,
            offset
        );
        let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
        let mut rows = stmt.query(params_from_iter(binds.iter())).map_err(dberr)?;

        let mut bars = Vec::with_capacity(limit);
        while let Some(row) = rows.next().map_err(dberr)? {
            bars.push(Self::row_to_bar(row)?);
        }
        Ok(bars)
    }

    /// Streaming cursor over the window in `(time, file, row)` order.
    pub fn stream(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> BarStream<'_> {
        BarStream {
            source: self,
            start: start.map(us),
            end: end.map(us),
            buffer: VecDeque::new(),
            offset: 0,
            chunk: 8192,
            done: false,
        }
    }

    /// Bars for one symbol in `[start, end]`, optionally resampled to the
    /// given interval (first/max/min/last/sum aggregation per bucket).
    pub fn get_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Option<Interval>,
    ) -> EngineResult<Vec<MarketData>> {
        if start > end {
            return Err(DataError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            }
            .into());
        }
        if !self.has_symbol(symbol) {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            }
            .into());
        }

        match interval {
            None => {
                let sql = format!(
                    "SELECT epoch_us(time), symbol, open, high, low, close, volume, {} \
                     FROM bars WHERE symbol = ? AND epoch_us(time) >= ? AND epoch_us(time) <= ? \
                     ORDER BY time, src_file, src_row",
                    self.id_select()
                );
                let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
                let mut rows = stmt
                    .query(params![symbol, us(start), us(end)])
                    .map_err(dberr)?;
                let mut bars = Vec::new();
                while let Some(row) = rows.next().map_err(dberr)? {
                    bars.push(Self::row_to_bar(row)?);
                }
                Ok(bars)
            }
            Some(interval) => {
                let sql = format!(
                    "SELECT epoch_us(time_bucket(to_seconds({}), time)) AS ts, \
                            arg_min(open, time) AS open, max(high) AS high, min(low) AS low, \
                            arg_max(close, time) AS close, sum(volume) AS volume \
                     FROM bars WHERE symbol = ? AND epoch_us(time) >= ? AND epoch_us(time) <= ? \
                     GROUP BY ts ORDER BY ts",
                    interval.as_seconds()
                );
                let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
                let mut rows = stmt
                    .query(params![symbol, us(start), us(end)])
                    .map_err(dberr)?;
                let mut bars = Vec::new();
                while let Some(row) = rows.next().map_err(dberr)? {
                    let ts: i64 = row.get(0).map_err(dberr)?;
                    bars.push(MarketData {
                        symbol: symbol.to_string(),
                        timestamp: from_us(ts)?,
                        open: decimal(row.get(1).map_err(dberr)?, "open")?,
                        high: decimal(row.get(2).map_err(dberr)?, "high")?,
                        low: decimal(row.get(3).map_err(dberr)?, "low")?,
                        close: decimal(row.get(4).map_err(dberr)?, "close")?,
                        volume: decimal(row.get(5).map_err(dberr)?, "volume")?,
                        id: None,
                    });
                }
                Ok(bars)
            }
        }
    }

    /// Last `n` bars for `symbol` at or before `at`, oldest first.
    pub fn last_n(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
        n: usize,
    ) -> EngineResult<Vec<MarketData>> {
        if !self.has_symbol(symbol) {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            }
            .into());
        }
        let sql = format!(
            "SELECT epoch_us(time), symbol, open, high, low, close, volume, {} \
             FROM bars WHERE symbol = ? AND epoch_us(time) <= ? \
             ORDER BY time DESC, src_file DESC, src_row DESC LIMIT {}",
            self.id_select(),
            n
        );
        let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
        let mut rows = stmt.query(params![symbol, us(at)]).map_err(dberr)?;
        let mut bars = Vec::new();
        while let Some(row) = rows.next().map_err(dberr)? {
            bars.push(Self::row_to_bar(row)?);
        }
        bars.reverse();
        Ok(bars)
    }

    /// Most recent bar for `symbol` at or before `at`.
    pub fn read_last(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<MarketData>> {
        if !self.has_symbol(symbol) {
            return Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            }
            .into());
        }
        let sql = format!(
            "SELECT epoch_us(time), symbol, open, high, low, close, volume, {} \
             FROM bars WHERE symbol = ? AND epoch_us(time) <= ? \
             ORDER BY time DESC, src_file DESC, src_row DESC LIMIT 1",
            self.id_select()
        );
        let mut stmt = self.conn.prepare(&sql).map_err(dberr)?;
        let mut rows = stmt.query(params![symbol, us(at)]).map_err(dberr)?;
        match rows.next().map_err(dberr)? {
            Some(row) => Ok(Some(Self::row_to_bar(row)?)),
            None => Ok(None),
        }
    }

    /// Parameterized query over the store; every field stringified.
    ///
    /// Strategies only ever see string cells, which keeps the result shape
    /// independent of the underlying column types.
    pub fn execute_sql(
        &self,
        query: &str,
        query_params: &[String],
    ) -> EngineResult<Vec<Vec<String>>> {
        debug!(query, params = query_params.len(), "executing strategy SQL");
        let mut stmt = self.conn.prepare(query).map_err(dberr)?;
        let mut rows = stmt
            .query(params_from_iter(query_params.iter()))
            .map_err(dberr)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(dberr)? {
            let n = row.as_ref().column_count();
            let mut cells = Vec::with_capacity(n);
            for i in 0..n {
                let value: Value = row.get(i).map_err(dberr)?;
                cells.push(render_value(value));
            }
            out.push(cells);
        }
        Ok(out)
    }
}

fn render_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Boolean(v) => v.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(v) => v.to_string(),
        Value::Text(v) => v,
        Value::Timestamp(unit, v) => {
            let micros = match unit {
                duckdb::types::TimeUnit::Second => v.saturating_mul(1_000_000),
                duckdb::types::TimeUnit::Millisecond => v.saturating_mul(1_000),
                duckdb::types::TimeUnit::Microsecond => v,
                duckdb::types::TimeUnit::Nanosecond => v / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| v.to_string())
        }
        other => format!("{:?}", other),
    }
}

/// Chunked cursor so a long run never holds the whole file in memory.
pub struct BarStream<'a> {
    source: &'a BarSource,
    start: Option<i64>,
    end: Option<i64>,
    buffer: VecDeque<MarketData>,
    offset: u64,
    chunk: usize,
    done: bool,
}

impl BarStream<'_> {
    pub fn next_bar(&mut self) -> EngineResult<Option<MarketData>> {
        if self.buffer.is_empty() && !self.done {
            let chunk = self
                .source
                .fetch_chunk(self.start, self.end, self.chunk, self.offset)?;
            if chunk.len() < self.chunk {
                self.done = true;
            }
            self.offset += chunk.len() as u64;
            self.buffer.extend(chunk);
        }
        Ok(self.buffer.pop_front())
    }
}
