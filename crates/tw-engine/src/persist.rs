use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, MapBuilder, MapFieldNames, StringArray,
    StringBuilder, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use tw_types::{EngineResult, LogRecord, Mark, Order, PersistError, Trade};

use crate::stats::TradeStats;

const RETRY_ATTEMPTS: u32 = 3;

/// Retry transient persistence I/O with exponential backoff; fatal after
/// the final attempt.
fn with_retry<T, E: std::fmt::Display>(
    path: &Path,
    mut op: impl FnMut() -> Result<T, E>,
) -> EngineResult<T> {
    let mut delay = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if attempt < RETRY_ATTEMPTS => {
                warn!(path = %path.display(), attempt, %error, "write failed, retrying");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(error) => {
                return Err(PersistError::Write {
                    path: path.display().to_string(),
                    message: error.to_string(),
                }
                .into())
            }
        }
    }
}

fn f64_of(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn utc_ts(field: &str) -> Field {
    Field::new(
        field,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    )
}

fn ts_array(values: Vec<i64>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC"))
}

struct TableWriter {
    path: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
}

impl TableWriter {
    fn create(path: PathBuf, schema: SchemaRef) -> EngineResult<Self> {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = with_retry(&path, || -> Result<ArrowWriter<File>, String> {
            let file = File::create(&path).map_err(|e| e.to_string())?;
            ArrowWriter::try_new(file, schema.clone(), Some(props.clone()))
                .map_err(|e| e.to_string())
        })?;
        Ok(Self {
            path,
            schema,
            writer,
        })
    }

    fn write(&mut self, columns: Vec<ArrayRef>) -> EngineResult<()> {
        let batch = RecordBatch::try_new(self.schema.clone(), columns).map_err(|e| {
            PersistError::Flush {
                message: e.to_string(),
            }
        })?;
        self.writer.write(&batch).map_err(|e| {
            PersistError::Write {
                path: self.path.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    // Closing consumes the underlying writer, so unlike creation it gets
    // exactly one attempt.
    fn close(self) -> EngineResult<()> {
        self.writer.close().map(|_| ()).map_err(|e| {
            PersistError::Write {
                path: self.path.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

fn orders_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("side", DataType::Utf8, false),
        Field::new("quantity", DataType::Float64, false),
        Field::new("price", DataType::Float64, false),
        utc_ts("timestamp"),
        Field::new("is_completed", DataType::Boolean, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("reason", DataType::Utf8, false),
        Field::new("reason_message", DataType::Utf8, false),
        Field::new("strategy_name", DataType::Utf8, false),
        Field::new("fee", DataType::Float64, false),
        Field::new("position_type", DataType::Utf8, false),
    ]))
}

fn trades_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("order_type", DataType::Utf8, false),
        Field::new("quantity", DataType::Float64, false),
        Field::new("price", DataType::Float64, false),
        utc_ts("timestamp"),
        Field::new("is_completed", DataType::Boolean, false),
        Field::new("reason", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, false),
        Field::new("strategy_name", DataType::Utf8, false),
        Field::new("commission", DataType::Float64, false),
        utc_ts("executed_at"),
        Field::new("executed_qty", DataType::Float64, false),
        Field::new("executed_price", DataType::Float64, false),
        Field::new("pnl", DataType::Float64, false),
    ]))
}

fn marks_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("market_data_id", DataType::Utf8, false),
        Field::new("signal_type", DataType::Utf8, true),
        Field::new("signal_name", DataType::Utf8, true),
        Field::new(
            "signal_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            true,
        ),
        Field::new("signal_symbol", DataType::Utf8, true),
        Field::new("color", DataType::Utf8, false),
        Field::new("shape", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("level", DataType::Utf8, false),
    ]))
}

fn logs_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        utc_ts("timestamp"),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("level", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, false),
        Field::new_map(
            "fields",
            "entries",
            Arc::new(Field::new("keys", DataType::Utf8, false)),
            Arc::new(Field::new("values", DataType::Utf8, true)),
            false,
            false,
        ),
    ]))
}

/// The four streaming row stores of one run folder.
pub struct RunWriters {
    orders: TableWriter,
    trades: TableWriter,
    marks: TableWriter,
    logs: TableWriter,
}

impl RunWriters {
    pub const ORDERS_FILE: &'static str = "orders.parquet";
    pub const TRADES_FILE: &'static str = "trades.parquet";
    pub const MARKS_FILE: &'static str = "marks.parquet";
    pub const LOGS_FILE: &'static str = "logs.parquet";
    pub const STATS_FILE: &'static str = "stats.yaml";

    pub fn create(folder: &Path) -> EngineResult<Self> {
        Ok(Self {
            orders: TableWriter::create(folder.join(Self::ORDERS_FILE), orders_schema())?,
            trades: TableWriter::create(folder.join(Self::TRADES_FILE), trades_schema())?,
            marks: TableWriter::create(folder.join(Self::MARKS_FILE), marks_schema())?,
            logs: TableWriter::create(folder.join(Self::LOGS_FILE), logs_schema())?,
        })
    }

    pub fn append_orders(&mut self, rows: &[Order]) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|o| o.id as i64))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.symbol.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.side.to_string()))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|o| f64_of(o.quantity)))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|o| f64_of(o.price)))),
            ts_array(rows.iter().map(|o| o.timestamp.timestamp_micros()).collect()),
            Arc::new(BooleanArray::from_iter(rows.iter().map(|o| Some(o.is_completed())))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.status.to_string()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.reason.code.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.reason.message.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|o| o.strategy_name.clone()))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|o| f64_of(o.fee)))),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|o| o.position_type.to_string()),
            )),
        ];
        self.orders.write(columns)
    }

    pub fn append_trades(&mut self, rows: &[Trade]) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|t| t.order.id as i64))),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|t| t.order.symbol.clone()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|t| t.order.order_type.to_string()),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|t| f64_of(t.order.quantity)),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|t| f64_of(t.order.price)),
            )),
            ts_array(rows.iter().map(|t| t.order.timestamp.timestamp_micros()).collect()),
            Arc::new(BooleanArray::from_iter(
                rows.iter().map(|t| Some(t.order.is_completed())),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|t| t.order.reason.code.clone()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|t| t.order.reason.message.clone()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|t| t.order.strategy_name.clone()),
            )),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|t| f64_of(t.fee)))),
            ts_array(rows.iter().map(|t| t.executed_at.timestamp_micros()).collect()),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|t| f64_of(t.executed_qty)),
            )),
            Arc::new(Float64Array::from_iter_values(
                rows.iter().map(|t| f64_of(t.executed_price)),
            )),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|t| f64_of(t.pnl)))),
        ];
        self.trades.write(columns)
    }

    pub fn append_marks(&mut self, rows: &[Mark]) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let signal = |row: &Mark| row.signal.clone();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|m| m.id as i64))),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|m| m.market_data.data_id()),
            )),
            Arc::new(StringArray::from_iter(
                rows.iter().map(|m| signal(m).map(|s| s.signal_type)),
            )),
            Arc::new(StringArray::from_iter(
                rows.iter().map(|m| signal(m).map(|s| s.name)),
            )),
            Arc::new(
                TimestampMicrosecondArray::from_iter(
                    rows.iter().map(|m| signal(m).map(|s| s.time.timestamp_micros())),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(StringArray::from_iter(
                rows.iter().map(|m| signal(m).map(|s| s.symbol)),
            )),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.color.to_string()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.shape.to_string()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.title.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.message.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.category.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|m| m.level.to_string()))),
        ];
        self.marks.write(columns)
    }

    pub fn append_logs(&mut self, rows: &[LogRecord]) -> EngineResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut fields_builder = MapBuilder::new(
            Some(MapFieldNames {
                entry: "entries".to_string(),
                key: "keys".to_string(),
                value: "values".to_string(),
            }),
            StringBuilder::new(),
            StringBuilder::new(),
        );
        for row in rows {
            for (key, value) in &row.fields {
                fields_builder.keys().append_value(key);
                fields_builder.values().append_value(value);
            }
            fields_builder.append(true).map_err(|e| PersistError::Flush {
                message: e.to_string(),
            })?;
        }

        let columns: Vec<ArrayRef> = vec![
            ts_array(rows.iter().map(|r| r.timestamp.timestamp_micros()).collect()),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.symbol.clone()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.level.to_string()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.message.clone()))),
            Arc::new(fields_builder.finish()),
        ];
        self.logs.write(columns)
    }

    /// Close all four stores; empty runs still produce valid files.
    pub fn finish(self) -> EngineResult<()> {
        self.orders.close()?;
        self.trades.close()?;
        self.marks.close()?;
        self.logs.close()
    }
}

/// Serialize the per-symbol stats array next to the row stores.
pub fn write_stats(folder: &Path, stats: &[TradeStats]) -> EngineResult<PathBuf> {
    let path = folder.join(RunWriters::STATS_FILE);
    let yaml = serde_yaml::to_string(stats).map_err(|e| PersistError::Stats {
        message: e.to_string(),
    })?;
    with_retry(&path, || std::fs::write(&path, &yaml))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use duckdb::Connection;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use tw_types::{
        ExecuteOrder, LogLevel, MarkColor, MarkLevel, MarkShape, MarkSpec, MarketData, OrderStatus,
        Side,
    };

    fn query_i64(sql: &str) -> i64 {
        let conn = Connection::open_in_memory().unwrap();
        conn.prepare(sql)
            .unwrap()
            .query_row([], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_empty_run_produces_valid_files() {
        let dir = tempdir().unwrap();
        let writers = RunWriters::create(dir.path()).unwrap();
        writers.finish().unwrap();

        for file in [
            RunWriters::ORDERS_FILE,
            RunWriters::TRADES_FILE,
            RunWriters::MARKS_FILE,
            RunWriters::LOGS_FILE,
        ] {
            let path = dir.path().join(file);
            assert!(path.exists());
            let count = query_i64(&format!(
                "SELECT count(*) FROM read_parquet('{}')",
                path.to_string_lossy()
            ));
            assert_eq!(count, 0, "{file} should be empty");
        }
    }

    #[test]
    fn test_order_rows_roundtrip() {
        let dir = tempdir().unwrap();
        let mut writers = RunWriters::create(dir.path()).unwrap();

        let mut order = tw_types::Order::from_submission(
            7,
            Utc::now(),
            ExecuteOrder::market("AAPL", Side::Buy, dec!(3), dec!(150), "demo")
                .with_reason("entry", "test entry"),
        );
        order.status = OrderStatus::Filled;
        writers.append_orders(&[order]).unwrap();
        writers.finish().unwrap();

        let path = dir.path().join(RunWriters::ORDERS_FILE);
        let conn = Connection::open_in_memory().unwrap();
        let (id, status, reason): (i64, String, String) = conn
            .prepare(&format!(
                "SELECT order_id, status, reason FROM read_parquet('{}')",
                path.to_string_lossy()
            ))
            .unwrap()
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap();
        assert_eq!(id, 7);
        assert_eq!(status, "FILLED");
        assert_eq!(reason, "entry");
    }

    #[test]
    fn test_marks_and_logs_roundtrip() {
        let dir = tempdir().unwrap();
        let mut writers = RunWriters::create(dir.path()).unwrap();

        let bar = MarketData::new(
            "AAPL",
            Utc::now(),
            dec!(1),
            dec!(2),
            dec!(1),
            dec!(2),
            dec!(10),
        );
        let mark = Mark::from_spec(
            1,
            bar.clone(),
            MarkSpec {
                color: MarkColor::Red,
                shape: MarkShape::Circle,
                level: MarkLevel::Error,
                title: "Strategy Error".to_string(),
                message: "boom".to_string(),
                category: "StrategyError".to_string(),
                signal: None,
            },
        );
        writers.append_marks(&[mark]).unwrap();

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("qty".to_string(), "3".to_string());
        writers
            .append_logs(&[LogRecord {
                timestamp: bar.timestamp,
                symbol: "AAPL".to_string(),
                level: LogLevel::Info,
                message: "hello".to_string(),
                fields,
            }])
            .unwrap();
        writers.finish().unwrap();

        let marks_path = dir.path().join(RunWriters::MARKS_FILE);
        let conn = Connection::open_in_memory().unwrap();
        let (category, color, level): (String, String, String) = conn
            .prepare(&format!(
                "SELECT category, color, level FROM read_parquet('{}')",
                marks_path.to_string_lossy()
            ))
            .unwrap()
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap();
        assert_eq!(category, "StrategyError");
        assert_eq!(color, "red");
        assert_eq!(level, "ERROR");

        let logs_path = dir.path().join(RunWriters::LOGS_FILE);
        let message: String = conn
            .prepare(&format!(
                "SELECT message FROM read_parquet('{}')",
                logs_path.to_string_lossy()
            ))
            .unwrap()
            .query_row([], |row| row.get(0))
            .unwrap();
        assert_eq!(message, "hello");
    }

    #[test]
    fn test_stats_yaml() {
        let dir = tempdir().unwrap();
        let stats = vec![TradeStats {
            symbol: "AAPL".to_string(),
            strategy: crate::stats::StrategyIdent {
                id: "demo".to_string(),
                name: "Demo".to_string(),
            },
            trade_result: crate::stats::TradeResult {
                number_of_trades: 2,
                realized_pnl: dec!(10),
                max_drawdown: dec!(0),
                win_rate: dec!(1),
            },
            logs_file_path: "logs.parquet".to_string(),
            data_file_path: "bars.parquet".to_string(),
        }];
        let path = write_stats(dir.path(), &stats).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let parsed: Vec<TradeStats> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed, stats);
    }
}
