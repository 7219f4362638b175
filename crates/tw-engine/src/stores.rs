use tw_types::{LogRecord, Mark, MarkSpec, MarketData};

/// Append-only per-run mark store; ids are strictly increasing.
#[derive(Debug, Default)]
pub struct MarkStore {
    pending: Vec<Mark>,
    next_id: u64,
}

impl MarkStore {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            next_id: 1,
        }
    }

    pub fn append(&mut self, market_data: MarketData, spec: MarkSpec) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push(Mark::from_spec(id, market_data, spec));
        id
    }

    /// Rows accumulated since the last flush.
    pub fn drain(&mut self) -> Vec<Mark> {
        std::mem::take(&mut self.pending)
    }

    pub fn total_appended(&self) -> u64 {
        self.next_id - 1
    }
}

/// Append-only per-run strategy log store.
#[derive(Debug, Default)]
pub struct LogStore {
    pending: Vec<LogRecord>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: LogRecord) {
        self.pending.push(record);
    }

    pub fn drain(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tw_types::{MarkColor, MarkLevel, MarkShape};

    fn spec() -> MarkSpec {
        MarkSpec {
            color: MarkColor::Blue,
            shape: MarkShape::Square,
            level: MarkLevel::Info,
            title: "t".to_string(),
            message: "m".to_string(),
            category: "c".to_string(),
            signal: None,
        }
    }

    fn bar() -> MarketData {
        MarketData::new("AAPL", Utc::now(), dec!(1), dec!(1), dec!(1), dec!(1), dec!(1))
    }

    #[test]
    fn test_mark_ids_increase_across_drains() {
        let mut store = MarkStore::new();
        assert_eq!(store.append(bar(), spec()), 1);
        assert_eq!(store.append(bar(), spec()), 2);
        assert_eq!(store.drain().len(), 2);
        assert_eq!(store.append(bar(), spec()), 3);
        assert_eq!(store.total_appended(), 3);
    }
}
