use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tw_types::{Side, Trade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyIdent {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub number_of_trades: u64,
    pub realized_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
}

/// One per-symbol row of `stats.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub symbol: String,
    pub strategy: StrategyIdent,
    pub trade_result: TradeResult,
    pub logs_file_path: String,
    pub data_file_path: String,
}

/// Summarize a run's fills per symbol.
///
/// Drawdown is the largest peak-to-trough drop of the symbol's cumulative
/// realized P&L; win rate counts profitable closing (sell) fills only, so
/// entries don't drag the ratio down.
pub fn compute_stats(
    trades: &[Trade],
    strategy: &StrategyIdent,
    data_file_path: &Path,
    logs_file_path: &Path,
) -> Vec<TradeStats> {
    let mut by_symbol: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        by_symbol.entry(&trade.order.symbol).or_default().push(trade);
    }

    by_symbol
        .into_iter()
        .map(|(symbol, trades)| {
            let realized_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();

            let mut cumulative = Decimal::ZERO;
            let mut peak = Decimal::ZERO;
            let mut max_drawdown = Decimal::ZERO;
            for trade in &trades {
                cumulative += trade.pnl;
                if cumulative > peak {
                    peak = cumulative;
                }
                let drawdown = peak - cumulative;
                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
            }

            let sells: Vec<&&Trade> = trades
                .iter()
                .filter(|t| t.order.side == Side::Sell)
                .collect();
            let win_rate = if sells.is_empty() {
                Decimal::ZERO
            } else {
                let winners = sells.iter().filter(|t| t.pnl > Decimal::ZERO).count();
                Decimal::from(winners) / Decimal::from(sells.len())
            };

            TradeStats {
                symbol: symbol.to_string(),
                strategy: strategy.clone(),
                trade_result: TradeResult {
                    number_of_trades: trades.len() as u64,
                    realized_pnl,
                    max_drawdown,
                    win_rate,
                },
                logs_file_path: logs_file_path.to_string_lossy().into_owned(),
                data_file_path: data_file_path.to_string_lossy().into_owned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tw_types::{ExecuteOrder, Order};

    fn trade(symbol: &str, side: Side, pnl: Decimal) -> Trade {
        let order = Order::from_submission(
            1,
            Utc::now(),
            ExecuteOrder::market(symbol, side, dec!(1), dec!(100), "s"),
        );
        Trade {
            order,
            executed_at: Utc::now(),
            executed_qty: dec!(1),
            executed_price: dec!(100),
            fee: Decimal::ZERO,
            pnl,
        }
    }

    fn ident() -> StrategyIdent {
        StrategyIdent {
            id: "s".to_string(),
            name: "S".to_string(),
        }
    }

    #[test]
    fn test_empty_trades_yield_no_rows() {
        let stats = compute_stats(&[], &ident(), Path::new("d"), Path::new("l"));
        assert!(stats.is_empty());
    }

    #[test]
    fn test_per_symbol_grouping_and_win_rate() {
        let trades = vec![
            trade("AAPL", Side::Buy, dec!(0)),
            trade("AAPL", Side::Sell, dec!(50)),
            trade("AAPL", Side::Buy, dec!(0)),
            trade("AAPL", Side::Sell, dec!(-20)),
            trade("MSFT", Side::Buy, dec!(0)),
        ];
        let stats = compute_stats(&trades, &ident(), Path::new("d"), Path::new("l"));
        assert_eq!(stats.len(), 2);

        let aapl = &stats[0];
        assert_eq!(aapl.symbol, "AAPL");
        assert_eq!(aapl.trade_result.number_of_trades, 4);
        assert_eq!(aapl.trade_result.realized_pnl, dec!(30));
        // Peak 50 after the first sell, trough 30 after the loss.
        assert_eq!(aapl.trade_result.max_drawdown, dec!(20));
        assert_eq!(aapl.trade_result.win_rate, dec!(0.5));

        let msft = &stats[1];
        assert_eq!(msft.trade_result.number_of_trades, 1);
        assert_eq!(msft.trade_result.win_rate, Decimal::ZERO);
    }
}
