//! Run metrics derived from the equity curve and trade list.

use buff_schemas::{EquityPoint, TradeRecord};

/// Core metrics of one run; the builder extends these with identity fields
/// (symbol, strategy, costs) when assembling `metrics.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMetrics {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub num_records: u64,
    pub win_rate: f64,
    pub initial_equity: f64,
    pub final_equity: f64,
}

pub fn compute_metrics(
    equity_curve: &[EquityPoint],
    trades: &[TradeRecord],
    initial_equity: f64,
) -> EngineMetrics {
    if equity_curve.is_empty() {
        return EngineMetrics {
            total_return: 0.0,
            max_drawdown: 0.0,
            num_records: 0,
            win_rate: 0.0,
            initial_equity,
            final_equity: initial_equity,
        };
    }

    let final_equity = equity_curve[equity_curve.len() - 1].equity;
    let total_return = if initial_equity == 0.0 {
        0.0
    } else {
        (final_equity - initial_equity) / initial_equity
    };

    let mut peak = equity_curve[0].equity;
    let mut max_drawdown = 0.0;
    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        }
        let drawdown = if peak == 0.0 {
            0.0
        } else {
            (peak - point.equity) / peak
        };
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }

    let num_records = trades.len() as u64;
    let wins = trades.iter().filter(|t| t.pnl > 0.0).count() as u64;
    let win_rate = if num_records == 0 {
        0.0
    } else {
        wins as f64 / num_records as f64
    };

    EngineMetrics {
        total_return,
        max_drawdown,
        num_records,
        win_rate,
        initial_equity,
        final_equity,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
