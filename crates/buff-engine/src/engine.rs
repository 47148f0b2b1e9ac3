//! The bar-close replay loop: signal execution, position accounting,
//! fees/slippage, equity marking, and forced close-out.

use buff_data::Bar;
use buff_schemas::{
    Action, DecisionRecord, EquityPoint, TradeRecord, DECISION_SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};

use crate::metrics::{compute_metrics, EngineMetrics};
use crate::strategy::{signal_actions, Strategy};
use crate::EngineError;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: Strategy,
    pub symbol: String,
    pub timeframe: String,
    pub risk_level: i64,
    pub commission_bps: f64,
    pub slippage_bps: f64,
    pub initial_equity: f64,
}

#[derive(Debug, Clone)]
pub struct EngineResult {
    pub decisions: Vec<DecisionRecord>,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: EngineMetrics,
}

/// Position sizing: `clamp(level, 1, 5) * 0.1` of current cash.
fn risk_fraction(level: i64) -> f64 {
    level.clamp(1, 5) as f64 * 0.1
}

fn commission_cost(qty: f64, price: f64, commission_bps: f64) -> f64 {
    if commission_bps <= 0.0 {
        return 0.0;
    }
    (qty * price).abs() * (commission_bps / 10_000.0)
}

/// BUY pays up, SELL receives less.
fn apply_slippage(price: f64, is_buy: bool, slippage_bps: f64) -> f64 {
    if slippage_bps <= 0.0 {
        return price;
    }
    if is_buy {
        price * (1.0 + slippage_bps / 10_000.0)
    } else {
        price * (1.0 - slippage_bps / 10_000.0)
    }
}

/// Open-position state between bars.
struct OpenPosition {
    qty: f64,
    entry_price: f64,
    entry_time: String,
    entry_commission: f64,
}

/// Run the simulation over a validated, timeframe-aligned series.
///
/// The decision stream has exactly one record per bar with strictly
/// increasing `seq`; `run_id` is left unset for the builder to stamp.
pub fn run_engine(bars: &[Bar], config: &EngineConfig) -> Result<EngineResult, EngineError> {
    if bars.is_empty() {
        return Err(EngineError::EmptyData);
    }

    let signals = signal_actions(&config.strategy, bars)?;
    let hold_like = config.strategy.is_hold_like();
    let count = bars.len();

    let mut decisions: Vec<DecisionRecord> = Vec::with_capacity(count);
    let mut trades: Vec<TradeRecord> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(count);

    let mut cash = config.initial_equity;
    let mut position: Option<OpenPosition> = None;
    let fraction = risk_fraction(config.risk_level);

    let enter = |cash: &mut f64, position: &mut Option<OpenPosition>, price: f64, ts: DateTime<Utc>| {
        let effective = apply_slippage(price, true, config.slippage_bps);
        if effective <= 0.0 {
            return;
        }
        let qty = (*cash * fraction) / effective;
        if qty <= 0.0 {
            return;
        }
        let commission = commission_cost(qty, effective, config.commission_bps);
        *cash -= qty * effective + commission;
        *position = Some(OpenPosition {
            qty,
            entry_price: effective,
            entry_time: buff_time::format_ts(ts),
            entry_commission: commission,
        });
    };

    let exit = |cash: &mut f64,
                position: &mut Option<OpenPosition>,
                trades: &mut Vec<TradeRecord>,
                price: f64,
                ts: DateTime<Utc>| {
        let open = match position.take() {
            Some(p) if p.qty > 0.0 => p,
            other => {
                *position = other;
                return;
            }
        };
        let effective = apply_slippage(price, false, config.slippage_bps);
        let commission = commission_cost(open.qty, effective, config.commission_bps);
        *cash += open.qty * effective - commission;
        let pnl = (effective - open.entry_price) * open.qty - open.entry_commission - commission;
        trades.push(TradeRecord {
            entry_time: open.entry_time,
            entry_price: open.entry_price,
            exit_time: buff_time::format_ts(ts),
            exit_price: effective,
            qty: open.qty,
            pnl,
            fees: open.entry_commission + commission,
            side: "LONG".to_string(),
        });
    };

    for (idx, bar) in bars.iter().enumerate() {
        // Execute the previous bar's signal at this bar's open; hold-like
        // strategies are the exception and enter at bar 0's own open.
        if hold_like {
            if idx == 0 && position.is_none() {
                enter(&mut cash, &mut position, bar.open, bar.ts);
            }
        } else if idx > 0 {
            match signals[idx - 1] {
                Action::EnterLong if position.is_none() => {
                    enter(&mut cash, &mut position, bar.open, bar.ts);
                }
                Action::ExitLong if position.is_some() => {
                    exit(&mut cash, &mut position, &mut trades, bar.open, bar.ts);
                }
                _ => {}
            }
        }

        // The recorded action: signals that contradict the current position
        // collapse to HOLD; hold-like actions are fixed by bar index.
        let mut action = signals[idx];
        if !hold_like {
            match action {
                Action::EnterLong if position.is_some() => action = Action::Hold,
                Action::ExitLong if position.is_none() => action = Action::Hold,
                _ => {}
            }
        }

        let qty = position.as_ref().map(|p| p.qty).unwrap_or(0.0);
        equity_curve.push(EquityPoint {
            t: buff_time::format_ts(bar.ts),
            equity: cash + qty * bar.close,
        });

        if hold_like {
            action = if idx == 0 {
                Action::EnterLong
            } else if idx == count - 1 {
                Action::ExitLong
            } else {
                Action::Hold
            };
        }

        decisions.push(DecisionRecord {
            schema_version: DECISION_SCHEMA_VERSION.to_string(),
            run_id: None,
            seq: idx as u64,
            ts_utc: buff_time::format_ts(bar.ts),
            action,
            price: bar.close,
            symbol: config.symbol.clone(),
            timeframe: config.timeframe.clone(),
            strategy_id: config.strategy.id().to_string(),
            risk_level: config.risk_level,
        });
    }

    // Forced close-out: an open position exits at the final bar's close, the
    // final equity point becomes post-close cash, and the final decision is
    // rewritten to EXIT_LONG.
    if position.is_some() {
        let last = &bars[count - 1];
        exit(&mut cash, &mut position, &mut trades, last.close, last.ts);
        if let Some(point) = equity_curve.last_mut() {
            point.equity = cash;
        }
        if let Some(decision) = decisions.last_mut() {
            decision.action = Action::ExitLong;
        }
    }

    let metrics = compute_metrics(&equity_curve, &trades, config.initial_equity);

    Ok(EngineResult {
        decisions,
        trades,
        equity_curve,
        metrics,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_bar(i: i64, open: f64, close: f64) -> Bar {
        Bar {
            ts: buff_time::from_epoch_ms(1_700_000_040_000 + i * 60_000).unwrap(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 10.0,
        }
    }

    fn config(strategy: Strategy, risk_level: i64, commission_bps: f64, slippage_bps: f64) -> EngineConfig {
        EngineConfig {
            strategy,
            symbol: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            risk_level,
            commission_bps,
            slippage_bps,
            initial_equity: 10_000.0,
        }
    }

    /// The five-bar hold scenario: one trade, pnl = qty * (close[4] - open[0]).
    #[test]
    fn hold_five_bars_zero_costs() {
        let closes = [100.0, 100.5, 101.0, 100.8, 101.2];
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| minute_bar(i as i64, 100.0, *c))
            .collect();

        let result = run_engine(&bars, &config(Strategy::Hold, 3, 0.0, 0.0)).unwrap();

        let actions: Vec<Action> = result.decisions.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![
                Action::EnterLong,
                Action::Hold,
                Action::Hold,
                Action::Hold,
                Action::ExitLong
            ]
        );
        let seqs: Vec<u64> = result.decisions.iter().map(|d| d.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        let qty = (10_000.0 * 0.3) / 100.0;
        assert!((trade.qty - qty).abs() < 1e-12);
        assert!((trade.pnl - qty * (101.2 - 100.0)).abs() < 1e-9);
        assert_eq!(trade.fees, 0.0);
        assert_eq!(trade.side, "LONG");

        assert_eq!(result.metrics.num_records, 1);
        let expected_final = 10_000.0 + qty * (101.2 - 100.0);
        assert!((result.metrics.final_equity - expected_final).abs() < 1e-9);
        assert!(
            (result.metrics.total_return - (expected_final - 10_000.0) / 10_000.0).abs() < 1e-12
        );
    }

    #[test]
    fn final_equity_point_is_post_close_cash() {
        let bars: Vec<Bar> = (0..3).map(|i| minute_bar(i, 100.0, 100.0)).collect();
        let result = run_engine(&bars, &config(Strategy::Hold, 5, 0.0, 0.0)).unwrap();
        let last = result.equity_curve.last().unwrap();
        assert!((last.equity - result.metrics.final_equity).abs() < 1e-12);
        assert_eq!(result.decisions.last().unwrap().action, Action::ExitLong);
    }

    #[test]
    fn ma_cross_executes_on_next_open() {
        // Cross up at bar 3, back down at bar 7 (fast=2, slow=3):
        // entry fills at bar 4's open, exit at bar 8's open.
        let closes = [10.0, 10.0, 10.0, 14.0, 14.0, 14.0, 14.0, 6.0, 6.0, 6.0];
        let opens = [10.0, 10.0, 10.0, 10.0, 14.5, 14.0, 14.0, 14.0, 6.5, 6.0];
        let bars: Vec<Bar> = closes
            .iter()
            .zip(opens.iter())
            .enumerate()
            .map(|(i, (c, o))| minute_bar(i as i64, *o, *c))
            .collect();

        let result = run_engine(
            &bars,
            &config(Strategy::MaCross { fast: 2, slow: 3 }, 3, 0.0, 0.0),
        )
        .unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.entry_price, 14.5); // bar 4 open
        assert_eq!(trade.exit_price, 6.5); // bar 8 open
        assert_eq!(trade.side, "LONG");

        // The decision stream keeps the signal on the bar that produced it.
        assert_eq!(result.decisions[3].action, Action::EnterLong);
        assert_eq!(result.decisions[7].action, Action::ExitLong);
    }

    #[test]
    fn no_lookahead_future_bars_do_not_change_past_decisions() {
        let closes_a = [10.0, 10.0, 10.0, 14.0, 14.0, 14.0, 14.0, 6.0, 6.0, 6.0];
        let mut closes_b = closes_a;
        closes_b[9] = 600.0; // mutate a future bar

        let run = |closes: &[f64]| {
            let bars: Vec<Bar> = closes
                .iter()
                .enumerate()
                .map(|(i, c)| minute_bar(i as i64, *c, *c))
                .collect();
            run_engine(
                &bars,
                &config(Strategy::MaCross { fast: 2, slow: 3 }, 3, 0.0, 0.0),
            )
            .unwrap()
        };

        let a = run(&closes_a);
        let b = run(&closes_b);
        for idx in 0..8 {
            assert_eq!(a.decisions[idx].action, b.decisions[idx].action, "bar {idx}");
        }
    }

    #[test]
    fn slippage_and_commission_are_charged_both_ways() {
        let bars: Vec<Bar> = (0..3).map(|i| minute_bar(i, 100.0, 100.0)).collect();
        let result = run_engine(&bars, &config(Strategy::Hold, 3, 10.0, 25.0)).unwrap();

        let trade = &result.trades[0];
        let entry_effective = 100.0 * (1.0 + 25.0 / 10_000.0);
        let exit_effective = 100.0 * (1.0 - 25.0 / 10_000.0);
        assert!((trade.entry_price - entry_effective).abs() < 1e-12);
        assert!((trade.exit_price - exit_effective).abs() < 1e-12);
        assert!(trade.fees > 0.0);
        assert!(trade.pnl < 0.0); // flat market, costs only
    }

    #[test]
    fn risk_level_clamps_to_band() {
        let bars: Vec<Bar> = (0..2).map(|i| minute_bar(i, 100.0, 100.0)).collect();
        let low = run_engine(&bars, &config(Strategy::Hold, -3, 0.0, 0.0)).unwrap();
        let one = run_engine(&bars, &config(Strategy::Hold, 1, 0.0, 0.0)).unwrap();
        assert_eq!(low.trades[0].qty, one.trades[0].qty);

        let high = run_engine(&bars, &config(Strategy::Hold, 99, 0.0, 0.0)).unwrap();
        let five = run_engine(&bars, &config(Strategy::Hold, 5, 0.0, 0.0)).unwrap();
        assert_eq!(high.trades[0].qty, five.trades[0].qty);
    }

    #[test]
    fn empty_series_is_an_error() {
        let err = run_engine(&[], &config(Strategy::Hold, 3, 0.0, 0.0)).unwrap_err();
        assert_eq!(err, EngineError::EmptyData);
    }

    #[test]
    fn identical_input_identical_output() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| minute_bar(i, 100.0 + i as f64, 100.5 + i as f64))
            .collect();
        let cfg = config(Strategy::MaCross { fast: 2, slow: 5 }, 2, 5.0, 5.0);
        let a = run_engine(&bars, &cfg).unwrap();
        let b = run_engine(&bars, &cfg).unwrap();
        assert_eq!(a.equity_curve.len(), b.equity_curve.len());
        for (x, y) in a.equity_curve.iter().zip(b.equity_curve.iter()) {
            assert_eq!(x.equity.to_bits(), y.equity.to_bits());
        }
    }
}
