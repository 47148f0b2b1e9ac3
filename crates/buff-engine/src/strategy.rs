//! Strategy dispatch: a closed sum type plus a pure signal pass.
//!
//! Adding a strategy is a new variant and a new arm in [`signal_actions`];
//! there is no global registry to mutate.

use buff_data::Bar;
use buff_schemas::Action;

use crate::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Enter at bar 0, exit at the final bar.
    Hold,
    /// Simple-moving-average crossover with `0 < fast < slow`.
    MaCross { fast: usize, slow: usize },
    /// Schema-stable demo strategy; trades exactly like `Hold`, the
    /// threshold is retained only in the normalized inputs.
    DemoThreshold { threshold: f64 },
}

impl Strategy {
    pub fn id(&self) -> &'static str {
        match self {
            Strategy::Hold => "hold",
            Strategy::MaCross { .. } => "ma_cross",
            Strategy::DemoThreshold { .. } => "demo_threshold",
        }
    }

    /// True for strategies that trade the buy-and-hold schedule.
    pub fn is_hold_like(&self) -> bool {
        matches!(self, Strategy::Hold | Strategy::DemoThreshold { .. })
    }
}

/// Compute the per-bar signal action for the whole series.
///
/// The returned vector has one action per bar. Execution timing (next open)
/// and position-consistency collapsing happen in the engine loop.
pub fn signal_actions(strategy: &Strategy, bars: &[Bar]) -> Result<Vec<Action>, EngineError> {
    if bars.is_empty() {
        return Err(EngineError::EmptyData);
    }
    match strategy {
        Strategy::Hold | Strategy::DemoThreshold { .. } => Ok(hold_actions(bars.len())),
        Strategy::MaCross { fast, slow } => ma_cross_actions(bars, *fast, *slow),
    }
}

fn hold_actions(count: usize) -> Vec<Action> {
    let mut actions = vec![Action::Hold; count];
    actions[0] = Action::EnterLong;
    actions[count - 1] = Action::ExitLong;
    actions
}

fn ma_cross_actions(bars: &[Bar], fast: usize, slow: usize) -> Result<Vec<Action>, EngineError> {
    if fast == 0 || slow == 0 || fast >= slow {
        return Err(EngineError::InvalidParams("ma_cross params invalid"));
    }

    let count = bars.len();
    let mut actions = vec![Action::Hold; count];
    if count < 2 {
        return Ok(actions);
    }

    let fast_ma = rolling_mean(bars, fast);
    let slow_ma = rolling_mean(bars, slow);

    // The final bar never signals; its slot is reserved for close-out.
    for idx in 1..count - 1 {
        let (pf, ps, cf, cs) = match (
            fast_ma[idx - 1],
            slow_ma[idx - 1],
            fast_ma[idx],
            slow_ma[idx],
        ) {
            (Some(pf), Some(ps), Some(cf), Some(cs)) => (pf, ps, cf, cs),
            _ => continue,
        };
        if pf <= ps && cf > cs {
            actions[idx] = Action::EnterLong;
        } else if pf >= ps && cf < cs {
            actions[idx] = Action::ExitLong;
        }
    }
    Ok(actions)
}

/// Simple moving average over closes with a full-window requirement:
/// `None` until `window` bars are available.
fn rolling_mean(bars: &[Bar], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    for idx in 0..bars.len() {
        if idx + 1 < window {
            continue;
        }
        let mut sum = 0.0;
        for bar in &bars[idx + 1 - window..=idx] {
            sum += bar.close;
        }
        out[idx] = Some(sum / window as f64);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
