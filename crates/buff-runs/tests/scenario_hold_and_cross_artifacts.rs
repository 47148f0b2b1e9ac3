//! Scenario: artifact contents for the two reference series.
//!
//! 1. Hold on the 5-bar sample: one round-trip, pnl = qty * (close[4] -
//!    open[0]), zero fees, and metrics derived from the forced close-out.
//! 2. MA-cross on the crafted series: entry at bar 4's open, exit at bar
//!    8's open, side LONG.
//! 3. Every float in every artifact obeys the 8-fractional-digit policy.

use std::fs;

use buff_runs::{create_run, BuildContext};
use buff_testkit::{cross_csv, hold_strategy, ma_cross_strategy, run_payload, sample_csv, Sandbox};

const USER: &str = "test-user";

fn ctx(sandbox: &Sandbox) -> BuildContext {
    BuildContext {
        runs_root: sandbox.runs_root().to_path_buf(),
        repo_root: sandbox.repo_root().to_path_buf(),
    }
}

fn read_json(sandbox: &Sandbox, run_id: &str, name: &str) -> serde_json::Value {
    let text = fs::read_to_string(sandbox.user_run_dir(USER, run_id).join(name)).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn read_jsonl(sandbox: &Sandbox, run_id: &str, name: &str) -> Vec<serde_json::Value> {
    fs::read_to_string(sandbox.user_run_dir(USER, run_id).join(name))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn hold_on_five_bar_sample() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let outcome = create_run(&ctx(&sandbox), &run_payload(&path, hold_strategy()), USER).unwrap();
    let run_id = outcome.body["run_id"].as_str().unwrap().to_string();

    let decisions = read_jsonl(&sandbox, &run_id, "decision_records.jsonl");
    assert_eq!(decisions.len(), 5);
    let actions: Vec<&str> = decisions
        .iter()
        .map(|d| d["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["ENTER_LONG", "HOLD", "HOLD", "HOLD", "EXIT_LONG"]);

    let trades = read_jsonl(&sandbox, &run_id, "trades.jsonl");
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    let qty = trade["qty"].as_f64().unwrap();
    // Sized at 30% of 10k cash at open price 100.
    assert!((qty - 30.0).abs() < 1e-6);
    let expected_pnl = qty * (101.2 - 100.0);
    assert!((trade["pnl"].as_f64().unwrap() - expected_pnl).abs() < 1e-6);
    assert_eq!(trade["fees"].as_f64().unwrap(), 0.0);
    assert_eq!(trade["side"], "LONG");

    let metrics = read_json(&sandbox, &run_id, "metrics.json");
    assert_eq!(metrics["num_trades"], 1);
    assert_eq!(metrics["num_records"], 1);
    assert_eq!(metrics["initial_equity"].as_f64().unwrap(), 10_000.0);
    let final_equity = metrics["final_equity"].as_f64().unwrap();
    let total_return = metrics["total_return"].as_f64().unwrap();
    assert!((total_return - (final_equity - 10_000.0) / 10_000.0).abs() < 1e-8);
    assert_eq!(metrics["strategy_id"], "hold");
    assert_eq!(metrics["symbol"], "BTCUSDT");

    // Equity curve ends at post-close cash == final_equity.
    let curve = read_json(&sandbox, &run_id, "equity_curve.json");
    let last = curve.as_array().unwrap().last().unwrap();
    assert!((last["equity"].as_f64().unwrap() - final_equity).abs() < 1e-8);

    let manifest = read_json(&sandbox, &run_id, "manifest.json");
    assert_eq!(manifest["execution_mode"], "SIM_ONLY");
    assert_eq!(
        manifest["capabilities"],
        serde_json::json!(["SIMULATION", "DATA_READONLY"])
    );
    assert_eq!(manifest["created_at"], "2024-01-01T00:00:00.000Z");
    assert_eq!(
        manifest["status_history"],
        serde_json::json!(["CREATED", "VALIDATED", "RUNNING", "COMPLETED"])
    );
    assert_eq!(manifest["meta"]["owner_user_id"], USER);
}

#[test]
fn ma_cross_enters_and_exits_on_next_open() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/cross.csv", &cross_csv());
    let outcome = create_run(
        &ctx(&sandbox),
        &run_payload(&path, ma_cross_strategy(2, 3)),
        USER,
    )
    .unwrap();
    let run_id = outcome.body["run_id"].as_str().unwrap().to_string();

    let trades = read_jsonl(&sandbox, &run_id, "trades.jsonl");
    assert!(!trades.is_empty());
    let trade = &trades[0];
    assert_eq!(trade["side"], "LONG");
    assert_eq!(trade["entry_price"].as_f64().unwrap(), 14.5); // bar 4 open
    assert_eq!(trade["exit_price"].as_f64().unwrap(), 6.5); // bar 8 open

    let decisions = read_jsonl(&sandbox, &run_id, "decision_records.jsonl");
    assert_eq!(decisions[3]["action"], "ENTER_LONG");
    assert_eq!(decisions[7]["action"], "EXIT_LONG");
}

#[test]
fn all_emitted_floats_respect_the_numeric_policy() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/cross.csv", &cross_csv());
    let mut payload = run_payload(&path, ma_cross_strategy(2, 3));
    payload["costs"] = serde_json::json!({"commission_bps": 7.5, "slippage_bps": 3.25});
    let outcome = create_run(&ctx(&sandbox), &payload, USER).unwrap();
    let run_id = outcome.body["run_id"].as_str().unwrap().to_string();

    let run_dir = sandbox.user_run_dir(USER, &run_id);
    for entry in fs::read_dir(&run_dir).unwrap().flatten() {
        let text = fs::read_to_string(entry.path()).unwrap();
        for token in text
            .split(|c: char| c == ',' || c == '}' || c == ']' || c == '\n')
            .filter(|t| !t.is_empty())
        {
            // Crude but effective: decimal tails after a '.' are at most 8
            // digits and exponent notation never appears outside strings.
            if let Some(dot) = token.rfind('.') {
                let tail: String = token[dot + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                assert!(
                    tail.len() <= 8,
                    "more than 8 fractional digits in {token:?} of {:?}",
                    entry.file_name()
                );
            }
        }
    }
}
