use anyhow::anyhow;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use sweep_runner::analysis::DEFAULT_SEPARATOR;
use sweep_runner::{
    load_results, query, Experiment, FailurePolicy, Kwargs, MissingPolicy, ResultValue,
    RunOptions, Runner, SweepError, TrialOutput,
};

fn temp_output(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "sweep_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

fn trial_dirs(out: &Path) -> BTreeSet<String> {
    fs::read_dir(out)
        .expect("list output")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.bytes().all(|b| b.is_ascii_digit()))
        .collect()
}

/// Counts calls and reports `x * 10` as `result`.
fn counting(calls: Arc<AtomicUsize>) -> Arc<dyn Experiment> {
    Arc::new(move |kwargs: &Kwargs| -> anyhow::Result<TrialOutput> {
        calls.fetch_add(1, Ordering::SeqCst);
        let x = kwargs
            .get("x")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("x must be an integer"))?;
        let mut out = TrialOutput::new();
        out.insert("result".to_string(), ResultValue::from(x * 10));
        Ok(out)
    })
}

#[test]
fn rerunning_a_batch_runs_nothing() {
    let out = temp_output("resume");
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new(counting(calls.clone()), &out, RunOptions::default()).expect("runner");
    let template = json!({"x": {"_from": 0, "_to": 4}, "tag": ["a", "b"]});

    let first = runner.run_batch(&template).expect("first batch");
    assert_eq!(first.total, 8);
    assert_eq!(first.completed, 8);
    assert_eq!(calls.load(Ordering::SeqCst), 8);

    let second = runner.run_batch(&template).expect("second batch");
    assert_eq!(second.skipped, 8);
    assert_eq!(second.completed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(trial_dirs(&out).len(), 8);

    let widened = json!({"x": {"_from": 0, "_to": 5}, "tag": ["a", "b"]});
    let third = runner.run_batch(&widened).expect("widened batch");
    assert_eq!(third.completed, 2);
    assert_eq!(trial_dirs(&out).len(), 10);
    let _ = fs::remove_dir_all(out);
}

#[test]
fn parallel_batch_uses_distinct_directories() {
    let out = temp_output("parallel");
    let calls = Arc::new(AtomicUsize::new(0));
    let options = RunOptions {
        parallel: true,
        workers: Some(4),
        ..RunOptions::default()
    };
    let runner = Runner::new(counting(calls.clone()), &out, options).expect("runner");
    let summary = runner
        .run_batch(&json!({"x": {"_from": 0, "_to": 24}}))
        .expect("batch");

    assert_eq!(summary.completed, 24);
    let unique: BTreeSet<&PathBuf> = summary.trial_dirs.iter().collect();
    assert_eq!(unique.len(), 24);
    let expected: BTreeSet<String> = (1..=24).map(|i| format!("{:06}", i)).collect();
    assert_eq!(trial_dirs(&out), expected);

    let rows = load_results(&out, &["result.txt".to_string()], DEFAULT_SEPARATOR, MissingPolicy::Error)
        .expect("results");
    let mut pairs: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| {
            (
                r.columns["x"].as_i64().expect("x"),
                r.columns["result"]
                    .as_str()
                    .and_then(|text| text.parse().ok())
                    .expect("result"),
            )
        })
        .collect();
    pairs.sort();
    assert_eq!(pairs, (0..24).map(|x| (x, x * 10)).collect::<Vec<_>>());
    let _ = fs::remove_dir_all(out);
}

#[test]
fn scalar_results_are_plain_text() {
    let out = temp_output("scalar");
    let experiment: Arc<dyn Experiment> = Arc::new(|_: &Kwargs| -> anyhow::Result<TrialOutput> {
        let mut output = TrialOutput::new();
        output.insert("result".to_string(), ResultValue::from(42));
        output.insert("summary".to_string(), ResultValue::from(json!({"loss": 0.25})));
        output.insert("trace.csv".to_string(), ResultValue::from("t,v\n0,1\n"));
        Ok(output)
    });
    let runner = Runner::new(experiment, &out, RunOptions::default()).expect("runner");
    let record = runner.run_one(&json!({"a": 1})).expect("run");

    assert_eq!(fs::read_to_string(record.dir.join("result.txt")).expect("txt"), "42");
    let summary: Value =
        serde_json::from_slice(&fs::read(record.dir.join("summary.json")).expect("json"))
            .expect("parse");
    assert_eq!(summary, json!({"loss": 0.25}));
    assert_eq!(
        fs::read_to_string(record.dir.join("trace.csv")).expect("csv"),
        "t,v\n0,1\n"
    );
    let _ = fs::remove_dir_all(out);
}

#[test]
fn failures_are_recorded_then_retried() {
    let out = temp_output("retry");
    let broken = Arc::new(AtomicUsize::new(1));
    let flag = broken.clone();
    let experiment: Arc<dyn Experiment> = Arc::new(move |kwargs: &Kwargs| -> anyhow::Result<TrialOutput> {
        let x = kwargs.get("x").and_then(|v| v.as_i64()).unwrap_or_default();
        if x == 1 && flag.load(Ordering::SeqCst) == 1 {
            return Err(anyhow!("transient failure for x=1"));
        }
        Ok(TrialOutput::new())
    });
    let template = json!({"x": [0, 1, 2]});

    let runner = Runner::new(experiment.clone(), &out, RunOptions::default()).expect("runner");
    let first = runner.run_batch(&template).expect("first");
    assert_eq!((first.completed, first.failed), (2, 1));
    assert!(out.join("000002").join("err.txt").is_file());

    let again = runner.run_batch(&template).expect("again");
    assert_eq!(again.skipped, 3);

    broken.store(0, Ordering::SeqCst);
    let retry = Runner::new(
        experiment,
        &out,
        RunOptions {
            retry_failed: true,
            ..RunOptions::default()
        },
    )
    .expect("retry runner");
    let retried = retry.run_batch(&template).expect("retry");
    assert_eq!((retried.skipped, retried.completed, retried.failed), (2, 1, 0));
    assert_eq!(retried.trial_dirs, vec![out.join("000002")]);
    assert!(!out.join("000002").join("err.txt").exists());
    let _ = fs::remove_dir_all(out);
}

#[test]
fn abort_leaves_no_partial_directory() {
    let out = temp_output("abort");
    let experiment: Arc<dyn Experiment> = Arc::new(|kwargs: &Kwargs| -> anyhow::Result<TrialOutput> {
        match kwargs.get("x").and_then(|v| v.as_i64()) {
            Some(1) => Err(anyhow!("refusing x=1")),
            _ => Ok(TrialOutput::new()),
        }
    });
    let options = RunOptions {
        failure_policy: FailurePolicy::Abort,
        ..RunOptions::default()
    };
    let runner = Runner::new(experiment, &out, options).expect("runner");
    let err = runner.run_batch(&json!({"x": [0, 1, 2]})).expect_err("abort");
    assert!(matches!(err, SweepError::Trial { .. }), "{}", err);
    assert_eq!(trial_dirs(&out), BTreeSet::from(["000001".to_string()]));
    let _ = fs::remove_dir_all(out);
}

#[test]
fn malformed_templates_touch_nothing() {
    let out = temp_output("malformed");
    let runner = Runner::new(counting(Arc::new(AtomicUsize::new(0))), &out, RunOptions::default())
        .expect("runner");
    let err = runner
        .run_batch(&json!({"x": {"_from": 0, "_to": 4, "_step": 0}}))
        .expect_err("zero step");
    assert!(matches!(err, SweepError::Expansion { .. }), "{}", err);
    assert!(trial_dirs(&out).is_empty());
    let _ = fs::remove_dir_all(out);
}

#[test]
fn query_finds_trials_by_partial_config() {
    let out = temp_output("query");
    let runner = Runner::new(counting(Arc::new(AtomicUsize::new(0))), &out, RunOptions::default())
        .expect("runner");
    runner
        .run_batch(&json!({"x": [1, 2], "opt": {"lr": [0.1, 0.2]}}))
        .expect("batch");
    let found = query(&out, &json!({"opt": {"lr": 0.2}})).expect("query");
    assert_eq!(found.len(), 2);
    let _ = fs::remove_dir_all(out);
}
