//! Integration tests for the retry driver with scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use mendbuild_core::fakes::{FakeProcessTable, Journal, ScriptedExecutor};
use mendbuild_core::{
    read_run_report, write_run_report, BuildDriver, BuildPlan, CapturedOutput, CommandSpec,
    ConflictScanner, ConflictSignature, DriverError, EnvironmentState, FixAction, FixRule,
    MemorySink, ProcessEntry, ProcessTable, RetryBudget, RuleSet, RunOutcome,
};
use tokio_util::sync::CancellationToken;

const HEADER_ERROR: &str = "fatal error: stdbool.h: No such file or directory";

fn setup_build() -> CommandSpec {
    CommandSpec::new(
        "setup_build",
        vec![
            "python3".to_string(),
            "setup.py".to_string(),
            "build".to_string(),
        ],
    )
}

fn header_rule() -> FixRule {
    FixRule::new(
        "std-headers",
        &["stdbool.h: No such file"],
        FixAction::PrependPath {
            var: "C_INCLUDE_PATH".to_string(),
            entries: vec!["/opt/gcc/11.5.0/include".to_string()],
            require_existing: false,
        },
    )
}

fn budget() -> RetryBudget {
    RetryBudget {
        max_attempts: 3,
        settle_delay: Duration::from_secs(2),
        backoff_step: Duration::from_secs(5),
    }
}

/// Test: a failure the rule always matches applies it on every attempt
#[tokio::test(start_paused = true)]
async fn test_always_failing_matched_rule_counts_every_attempt() {
    let exec = ScriptedExecutor::always_failing(1, HEADER_ERROR);
    let driver = BuildDriver::new(Arc::new(exec.clone()))
        .with_rules(RuleSet::new(vec![header_rule()]))
        .with_budget(budget());

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            4,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.attempts, 4);
    assert_eq!(report.fixes_applied, 4, "one fix per attempt");
    assert_eq!(report.last_output, HEADER_ERROR);
    assert_eq!(
        report.delays(),
        vec![Duration::from_secs(2); 3],
        "classified failures wait the settle delay"
    );
    // Idempotent: the entry is present exactly once.
    assert_eq!(
        report.final_env.path_entries("C_INCLUDE_PATH"),
        vec!["/opt/gcc/11.5.0/include"]
    );

    let err = report.into_result().expect_err("exhausted run is an error");
    match err {
        DriverError::Exhausted {
            attempts,
            fixes_applied,
            last_output,
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(fixes_applied, 4);
            assert!(last_output.contains("stdbool.h"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Test: fail once with a known error, then succeed with the repaired env
#[tokio::test(start_paused = true)]
async fn test_fail_once_then_succeed() {
    let exec = ScriptedExecutor::new(vec![
        CapturedOutput::exited(1, "", HEADER_ERROR),
        CapturedOutput::exited(0, "build ok", ""),
    ]);
    let driver = BuildDriver::new(Arc::new(exec.clone()))
        .with_rules(RuleSet::new(vec![header_rule()]))
        .with_budget(budget());

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::from_pairs([("C_INCLUDE_PATH", "/usr/include")]),
            5,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    assert_eq!(report.attempts, 2);
    assert_eq!(report.fixes_applied, 1);

    let calls = exec.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].env.get("C_INCLUDE_PATH"), Some("/usr/include"));
    assert_eq!(
        calls[1].env.path_entries("C_INCLUDE_PATH"),
        vec!["/opt/gcc/11.5.0/include", "/usr/include"],
        "second attempt sees the fix"
    );
}

/// Test: a single attempt never waits
#[tokio::test(start_paused = true)]
async fn test_single_attempt_has_no_delay() {
    let exec = ScriptedExecutor::always_failing(2, "something unexpected");
    let driver = BuildDriver::new(Arc::new(exec.clone())).with_budget(budget());

    let start = tokio::time::Instant::now();
    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            1,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert_eq!(report.attempts, 1);
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert!(report.delays().is_empty());
    assert_eq!(report.records[0].delay_ms, None);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(exec.calls().len(), 1);
}

/// Test: unmatched failures back off with strictly increasing delays
#[tokio::test(start_paused = true)]
async fn test_unmatched_failures_back_off() {
    let exec = ScriptedExecutor::always_failing(1, "segmentation fault");
    let driver = BuildDriver::new(Arc::new(exec))
        .with_rules(RuleSet::new(vec![header_rule()]))
        .with_budget(budget());

    let start = tokio::time::Instant::now();
    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            4,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    let delays = report.delays();
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[1] > w[0]), "{delays:?}");
    assert_eq!(report.fixes_applied, 0);
    assert!(report.final_env.is_empty());
    assert!(start.elapsed() >= delays.iter().sum::<Duration>());
}

/// Test: conflicting processes get SIGTERM before the first attempt
#[tokio::test(start_paused = true)]
async fn test_conflicts_terminated_before_first_attempt() {
    let journal = Journal::new();
    let table = FakeProcessTable::new(vec![
        ProcessEntry {
            pid: 4242,
            cmdline: "/usr/bin/python3 setup.py build --parallel 8".to_string(),
            parent: None,
        },
        ProcessEntry {
            pid: 4343,
            cmdline: "/usr/bin/python3 -m http.server".to_string(),
            parent: None,
        },
    ])
    .with_journal(journal.clone());
    let exec = ScriptedExecutor::new(vec![CapturedOutput::exited(0, "", "")])
        .with_journal(journal.clone());

    let driver = BuildDriver::new(Arc::new(exec))
        .with_budget(budget())
        .with_process_table(Arc::new(table.clone()))
        .with_conflict_scanner(ConflictScanner::new(ConflictSignature::new([
            "python", "setup.py", "build",
        ])));

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            3,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    assert_eq!(table.signals(), vec![(4242, "TERM")]);
    assert_eq!(
        journal.entries(),
        vec!["signal TERM 4242".to_string(), "exec setup_build".to_string()]
    );
    let conflicts = report.conflicts.expect("scan ran");
    assert_eq!(conflicts.terminated, vec![4242]);
    assert!(conflicts.is_clean());
}

/// Test: a process that ignores SIGTERM is killed, and one that survives
/// SIGKILL does not stop the build
#[tokio::test(start_paused = true)]
async fn test_stubborn_conflicts_escalate_then_proceed() {
    let table = FakeProcessTable::new(vec![
        ProcessEntry {
            pid: 10,
            cmdline: "ninja -C build".to_string(),
            parent: None,
        },
        ProcessEntry {
            pid: 11,
            cmdline: "ninja -C build install".to_string(),
            parent: None,
        },
    ])
    .ignoring_term(10)
    .ignoring_term(11)
    .ignoring_kill(11);
    let exec = ScriptedExecutor::new(vec![CapturedOutput::exited(0, "", "")]);
    let sink = MemorySink::new();

    let driver = BuildDriver::new(Arc::new(exec.clone()))
        .with_budget(budget())
        .with_sink(Arc::new(sink.clone()))
        .with_process_table(Arc::new(table.clone()))
        .with_conflict_scanner(
            ConflictScanner::new(ConflictSignature::new(["ninja", "build"]))
                .with_grace(Duration::from_millis(500)),
        );

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            1,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    assert_eq!(exec.calls().len(), 1);
    assert_eq!(
        table.signals(),
        vec![(10, "TERM"), (10, "KILL"), (11, "TERM"), (11, "KILL")]
    );
    let conflicts = report.conflicts.expect("scan ran");
    assert_eq!(conflicts.killed, vec![10]);
    assert_eq!(conflicts.survivors, vec![11]);
    assert!(sink
        .lines()
        .iter()
        .any(|l| l.contains("conflicting process 11 still running")));
}

/// Test: the shell that launched the driver carries the same command line
/// and is never signalled
#[tokio::test(start_paused = true)]
async fn test_conflict_scan_spares_launching_processes() {
    let entry = |pid, parent, cmdline: &str| ProcessEntry {
        pid,
        cmdline: cmdline.to_string(),
        parent: Some(parent),
    };
    let table = FakeProcessTable::new(vec![
        entry(70, 1, "make wheel PY=python3 setup.py build"),
        entry(77, 70, "sh -c mendbuild run -- python3 setup.py build"),
        entry(78, 77, "mendbuild run -- python3 setup.py build"),
        entry(90, 1, "python3 setup.py build"),
    ]);
    let exec = ScriptedExecutor::new(vec![CapturedOutput::exited(0, "", "")]);
    let mut scanner = ConflictScanner::new(ConflictSignature::new(["python3", "setup.py", "build"]));
    scanner.own_pid = 78;

    let driver = BuildDriver::new(Arc::new(exec))
        .with_budget(budget())
        .with_process_table(Arc::new(table.clone()))
        .with_conflict_scanner(scanner);

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::new(),
            1,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert_eq!(table.signals(), vec![(90, "TERM")]);
    assert!(table.is_alive(70));
    assert!(table.is_alive(77));
    assert_eq!(report.conflicts.expect("scan ran").terminated, vec![90]);
}

/// Test: cancelling while a conflict waits out its grace period still
/// escalates to SIGKILL and reaps it before reporting the cancellation
#[tokio::test(start_paused = true)]
async fn test_cancel_during_conflict_grace_still_reaps() {
    let table = FakeProcessTable::new(vec![ProcessEntry {
        pid: 31337,
        cmdline: "python3 setup.py build".to_string(),
        parent: None,
    }])
    .ignoring_term(31337);
    let exec = ScriptedExecutor::new(vec![CapturedOutput::exited(0, "", "")]);

    let driver = BuildDriver::new(Arc::new(exec.clone()))
        .with_budget(budget())
        .with_process_table(Arc::new(table.clone()))
        .with_conflict_scanner(
            ConflictScanner::new(ConflictSignature::new(["setup.py", "build"]))
                .with_grace(Duration::from_millis(500)),
        );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = driver
        .run_with_retry(&setup_build(), EnvironmentState::new(), 3, &token)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, DriverError::Cancelled { attempts: 0 }));
    assert_eq!(table.signals(), vec![(31337, "TERM"), (31337, "KILL")]);
    assert!(!table.is_alive(31337));
    assert!(exec.calls().is_empty());
}

/// Test: a matching rule whose action fails does not abort the run
#[tokio::test(start_paused = true)]
async fn test_broken_rule_does_not_abort() {
    let broken = FixRule::new(
        "qt-bin",
        &["stdbool.h"],
        FixAction::PrependPath {
            var: "PATH".to_string(),
            entries: vec!["/definitely/missing/qt/bin".to_string()],
            require_existing: true,
        },
    );
    let exec = ScriptedExecutor::new(vec![
        CapturedOutput::exited(1, "", HEADER_ERROR),
        CapturedOutput::exited(0, "", ""),
    ]);
    let driver = BuildDriver::new(Arc::new(exec))
        .with_rules(RuleSet::new(vec![broken, header_rule()]))
        .with_budget(budget());

    let report = driver
        .run_with_retry(
            &setup_build(),
            EnvironmentState::from_pairs([("PATH", "/usr/bin")]),
            3,
            &CancellationToken::new(),
        )
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    assert_eq!(report.fixes_applied, 1);
    assert_eq!(report.records[0].rule_errors.len(), 1);
    assert_eq!(report.records[0].matched_rules, vec!["qt-bin", "std-headers"]);
    assert_eq!(report.final_env.get("PATH"), Some("/usr/bin"));
}

/// Test: cancelling during the backoff wait stops the run promptly
#[tokio::test(start_paused = true)]
async fn test_cancel_during_delay() {
    let exec = ScriptedExecutor::always_failing(1, "unexpected");
    let driver = BuildDriver::new(Arc::new(exec.clone())).with_budget(RetryBudget {
        max_attempts: 3,
        settle_delay: Duration::from_secs(1),
        backoff_step: Duration::from_secs(3600),
    });
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        canceller.cancel();
    });

    let start = tokio::time::Instant::now();
    let err = driver
        .run_with_retry(&setup_build(), EnvironmentState::new(), 3, &token)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, DriverError::Cancelled { attempts: 1 }));
    assert!(start.elapsed() < Duration::from_secs(3600));
    assert_eq!(exec.calls().len(), 1);
}

/// Test: fallback steps run in order and share the repaired environment
#[tokio::test(start_paused = true)]
async fn test_plan_falls_back_until_success() {
    let journal = Journal::new();
    let table = FakeProcessTable::new(vec![ProcessEntry {
        pid: 77,
        cmdline: "python3 setup.py build".to_string(),
        parent: None,
    }])
    .with_journal(journal.clone());
    let exec = ScriptedExecutor::new(vec![
        CapturedOutput::exited(1, "", HEADER_ERROR),
        CapturedOutput::exited(1, "", HEADER_ERROR),
        CapturedOutput::exited(0, "", ""),
    ])
    .with_journal(journal.clone());

    let plan = BuildPlan::with_fallbacks(
        setup_build(),
        vec![(
            "no_limited_api".to_string(),
            vec![
                "setup.py".to_string(),
                "build".to_string(),
                "--limited-api=no".to_string(),
            ],
        )],
    );
    let driver = BuildDriver::new(Arc::new(exec.clone()))
        .with_rules(RuleSet::new(vec![header_rule()]))
        .with_budget(RetryBudget {
            max_attempts: 2,
            ..budget()
        })
        .with_process_table(Arc::new(table))
        .with_conflict_scanner(ConflictScanner::new(ConflictSignature::new([
            "setup.py", "build",
        ])));

    let report = driver
        .run_plan(&plan, EnvironmentState::new(), &CancellationToken::new())
        .await
        .expect("plan should complete");

    assert!(report.succeeded());
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].outcome, RunOutcome::Exhausted);
    assert_eq!(report.steps[1].attempts, 1);
    assert_eq!(report.total_attempts(), 3);
    assert_eq!(report.total_fixes(), 2);
    assert!(report.steps[0].conflicts.is_some());
    assert!(report.steps[1].conflicts.is_none(), "scan runs once");

    assert_eq!(
        journal.entries(),
        vec![
            "signal TERM 77",
            "exec setup_build",
            "exec setup_build",
            "exec no_limited_api",
        ]
    );
    let calls = exec.calls();
    assert_eq!(
        calls[2].env.path_entries("C_INCLUDE_PATH"),
        vec!["/opt/gcc/11.5.0/include"]
    );
}

/// Test: an empty plan is rejected before anything runs
#[tokio::test(start_paused = true)]
async fn test_empty_plan_rejected() {
    let driver = BuildDriver::new(Arc::new(ScriptedExecutor::default()));
    let err = driver
        .run_plan(
            &BuildPlan { steps: vec![] },
            EnvironmentState::new(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("empty plan");
    assert!(matches!(err, DriverError::EmptyPlan));
}

/// Test: real child process repaired by a rule, report persisted
#[cfg(unix)]
#[tokio::test]
async fn test_real_process_repaired_and_reported() {
    let script = r#"if [ -n "$WIDGET_INCLUDE" ]; then echo built; exit 0; fi
echo "widget.h: No such file or directory" >&2
exit 1"#;
    let command = CommandSpec::new(
        "widget_build",
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    )
    .with_timeout(60);
    let rule = FixRule::new(
        "widget-headers",
        &["widget.h: no such file"],
        FixAction::SetIfAbsent {
            var: "WIDGET_INCLUDE".to_string(),
            value: "/opt/widget/include".to_string(),
        },
    );
    let mut env = EnvironmentState::new();
    if let Ok(path) = std::env::var("PATH") {
        env.set("PATH", path);
    }
    let sink = MemorySink::new();

    let driver = BuildDriver::default()
        .with_rules(RuleSet::new(vec![rule]))
        .with_sink(Arc::new(sink.clone()))
        .with_budget(RetryBudget {
            max_attempts: 3,
            settle_delay: Duration::from_millis(10),
            backoff_step: Duration::from_millis(10),
        });

    let report = driver
        .run_with_retry(&command, env, 3, &CancellationToken::new())
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    assert_eq!(report.attempts, 2);
    assert!(report.last_output.contains("built"));
    assert!(sink.lines().iter().any(|l| l.contains("rule widget-headers matched")));

    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_run_report(&report, dir.path()).expect("write report");
    assert!(path.ends_with("report.json"));
    let loaded = read_run_report(&report.run_id, dir.path()).expect("read report");
    assert_eq!(loaded, report);
}
