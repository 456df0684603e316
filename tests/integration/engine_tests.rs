use super::common::*;
use ai_ops::error::Error;
use ai_ops::planning::{ActionStatus, ExitOutcome, Plan, PlanStatus, ResumeChoice};
use ai_ops::session::{deserialize, serialize, Role, Session};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_nmap_then_gobuster_completes_in_order() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    let proposal = r#"Start with a port scan, then enumerate the web root.
```json
[
  {"tool": "nmap", "args": {"target": "10.0.0.5"}, "thought": "find open ports"},
  {"tool": "gobuster", "args": {"url": "http://10.0.0.5"}}
]
```"#;
    let ingest = engine.ingest(&session, proposal).await.unwrap();
    assert_eq!(ingest.appended, 2);
    assert!(ingest.warnings.is_empty());

    let report = engine.exec(&session).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.executed.len(), 2);
    assert_eq!(report.executed[0].tool, "nmap");
    assert_eq!(report.executed[1].tool, "gobuster");

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    for action in &plan.actions {
        assert_eq!(action.status, ActionStatus::Completed);
        assert_eq!(action.result.as_ref().unwrap().outcome, ExitOutcome::Success);
    }
    assert!(plan.actions[1]
        .result
        .as_ref()
        .unwrap()
        .stdout
        .text
        .contains("/admin (Status: 200) http://10.0.0.5"));

    // Two result summaries, nmap first
    let summaries: Vec<&str> = session
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool && m.content.starts_with('['))
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(summaries.len(), 2);
    assert!(summaries[0].contains("nmap: success"));
    assert!(summaries[1].contains("gobuster: success"));
}

#[tokio::test]
async fn test_timeout_halts_then_skip_completes() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();
    engine
        .append(
            &session,
            action("gobuster", json!({"url": "http://10.0.0.5", "delay": 30})).with_timeout(1),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let report = engine.exec(&session).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, PlanStatus::Halted);

    {
        let session = session.lock().await;
        let plan = session.active_plan().unwrap();
        assert_eq!(plan.actions[0].status, ActionStatus::Completed);
        assert_eq!(plan.actions[1].status, ActionStatus::Failed);
        assert_eq!(
            plan.actions[1].result.as_ref().unwrap().outcome,
            ExitOutcome::Timeout
        );
        assert!(session
            .messages
            .iter()
            .any(|m| m.content.contains("halted at action #2")));
    }

    let report = engine.resume(&session, ResumeChoice::Skip).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report.executed.is_empty());

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.actions[1].status, ActionStatus::Skipped);
}

#[tokio::test]
async fn test_timeout_at_k_leaves_later_actions_pending() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("sleeper", json!({"seconds": 0})))
        .await
        .unwrap();
    engine
        .append(&session, action("sleeper", json!({"seconds": 30})).with_timeout(1))
        .await
        .unwrap();
    engine
        .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();

    let report = engine.exec(&session).await.unwrap();
    assert_eq!(report.status, PlanStatus::Halted);

    let session = session.lock().await;
    let statuses: Vec<ActionStatus> = session
        .active_plan()
        .unwrap()
        .actions
        .iter()
        .map(|a| a.status)
        .collect();
    assert_eq!(
        statuses,
        vec![ActionStatus::Completed, ActionStatus::Failed, ActionStatus::Pending]
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_data_not_failure() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine.ingest(&session, "ACTION: fail\nACTION: nmap target=10.0.0.5").await.unwrap();
    let report = engine.exec(&session).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();
    assert_eq!(plan.actions[0].status, ActionStatus::Completed);
    assert_eq!(
        plan.actions[0].result.as_ref().unwrap().outcome,
        ExitOutcome::NonZero {
            code: Some(1),
            signal: None
        }
    );
}

#[tokio::test]
async fn test_spawn_failure_halts_and_reports() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("missing", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();
    engine
        .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();

    let err = engine.exec(&session).await.unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { ref tool, .. } if tool == "missing"));

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();
    assert_eq!(plan.status, PlanStatus::Halted);
    assert_eq!(plan.actions[0].status, ActionStatus::Failed);
    assert!(matches!(
        plan.actions[0].result.as_ref().unwrap().outcome,
        ExitOutcome::Crashed { .. }
    ));
    assert_eq!(plan.actions[1].status, ActionStatus::Pending);
    assert!(session
        .messages
        .iter()
        .any(|m| m.role == Role::Tool && m.content.contains("missing: crashed")));
}

#[tokio::test]
async fn test_imported_invalid_action_is_refused_at_run_time() {
    let engine = engine();

    // Plans restored from a blob never went through `append`
    let mut session = Session::new("acme");
    session.add_plan(Plan::new("imported").with_actions(vec![
        action("nmap", json!({"target": "-oN/tmp/pwn", "bogus": 1})),
        action("nmap", json!({"target": "10.0.0.5"})),
    ]));
    let session = deserialize(&serialize(&session).unwrap())
        .unwrap()
        .into_shared();

    let err = engine.exec(&session).await.unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { ref tool, .. } if tool == "nmap"));

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();
    assert_eq!(plan.status, PlanStatus::Halted);
    assert_eq!(plan.actions[0].status, ActionStatus::Failed);
    assert_eq!(plan.actions[1].status, ActionStatus::Pending);

    let result = plan.actions[0].result.as_ref().unwrap();
    assert!(matches!(
        result.outcome,
        ExitOutcome::Crashed { ref reason } if reason.starts_with("refused")
    ));
    assert_eq!(result.pid, None);
    assert!(!result.command_line.starts_with("echo"));
    assert!(session
        .messages
        .iter()
        .any(|m| m.role == Role::Tool && m.content.contains("halted at action #1")));
}

#[tokio::test]
async fn test_retry_keeps_previous_attempt() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("sleeper", json!({"seconds": 30})).with_timeout(1))
        .await
        .unwrap();
    engine.exec(&session).await.unwrap();

    let report = engine.resume(&session, ResumeChoice::Retry).await.unwrap();
    assert_eq!(report.status, PlanStatus::Halted);
    assert_eq!(report.executed.len(), 1);

    let session = session.lock().await;
    let action = &session.active_plan().unwrap().actions[0];
    assert_eq!(action.previous_attempts.len(), 1);
    assert_eq!(action.previous_attempts[0].outcome, ExitOutcome::Timeout);
    assert_eq!(action.result.as_ref().unwrap().outcome, ExitOutcome::Timeout);
}

#[tokio::test]
async fn test_exec_rules() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    // Halted plans must be resumed, not re-executed
    engine
        .append(&session, action("sleeper", json!({"seconds": 30})).with_timeout(1))
        .await
        .unwrap();
    engine.exec(&session).await.unwrap();
    assert!(matches!(
        engine.exec(&session).await,
        Err(Error::InvalidTransition { .. })
    ));

    // Appending to a halted plan is allowed and keeps it halted
    engine
        .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();
    assert_eq!(
        session.lock().await.active_plan().unwrap().status,
        PlanStatus::Halted
    );

    // Resume only applies to halted plans
    engine.resume(&session, ResumeChoice::Skip).await.unwrap();
    assert!(matches!(
        engine.resume(&session, ResumeChoice::Skip).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_append_rejects_schema_violations() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    let err = engine
        .append(&session, action("gobuster", json!({"delay": -1, "color": "red"})))
        .await
        .unwrap_err();
    match err {
        Error::SchemaViolation { violations, .. } => {
            let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
            assert!(fields.contains(&"url"));
            assert!(fields.contains(&"delay"));
            assert!(fields.contains(&"color"));
        }
        other => panic!("expected schema violation, got {:?}", other),
    }
    assert!(session.lock().await.plans.is_empty());
}

#[tokio::test]
async fn test_output_truncation_and_structured_output() {
    let engine = engine_with(ai_ops::config::ExecutorConfig {
        max_output_bytes: 100,
        ..executor_config()
    });
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("chatty", json!({"count": 10000})))
        .await
        .unwrap();
    engine
        .append(&session, action("jsonout", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();
    engine.exec(&session).await.unwrap();

    let session = session.lock().await;
    let plan = session.active_plan().unwrap();

    let chatty = plan.actions[0].result.as_ref().unwrap();
    assert!(chatty.stdout.is_truncated());
    assert!(chatty.stdout.total_bytes > 100);
    assert!(chatty.stdout.text.contains("[OUTPUT TRUNCATED:"));

    let report = plan.actions[1].result.as_ref().unwrap();
    assert_eq!(
        report.structured,
        Some(json!({"target": "10.0.0.5", "open": [22, 80]}))
    );
}
