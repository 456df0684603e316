use super::common::*;
use ai_ops::error::Error;
use ai_ops::planning::{ActionStatus, ExitOutcome, PlanStatus, ResumeChoice};
use ai_ops::session::{Role, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_cancel_terminates_process_and_halts_plan() {
    let (engine, mut rx) = engine_with_events();
    let engine = Arc::new(engine);
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("sleeper", json!({"seconds": 60})))
        .await
        .unwrap();
    engine
        .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
        .await
        .unwrap();

    let run = {
        let engine = engine.clone();
        let session = session.clone();
        tokio::spawn(async move { engine.exec(&session).await })
    };

    let plan_id = wait_for_action_start(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.is_running(&plan_id).await);

    let started = Instant::now();
    engine.cancel(&plan_id).await.unwrap();
    let report = run.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, PlanStatus::Halted);
    assert!(!engine.is_running(&plan_id).await);

    let session = session.lock().await;
    let plan = session.plan(&plan_id).unwrap();
    assert_eq!(plan.status, PlanStatus::Halted);
    assert_eq!(plan.actions[0].status, ActionStatus::Failed);
    assert_eq!(plan.actions[1].status, ActionStatus::Pending);

    let result = plan.actions[0].result.as_ref().unwrap();
    assert_eq!(result.outcome, ExitOutcome::Cancelled);
    let pid = result.pid.expect("process was spawned");
    assert!(process_gone(pid), "process {} still exists", pid);

    // Once halted there is nothing left to cancel
    assert!(matches!(
        engine.cancel(&plan_id).await,
        Err(Error::NotExecuting(_))
    ));
}

#[tokio::test]
async fn test_sigterm_ignoring_process_is_killed() {
    let engine = engine();
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("stubborn", json!({"seconds": 60})).with_timeout(1))
        .await
        .unwrap();

    let started = Instant::now();
    let report = engine.exec(&session).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, PlanStatus::Halted);

    let session = session.lock().await;
    let result = session.active_plan().unwrap().actions[0]
        .result
        .clone()
        .unwrap();
    assert_eq!(result.outcome, ExitOutcome::Timeout);
    assert!(process_gone(result.pid.unwrap()));
}

#[tokio::test]
async fn test_concurrent_exec_and_append_rejected() {
    let (engine, mut rx) = engine_with_events();
    let engine = Arc::new(engine);
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("sleeper", json!({"seconds": 60})))
        .await
        .unwrap();

    let run = {
        let engine = engine.clone();
        let session = session.clone();
        tokio::spawn(async move { engine.exec(&session).await })
    };
    let plan_id = wait_for_action_start(&mut rx).await;

    assert!(matches!(
        engine.exec(&session).await,
        Err(Error::ConcurrentExecution(_))
    ));
    assert!(matches!(
        engine
            .append(&session, action("nmap", json!({"target": "10.0.0.5"})))
            .await,
        Err(Error::ConcurrentExecution(_))
    ));
    assert!(matches!(
        engine.ingest(&session, "ACTION: nmap target=10.0.0.5").await,
        Err(Error::ConcurrentExecution(_))
    ));
    {
        // The rejected proposal is explained in the history
        let session = session.lock().await;
        let last = session.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert!(last.content.contains("is executing; 1 proposed action(s) were not added"));
        assert_eq!(session.messages[session.messages.len() - 2].role, Role::Assistant);
    }
    assert!(matches!(
        session.lock().await.delete_plan(&plan_id),
        Err(Error::ConcurrentExecution(_))
    ));

    engine.cancel(&plan_id).await.unwrap();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Halted);
    assert_eq!(session.lock().await.plan(&plan_id).unwrap().actions.len(), 1);
}

#[tokio::test]
async fn test_aborted_exec_kills_process_group_and_halts_plan() {
    let (engine, mut rx) = engine_with_events();
    let engine = Arc::new(engine);
    let session = Session::new("acme").into_shared();

    engine
        .append(&session, action("stubborn", json!({"seconds": 60})))
        .await
        .unwrap();
    engine
        .append(&session, action("sleeper", json!({"seconds": 0})))
        .await
        .unwrap();

    let run = {
        let engine = engine.clone();
        let session = session.clone();
        tokio::spawn(async move { engine.exec(&session).await })
    };
    let plan_id = wait_for_action_start(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());
    assert!(!engine.is_running(&plan_id).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    let pid = loop {
        {
            let session = session.lock().await;
            let plan = session.plan(&plan_id).unwrap();
            if plan.status == PlanStatus::Halted {
                assert_eq!(plan.actions[0].status, ActionStatus::Failed);
                assert_eq!(plan.actions[1].status, ActionStatus::Pending);
                let result = plan.actions[0].result.as_ref().unwrap();
                assert_eq!(result.outcome, ExitOutcome::Cancelled);
                break result.pid.expect("process was spawned");
            }
        }
        assert!(Instant::now() < deadline, "plan never halted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let report = engine.resume(&session, ResumeChoice::Skip).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !process_gone(pid) {
        assert!(Instant::now() < deadline, "process {} survived the abort", pid);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_sessions_execute_concurrently() {
    let engine = engine();
    let first = Session::new("first").into_shared();
    let second = Session::new("second").into_shared();

    for session in [&first, &second] {
        engine
            .append(session, action("sleeper", json!({"seconds": 1})))
            .await
            .unwrap();
    }

    let started = Instant::now();
    let (a, b) = tokio::join!(engine.exec(&first), engine.exec(&second));
    let elapsed = started.elapsed();

    assert_eq!(a.unwrap().status, PlanStatus::Completed);
    assert_eq!(b.unwrap().status, PlanStatus::Completed);
    assert!(
        elapsed < Duration::from_millis(1900),
        "sessions ran one after another ({:?})",
        elapsed
    );
}
