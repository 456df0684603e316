use super::common::*;
use ai_ops::error::Error;
use ai_ops::persistence::{SessionDatabase, SessionStore};
use ai_ops::planning::{ActionStatus, ExitOutcome, Plan, PlanStatus, ResumeChoice};
use ai_ops::session::{deserialize, serialize, Message, Role, Session};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// A session with history, a halted-then-completed plan and a draft plan
async fn worked_session() -> Session {
    let engine = engine();
    let session = Session::new("acme")
        .with_system_prompt("You are a penetration testing assistant.")
        .into_shared();
    session
        .lock()
        .await
        .record(Message::new(Role::User, "Scan 10.0.0.5").with_tokens(7));

    engine
        .ingest(
            &session,
            "ACTION: nmap target=10.0.0.5\nACTION: sleeper seconds=30\nACTION: bogus x=1",
        )
        .await
        .unwrap();
    {
        let mut s = session.lock().await;
        let id = s.active_plan.clone().unwrap();
        s.plan_mut(&id).unwrap().actions[1].timeout_secs = Some(1);
    }
    engine.exec(&session).await.unwrap();
    engine.resume(&session, ResumeChoice::Skip).await.unwrap();
    engine
        .ingest(&session, "ACTION: gobuster url=http://10.0.0.5")
        .await
        .unwrap();

    let session = session.lock().await.clone();
    session
}

#[tokio::test]
async fn test_serialize_round_trip_is_identical() {
    let session = worked_session().await;
    assert_eq!(session.plans.len(), 2);
    assert_eq!(session.plans[0].status, PlanStatus::Completed);
    assert_eq!(session.plans[1].status, PlanStatus::Draft);

    let blob = serialize(&session).unwrap();
    let restored = deserialize(&blob).unwrap();
    assert_eq!(restored, session);
    assert_eq!(restored.render_prompt(), session.render_prompt());
    assert_eq!(restored.token_length(), 7);
}

#[tokio::test]
async fn test_future_version_is_refused() {
    let session = worked_session().await;
    let mut envelope: Value = serde_json::from_slice(&serialize(&session).unwrap()).unwrap();
    envelope["version"] = json!(99);
    envelope["session"]["new_field"] = json!("from the future");

    let err = deserialize(&serde_json::to_vec(&envelope).unwrap()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleSessionVersion { ref found, .. } if found == "99"));
}

#[tokio::test]
async fn test_database_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("sessions.db");
    let session = worked_session().await;

    {
        let db = SessionDatabase::connect(&path).await.unwrap();
        db.save(&session).await.unwrap();
    }

    // Reopen to make sure it hit the file
    let db = SessionDatabase::connect(&path).await.unwrap();
    let listed = db.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session.id);

    let loaded = db.load(&session.id).await.unwrap();
    assert_eq!(loaded, session);

    db.delete(&session.id).await.unwrap();
    assert!(db.list().await.unwrap().is_empty());
    assert!(matches!(
        db.load(&session.id).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_stored_plan_cannot_be_driven_twice() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");
    let first: Arc<dyn SessionStore> = Arc::new(SessionDatabase::connect(&path).await.unwrap());
    let second: Arc<dyn SessionStore> = Arc::new(SessionDatabase::connect(&path).await.unwrap());

    let session = Session::new("acme").into_shared();
    engine()
        .append(&session, action("sleeper", json!({"seconds": 60})))
        .await
        .unwrap();
    let id = session.lock().await.id.clone();
    first.save(&*session.lock().await).await.unwrap();

    // Another invocation loaded the session before the run started
    let stale = second.open(&id).await.unwrap().into_shared();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = Arc::new(engine().with_events(tx).with_store(first.clone()));
    let run = {
        let runner = runner.clone();
        let session = session.clone();
        tokio::spawn(async move { runner.exec(&session).await })
    };
    let plan_id = wait_for_action_start(&mut rx).await;

    let err = engine()
        .with_store(second.clone())
        .exec(&stale)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentExecution(_)));
    assert_eq!(
        stale.lock().await.plan(&plan_id).unwrap().status,
        PlanStatus::Draft
    );

    let stored = second.open(&id).await.unwrap();
    assert_eq!(stored.plan(&plan_id).unwrap().status, PlanStatus::Executing);
    assert_eq!(second.runner(&id).await.unwrap(), Some(std::process::id()));

    runner.cancel(&plan_id).await.unwrap();
    assert_eq!(run.await.unwrap().unwrap().status, PlanStatus::Halted);

    let stored = second.open(&id).await.unwrap();
    assert_eq!(stored.plan(&plan_id).unwrap().status, PlanStatus::Halted);
    assert_eq!(second.runner(&id).await.unwrap(), None);
}

#[tokio::test]
async fn test_plan_left_executing_by_dead_process_is_recovered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");

    let mut session = Session::new("acme");
    let plan_id = session.add_plan(
        Plan::new("plan-1").with_actions(vec![action("sleeper", json!({"seconds": 0}))]),
    );
    {
        // A process that claimed the plan and died mid-action
        let crashed = SessionDatabase::connect(&path)
            .await
            .unwrap()
            .with_runner(dead_pid());
        crashed.save(&session).await.unwrap();
        let plan = session.plan_mut(&plan_id).unwrap();
        plan.begin_execution().unwrap();
        plan.start_action(0);
        crashed
            .claim(&session, &plan_id, PlanStatus::Draft)
            .await
            .unwrap();
    }

    let store: Arc<dyn SessionStore> = Arc::new(SessionDatabase::connect(&path).await.unwrap());
    let recovered = store.open("acme").await.unwrap();
    let plan = recovered.plan(&plan_id).unwrap();
    assert_eq!(plan.status, PlanStatus::Halted);
    assert_eq!(plan.actions[0].status, ActionStatus::Failed);
    assert!(matches!(
        plan.actions[0].result.as_ref().unwrap().outcome,
        ExitOutcome::Crashed { .. }
    ));
    assert!(recovered
        .messages
        .iter()
        .any(|m| m.role == Role::Tool && m.content.contains("exited mid-run")));
    assert_eq!(store.runner(&session.id).await.unwrap(), None);

    let shared = recovered.into_shared();
    let report = engine()
        .with_store(store.clone())
        .resume(&shared, ResumeChoice::Retry)
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(
        store.load("acme").await.unwrap().plan(&plan_id).unwrap().status,
        PlanStatus::Completed
    );
}
