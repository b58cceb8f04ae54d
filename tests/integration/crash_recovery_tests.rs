//! Startup reconciliation of rows left live by a dead orchestrator.

use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_conductor::models::session::{AgentType, Session, SessionStatus};
use agent_conductor::models::target::Target;
use agent_conductor::orchestrator::recovery::{RESTARTED_BEFORE_LAUNCH, RESTARTED_WHILE_RUNNING};
use agent_conductor::persistence::{db, SessionRepo, SessionStore};

use super::test_helpers::{event_types_for, record_events, Harness};

fn row(id: &str, target: &Target, status: SessionStatus) -> Session {
    let mut session = Session::queued(id.into(), target, AgentType::Build, "sh".into());
    session.status = status;
    if status == SessionStatus::Running {
        session.started_at = Some(Utc::now() - Duration::minutes(5));
    }
    session
}

#[tokio::test]
async fn reconcile_resolves_rows_from_previous_run() {
    let pool = db::connect_memory().await.expect("db");
    let repo = SessionRepo::new(Arc::new(pool.clone()));

    let running_target = Target::epic("p1", "e1");
    let queued_target = Target::epic("p1", "e2");
    repo.create(&row("running-1", &running_target, SessionStatus::Running))
        .await
        .expect("insert running");
    repo.create(&row("queued-1", &queued_target, SessionStatus::Queued))
        .await
        .expect("insert queued");
    let mut finished = row("done-1", &Target::epic("p1", "e3"), SessionStatus::Completed);
    finished.completed_at = Some(Utc::now());
    repo.create(&finished).await.expect("insert completed");

    let h = Harness::with_pool(pool);
    let (seen, _sub) = record_events(&h.bus, "p1");
    let report = h.orchestrator.reconcile().await.expect("reconcile");

    assert_eq!(report.failed, vec!["running-1".to_owned()]);
    assert_eq!(report.cancelled, vec!["queued-1".to_owned()]);
    assert!(report.inconsistent.is_empty());
    assert_eq!(report.total(), 2);

    let failed = h.orchestrator.session("running-1").await.expect("row");
    assert_eq!(failed.status, SessionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(RESTARTED_WHILE_RUNNING));
    assert!(failed.completed_at >= failed.started_at);

    let cancelled = h.orchestrator.session("queued-1").await.expect("row");
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some(RESTARTED_BEFORE_LAUNCH));

    let untouched = h.orchestrator.session("done-1").await.expect("row");
    assert_eq!(untouched, finished);

    assert_eq!(event_types_for(&seen, "running-1"), vec!["session:failed"]);
    assert_eq!(event_types_for(&seen, "queued-1"), vec!["session:failed"]);
    assert!(event_types_for(&seen, "done-1").is_empty());

    // Both targets accept new work again.
    for target in [running_target, queued_target] {
        let session = h
            .orchestrator
            .launch(h.request(target, "exit 0"))
            .await
            .expect("relaunch");
        h.wait_for_status(&session.id, SessionStatus::Completed).await;
    }
}

#[tokio::test]
async fn running_row_with_completion_time_is_forced_failed() {
    let pool = db::connect_memory().await.expect("db");
    let repo = SessionRepo::new(Arc::new(pool.clone()));
    let completed_at = Utc::now() - Duration::minutes(1);
    let mut broken = row("broken-1", &Target::project("p1"), SessionStatus::Running);
    broken.completed_at = Some(completed_at);
    repo.create(&broken).await.expect("insert");

    let h = Harness::with_pool(pool);
    let report = h.orchestrator.reconcile().await.expect("reconcile");

    assert_eq!(report.inconsistent, vec!["broken-1".to_owned()]);
    assert_eq!(report.failed, vec!["broken-1".to_owned()]);

    let session = h.orchestrator.session("broken-1").await.expect("row");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.completed_at, Some(completed_at));
}

#[tokio::test]
async fn reconcile_on_clean_store_is_a_noop() {
    let h = Harness::new().await;
    let report = h.orchestrator.reconcile().await.expect("reconcile");
    assert_eq!(report.total(), 0);

    let session = h
        .orchestrator
        .launch(h.request(Target::project("p1"), "exit 0"))
        .await
        .expect("launch");
    h.wait_for_status(&session.id, SessionStatus::Completed).await;

    let again = h.orchestrator.reconcile().await.expect("second pass");
    assert_eq!(again.total(), 0);
}
