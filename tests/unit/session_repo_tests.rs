use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_conductor::models::session::{AgentType, Session, SessionStatus};
use agent_conductor::models::target::Target;
use agent_conductor::persistence::{db, SessionRepo, SessionStore, StatusUpdate};
use agent_conductor::AppError;

async fn repo() -> SessionRepo {
    let pool = db::connect_memory().await.expect("in-memory connect");
    SessionRepo::new(Arc::new(pool))
}

fn queued(id: &str, target: &Target) -> Session {
    Session::queued(id.into(), target, AgentType::Build, "claude".into())
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let repo = repo().await;
    let session = queued("s1", &Target::story("p1", Some("e1".into()), "u1"));

    repo.create(&session).await.expect("create");
    let fetched = repo.get("s1").await.expect("get").expect("row exists");
    assert_eq!(fetched, session);

    assert!(repo.get("missing").await.expect("get").is_none());
}

#[tokio::test]
async fn duplicate_id_is_conflict() {
    let repo = repo().await;
    let session = queued("s1", &Target::project("p1"));
    repo.create(&session).await.expect("first create");

    let err = repo.create(&session).await.expect_err("duplicate");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn update_applies_only_from_expected_status() {
    let repo = repo().await;
    repo.create(&queued("s1", &Target::project("p1")))
        .await
        .expect("create");

    let wrong = StatusUpdate::transition(SessionStatus::Running, SessionStatus::Completed);
    assert!(repo.update_status("s1", &wrong).await.expect("update").is_none());

    let t0 = Utc::now();
    let start = StatusUpdate {
        cli_session_id: Some("cli-abc".into()),
        started_at: Some(t0),
        ..StatusUpdate::transition(SessionStatus::Queued, SessionStatus::Running)
    };
    let running = repo
        .update_status("s1", &start)
        .await
        .expect("update")
        .expect("applied");
    assert_eq!(running.status, SessionStatus::Running);
    assert_eq!(running.cli_session_id.as_deref(), Some("cli-abc"));
    assert_eq!(running.started_at, Some(t0));

    // The same transition a second time misses.
    assert!(repo.update_status("s1", &start).await.expect("update").is_none());
}

#[tokio::test]
async fn timestamps_are_write_once() {
    let repo = repo().await;
    let mut session = queued("s1", &Target::project("p1"));
    let t0 = Utc::now();
    session.status = SessionStatus::Running;
    session.started_at = Some(t0);
    repo.create(&session).await.expect("create");

    let finish = StatusUpdate {
        started_at: Some(t0 + Duration::seconds(5)),
        completed_at: Some(t0 + Duration::seconds(10)),
        ..StatusUpdate::transition(SessionStatus::Running, SessionStatus::Completed)
    };
    let done = repo
        .update_status("s1", &finish)
        .await
        .expect("update")
        .expect("applied");
    assert_eq!(done.started_at, Some(t0));
    assert_eq!(done.completed_at, Some(t0 + Duration::seconds(10)));
}

#[tokio::test]
async fn listing_filters_by_status_target_and_project() {
    let repo = repo().await;
    let epic = Target::epic("p1", "e1");

    let mut done = queued("done", &epic);
    done.status = SessionStatus::Completed;
    repo.create(&done).await.expect("create");
    repo.create(&queued("live", &epic)).await.expect("create");
    repo.create(&queued("other-epic", &Target::epic("p1", "e2")))
        .await
        .expect("create");
    repo.create(&queued("other-project", &Target::project("p2")))
        .await
        .expect("create");

    let queued_ids: Vec<String> = repo
        .list_by_status(SessionStatus::Queued)
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(queued_ids, vec!["live", "other-epic", "other-project"]);

    let active = repo.list_active_for_target(&epic).await.expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "live");

    let project: Vec<String> = repo
        .list_for_project("p1")
        .await
        .expect("list")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(project, vec!["other-epic", "live", "done"]);
}

#[tokio::test]
async fn project_wide_target_does_not_match_epic_rows() {
    let repo = repo().await;
    repo.create(&queued("epic-run", &Target::epic("p1", "e1")))
        .await
        .expect("create");

    let active = repo
        .list_active_for_target(&Target::project("p1"))
        .await
        .expect("list");
    assert!(active.is_empty());
}
