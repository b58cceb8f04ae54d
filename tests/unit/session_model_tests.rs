use agent_conductor::models::event::{Event, EventType};
use agent_conductor::models::session::{
    AgentType, OutcomeKind, Session, SessionStatus, TerminalOutcome,
};
use agent_conductor::models::target::Target;

const ALL: [SessionStatus; 5] = [
    SessionStatus::Queued,
    SessionStatus::Running,
    SessionStatus::Completed,
    SessionStatus::Failed,
    SessionStatus::Cancelled,
];

#[test]
fn only_listed_edges_are_legal() {
    let legal = [
        (SessionStatus::Queued, SessionStatus::Running),
        (SessionStatus::Queued, SessionStatus::Cancelled),
        (SessionStatus::Queued, SessionStatus::Failed),
        (SessionStatus::Running, SessionStatus::Completed),
        (SessionStatus::Running, SessionStatus::Failed),
        (SessionStatus::Running, SessionStatus::Cancelled),
    ];
    for from in ALL {
        for to in ALL {
            assert_eq!(
                from.can_transition_to(to),
                legal.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn terminal_and_live_partition_statuses() {
    for status in ALL {
        assert_ne!(status.is_terminal(), status.is_live(), "{status}");
    }
    assert!(SessionStatus::Queued.is_live());
    assert!(SessionStatus::Cancelled.is_terminal());
}

#[test]
fn status_string_form_round_trips() {
    for status in ALL {
        assert_eq!(SessionStatus::parse(status.as_str()).expect("parse"), status);
    }
    assert!(SessionStatus::parse("paused").is_err());
}

#[test]
fn outcome_maps_to_terminal_status() {
    assert_eq!(TerminalOutcome::success(None).status(), SessionStatus::Completed);
    assert_eq!(
        TerminalOutcome::failure("boom").status(),
        SessionStatus::Failed
    );
    let cancelled = TerminalOutcome::cancelled("stop");
    assert_eq!(cancelled.kind, OutcomeKind::Cancelled);
    assert_eq!(cancelled.status(), SessionStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some("stop"));
}

#[test]
fn target_keys_use_narrowest_scope() {
    assert_eq!(Target::project("p1").key().as_str(), "p1");
    assert_eq!(Target::epic("p1", "e1").key().as_str(), "p1:e1");
    assert_eq!(
        Target::story("p1", Some("e1".into()), "u1").key().as_str(),
        "p1:e1:u1"
    );
    assert_eq!(Target::story("p1", None, "u1").key().as_str(), "p1::u1");
}

#[test]
fn wider_scope_covers_narrower() {
    let project = Target::project("p1");
    let epic = Target::epic("p1", "e1");
    let story = Target::story("p1", Some("e1".into()), "u1");

    assert!(project.covers(&epic));
    assert!(project.covers(&story));
    assert!(epic.covers(&story));
    assert!(epic.covers(&epic));
    assert!(!story.covers(&epic));
    assert!(!epic.covers(&Target::epic("p1", "e2")));
    assert!(!project.covers(&Target::project("p2")));
}

#[test]
fn session_event_serializes_wire_shape() {
    let session = Session::queued(
        "s1".into(),
        &Target::epic("p1", "e1"),
        AgentType::TechCheck,
        "claude".into(),
    );
    let event = Event::for_session(EventType::SessionQueued, &session);
    let json = serde_json::to_value(&event).expect("serialize");

    assert_eq!(json["type"], "session:queued");
    assert_eq!(json["projectId"], "p1");
    assert_eq!(json["epicId"], "e1");
    assert_eq!(json["data"]["sessionId"], "s1");
    assert_eq!(json["data"]["status"], "queued");
    assert_eq!(json["data"]["agentType"], "tech_check");
    assert!(json["timestamp"].is_string());
}
