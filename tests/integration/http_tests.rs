//! HTTP surface, push channel, and the reconnecting observer.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agent_conductor::api;
use agent_conductor::delivery::{
    Backoff, ConnectionState, EventObserver, ObserverUpdate, SseDecoder, SseFrame,
};
use agent_conductor::models::event::{Event, EventType};
use agent_conductor::models::session::{AgentType, Session, SessionStatus};
use agent_conductor::models::target::Target;
use agent_conductor::orchestrator::Orchestrator;

use super::test_helpers::Harness;

struct Server {
    base: String,
    ct: CancellationToken,
    handle: JoinHandle<()>,
}

impl Server {
    async fn start(orchestrator: Arc<Orchestrator>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let ct = CancellationToken::new();
        let server_ct = ct.clone();
        let handle = tokio::spawn(async move {
            api::serve_on(listener, orchestrator, server_ct)
                .await
                .expect("serve");
        });
        Self {
            base: format!("http://{addr}"),
            ct,
            handle,
        }
    }

    async fn stop(self) {
        self.ct.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server stops")
            .expect("server task");
    }
}

/// Read frames from an open event stream until `count` have arrived.
async fn read_frames(response: reqwest::Response, count: usize) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    let mut frames = Vec::new();
    while frames.len() < count {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("chunk");
        frames.extend(decoder.push(&chunk));
    }
    frames
}

async fn next(rx: &mut mpsc::Receiver<ObserverUpdate>) -> ObserverUpdate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("update in time")
        .expect("observer running")
}

#[tokio::test]
async fn health_reports_ok() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;

    let body = reqwest::get(format!("{}/health", server.base))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "ok");

    server.stop().await;
}

#[tokio::test]
async fn event_stream_starts_with_connected_then_forwards_published_events() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/events", server.base))
        .query(&[("project_id", "p1")])
        .send()
        .await
        .expect("connect");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream")));

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    let mut frames = Vec::new();
    while frames.is_empty() {
        let chunk = body.next().await.expect("open").expect("chunk");
        frames.extend(decoder.push(&chunk));
    }
    assert_eq!(frames[0].event, "connected");
    let connected: Event = serde_json::from_str(&frames[0].data).expect("json");
    assert_eq!(connected.event_type, EventType::Connected);
    assert_eq!(connected.project_id, "p1");

    let moved = Event::new(
        EventType::TicketMoved,
        "p1",
        json!({ "ticketId": "t1", "to": "review" }),
    );
    let published: Value = client
        .post(format!("{}/events", server.base))
        .json(&moved)
        .send()
        .await
        .expect("publish")
        .json()
        .await
        .expect("json");
    assert_eq!(published["delivered"], 1);

    // Another project's event is not routed here.
    client
        .post(format!("{}/events", server.base))
        .json(&Event::new(EventType::TicketMoved, "p2", Value::Null))
        .send()
        .await
        .expect("publish");

    while frames.len() < 2 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("frame in time")
            .expect("open")
            .expect("chunk");
        frames.extend(decoder.push(&chunk));
    }
    assert_eq!(frames[1].event, "ticket:moved");
    let received: Event = serde_json::from_str(&frames[1].data).expect("json");
    assert_eq!(received, moved);

    drop(body);
    server.stop().await;
}

#[tokio::test]
async fn publishing_connected_is_rejected() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/events", server.base))
        .json(&Event::connected("p1"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn session_endpoints_report_lifecycle_and_errors() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;
    let client = reqwest::Client::new();
    let target = Target::epic("p1", "e1");

    let launched = client
        .post(format!("{}/sessions", server.base))
        .json(&h.request(target.clone(), "sleep 30"))
        .send()
        .await
        .expect("launch");
    assert_eq!(launched.status(), reqwest::StatusCode::CREATED);
    let running: Session = launched.json().await.expect("session");
    assert_eq!(running.status, SessionStatus::Running);

    let busy = client
        .post(format!("{}/sessions", server.base))
        .json(&h.request(target.clone(), "exit 0"))
        .send()
        .await
        .expect("second launch");
    assert_eq!(busy.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = busy.json().await.expect("json");
    assert_eq!(body["kind"], "already_running");
    assert_eq!(body["holdingSessionId"], running.id.as_str());
    assert_eq!(body["targetKey"], "p1:e1");

    let fetched: Session = client
        .get(format!("{}/sessions/{}", server.base, running.id))
        .send()
        .await
        .expect("get")
        .json()
        .await
        .expect("session");
    assert_eq!(fetched.id, running.id);

    let listed: Vec<Session> = client
        .get(format!("{}/sessions", server.base))
        .query(&[("project_id", "p1"), ("status", "running")])
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("sessions");
    assert_eq!(listed.len(), 1);

    let cancel_url = format!("{}/sessions/{}/cancel", server.base, running.id);
    let cancelled: Session = client
        .post(&cancel_url)
        .send()
        .await
        .expect("cancel")
        .json()
        .await
        .expect("session");
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    let again = client.post(&cancel_url).send().await.expect("cancel again");
    assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = again.json().await.expect("json");
    assert_eq!(body["kind"], "invalid_transition");
    assert_eq!(body["current"], "cancelled");

    let listed: Vec<Session> = client
        .get(format!("{}/sessions", server.base))
        .query(&[("project_id", "p1"), ("status", "running")])
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("sessions");
    assert!(listed.is_empty());

    let missing = client
        .get(format!("{}/sessions/ghost", server.base))
        .send()
        .await
        .expect("get");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let missing = client
        .post(format!("{}/sessions/ghost/cancel", server.base))
        .send()
        .await
        .expect("cancel");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn resume_rejection_maps_to_unprocessable() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;
    let mut request = h.request(Target::project("p1"), "exit 0");
    request.resume_id = Some("cli-old".into());

    let response = reqwest::Client::new()
        .post(format!("{}/sessions", server.base))
        .json(&request)
        .send()
        .await
        .expect("launch");
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["kind"], "resume_unsupported");
    assert_eq!(body["provider"], "sh");

    server.stop().await;
}

#[tokio::test]
async fn shutdown_ends_open_event_streams() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;

    let response = reqwest::Client::new()
        .get(format!("{}/events", server.base))
        .query(&[("project_id", "p1")])
        .send()
        .await
        .expect("connect");
    let frames = read_frames(response, 1).await;
    assert_eq!(frames[0].event, "connected");
    assert_eq!(h.bus.subscriber_count("p1"), 1);

    server.stop().await;
    assert_eq!(h.bus.subscriber_count("p1"), 0);
}

#[tokio::test]
async fn observer_goes_live_and_forwards_session_events() {
    let h = Harness::new().await;
    let server = Server::start(Arc::clone(&h.orchestrator)).await;
    let (tx, mut rx) = mpsc::channel(64);
    let ct = CancellationToken::new();
    let observer = tokio::spawn(EventObserver::new(&server.base, "p1").run(tx, ct.clone()));

    assert_eq!(
        next(&mut rx).await,
        ObserverUpdate::Connection(ConnectionState::Live)
    );
    match next(&mut rx).await {
        ObserverUpdate::Event(event) => assert_eq!(event.event_type, EventType::Connected),
        other => panic!("expected connected event, got {other:?}"),
    }

    let session = h
        .orchestrator
        .launch(h.request(Target::epic("p1", "e1"), "exit 0"))
        .await
        .expect("launch");

    let mut seen = Vec::new();
    while !seen.contains(&EventType::SessionCompleted) {
        match next(&mut rx).await {
            ObserverUpdate::Event(event) => {
                assert_eq!(event.data["sessionId"], session.id.as_str());
                seen.push(event.event_type);
            }
            other => panic!("unexpected update {other:?}"),
        }
    }
    assert_eq!(
        seen,
        vec![
            EventType::SessionQueued,
            EventType::SessionStarted,
            EventType::SessionCompleted
        ]
    );

    ct.cancel();
    observer.await.expect("join").expect("observer");
    server.stop().await;
}

#[tokio::test]
async fn observer_polls_listing_while_stream_is_unavailable() {
    let mut session = Session::queued(
        "s1".into(),
        &Target::project("p1"),
        AgentType::Review,
        "sh".into(),
    );
    session.status = SessionStatus::Running;
    let listing = vec![session];
    let served = listing.clone();

    // Serves the listing but has no push channel.
    let app = Router::new().route(
        "/sessions",
        get(move || {
            let served = served.clone();
            async move { Json(served) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let (tx, mut rx) = mpsc::channel(64);
    let ct = CancellationToken::new();
    let observer = tokio::spawn(
        EventObserver::new(base, "p1")
            .with_poll_interval(Duration::from_millis(50))
            .with_backoff(Backoff::new(
                Duration::from_millis(100),
                Duration::from_millis(200),
            ))
            .run(tx, ct.clone()),
    );

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("update in time");
    assert_eq!(
        first,
        Some(ObserverUpdate::Connection(ConnectionState::Degraded))
    );
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("update in time");
    assert_eq!(second, Some(ObserverUpdate::Snapshot(listing)));

    ct.cancel();
    observer.await.expect("join").expect("observer");
    server.abort();
}

/// Raw HTTP server whose event stream sends headers and then never writes.
async fn silent_stream_server() -> (String, JoinHandle<()>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            if request.starts_with(b"GET /events") {
                let head = "HTTP/1.1 200 OK\r\n\
                            content-type: text/event-stream\r\n\
                            transfer-encoding: chunked\r\n\r\n";
                let _ = socket.write_all(head.as_bytes()).await;
                held.push(socket);
            } else {
                let reply = "HTTP/1.1 200 OK\r\n\
                             content-type: application/json\r\n\
                             content-length: 2\r\n\
                             connection: close\r\n\r\n[]";
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        }
    });
    (base, handle)
}

#[tokio::test]
async fn observer_reconnects_when_stream_goes_silent() {
    let (base, server) = silent_stream_server().await;

    let (tx, mut rx) = mpsc::channel(64);
    let ct = CancellationToken::new();
    let observer = tokio::spawn(
        EventObserver::new(base, "p1")
            .with_idle_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(50))
            .with_backoff(Backoff::new(
                Duration::from_millis(100),
                Duration::from_millis(200),
            ))
            .run(tx, ct.clone()),
    );

    assert_eq!(
        next(&mut rx).await,
        ObserverUpdate::Connection(ConnectionState::Live)
    );
    // No bytes after the headers: the idle limit must trip.
    assert_eq!(
        next(&mut rx).await,
        ObserverUpdate::Connection(ConnectionState::Degraded)
    );
    assert_eq!(next(&mut rx).await, ObserverUpdate::Snapshot(Vec::new()));

    ct.cancel();
    observer.await.expect("join").expect("observer");
    server.abort();
}
