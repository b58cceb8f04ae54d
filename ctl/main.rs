#![forbid(unsafe_code)]

//! `agent-conductor-ctl`: command-line client for `agent-conductor`.
//!
//! Talks to the server's HTTP API. `watch` follows the event stream and
//! falls back to polling while the stream is down.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_conductor::delivery::{ConnectionState, EventObserver, ObserverUpdate};
use agent_conductor::models::session::{AgentType, SessionStatus};
use agent_conductor::models::target::Target;
use agent_conductor::orchestrator::LaunchRequest;
use agent_conductor::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-conductor-ctl",
    about = "Command-line client for agent-conductor",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the server.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions of a project.
    List {
        /// Project id.
        #[arg(long)]
        project: String,
        /// Only sessions in this status.
        #[arg(long, value_parser = parse_status)]
        status: Option<SessionStatus>,
    },

    /// Show one session.
    Show {
        /// Session id.
        id: String,
    },

    /// Launch an agent session.
    Launch {
        /// Project id.
        #[arg(long)]
        project: String,
        /// Epic id.
        #[arg(long)]
        epic: Option<String>,
        /// User story id.
        #[arg(long)]
        story: Option<String>,
        /// Agent type (build, review, tech_check, e2e_test, chat, merge, fix).
        #[arg(long, value_parser = parse_agent_type)]
        agent_type: AgentType,
        /// Provider name.
        #[arg(long, default_value = "claude")]
        provider: String,
        /// Working directory for the agent.
        #[arg(long)]
        dir: PathBuf,
        /// Conversation id to resume.
        #[arg(long)]
        resume_id: Option<String>,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Prompt text.
        prompt: String,
    },

    /// Cancel a session.
    Cancel {
        /// Session id.
        id: String,
    },

    /// Follow live events for a project.
    Watch {
        /// Project id.
        #[arg(long)]
        project: String,
        /// Seconds between fallback polls while the stream is down.
        #[arg(long, default_value_t = 10)]
        poll_seconds: u64,
    },
}

fn parse_status(raw: &str) -> std::result::Result<SessionStatus, String> {
    SessionStatus::parse(raw).map_err(|err| err.to_string())
}

fn parse_agent_type(raw: &str) -> std::result::Result<AgentType, String> {
    AgentType::parse(raw).map_err(|err| err.to_string())
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let base = args.url.trim_end_matches('/').to_owned();
    let client = reqwest::Client::new();

    match args.command {
        Command::List { project, status } => {
            let mut query = vec![("project_id", project)];
            if let Some(status) = status {
                query.push(("status", status.as_str().to_owned()));
            }
            let request = client.get(format!("{base}/sessions")).query(&query);
            print_response(request).await
        }
        Command::Show { id } => print_response(client.get(format!("{base}/sessions/{id}"))).await,
        Command::Launch {
            project,
            epic,
            story,
            agent_type,
            provider,
            dir,
            resume_id,
            model,
            prompt,
        } => {
            let target = Target {
                project_id: project,
                epic_id: epic,
                user_story_id: story,
            };
            let mut request = LaunchRequest::new(target, agent_type, provider, prompt, dir);
            request.resume_id = resume_id;
            request.model_override = model;
            print_response(client.post(format!("{base}/sessions")).json(&request)).await
        }
        Command::Cancel { id } => {
            print_response(client.post(format!("{base}/sessions/{id}/cancel"))).await
        }
        Command::Watch {
            project,
            poll_seconds,
        } => watch(base, project, Duration::from_secs(poll_seconds)).await,
    }
}

/// Send `request` and print the JSON body, or fail with the server's error.
async fn print_response(request: reqwest::RequestBuilder) -> Result<()> {
    let response = request.send().await?;
    let status = response.status();
    let body: Value = response.json().await?;

    if status.is_success() {
        println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );
        Ok(())
    } else {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(AppError::Http(format!("{status}: {message}")))
    }
}

async fn watch(base: String, project: String, poll_interval: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let ct = CancellationToken::new();

    let observer = EventObserver::new(base, project).with_poll_interval(poll_interval);
    let observer_ct = ct.clone();
    let handle = tokio::spawn(observer.run(tx, observer_ct));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = rx.recv() => match update {
                Some(ObserverUpdate::Event(event)) => println!(
                    "{} {} {}",
                    event.timestamp.to_rfc3339(),
                    event.event_type.as_str(),
                    event.data
                ),
                Some(ObserverUpdate::Snapshot(sessions)) => {
                    for session in sessions {
                        println!("  {} {} {}", session.id, session.status, session.agent_type.as_str());
                    }
                }
                Some(ObserverUpdate::Connection(ConnectionState::Live)) => eprintln!("-- live"),
                Some(ObserverUpdate::Connection(ConnectionState::Degraded)) => {
                    eprintln!("-- stream down, polling");
                }
                None => break,
            },
        }
    }

    ct.cancel();
    handle
        .await
        .map_err(|err| AppError::Http(format!("observer task failed: {err}")))?
}
