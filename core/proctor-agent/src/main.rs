//! proctor-agent: candidate and mentor client for the proctoring daemon.
//!
//! ## Subcommands
//!
//! - `monitor`: Signal producer, reads detector output and DOM events from stdin
//! - `publish` / `watch`: Video relay producer and viewer
//! - `start`, `report`, `end`, `settings`, `review-status`, `request-review`,
//!   `decide`, `sessions`, `terminate`, `health`: one-shot daemon calls

mod daemon_client;
mod logging;
mod sampler;
mod signals;
mod stream;

use clap::{Parser, Subcommand};
use proctor_protocol::{Decision, Identity, Role, Severity, ViolationParams};
use serde::Serialize;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use daemon_client::{AgentError, DaemonClient};
use sampler::{Monitor, MonitorExit, MonitorOptions};
use stream::{PublishExit, PublishOptions};

const DEFAULT_FRAME_INTERVAL_SECS: u64 = 2;

#[derive(Parser)]
#[command(name = "proctor-agent")]
#[command(about = "Exam proctoring client")]
#[command(version)]
struct Cli {
    /// Caller user id sent as the request identity
    #[arg(long, global = true)]
    user: Option<String>,

    /// Caller role (candidate, mentor, admin)
    #[arg(long, global = true, value_parser = parse_role, default_value = "candidate")]
    role: Role,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sampling loop over detector output read from stdin
    Monitor {
        #[arg(long)]
        exam: String,

        /// Existing session to monitor; a new one is started when absent
        #[arg(long)]
        session: Option<String>,
    },

    /// Start a proctoring session
    Start {
        #[arg(long)]
        exam: String,

        /// Pre-exam environment check as a JSON object
        #[arg(long)]
        environment_check: Option<String>,
    },

    /// Report a single violation
    Report {
        #[arg(long)]
        session: String,

        #[arg(long = "type")]
        violation_type: String,

        #[arg(long, value_parser = parse_severity)]
        severity: Severity,

        #[arg(long)]
        description: Option<String>,
    },

    /// End a session normally
    End {
        #[arg(long)]
        session: String,
    },

    /// Show the proctoring settings of an exam
    Settings {
        #[arg(long)]
        exam: String,
    },

    /// Show a full session record
    Session {
        #[arg(long)]
        session: String,
    },

    /// Show the review state of a session
    ReviewStatus {
        #[arg(long)]
        session: String,
    },

    /// Ask for a mentor review of a blocked session
    RequestReview {
        #[arg(long)]
        session: String,

        #[arg(long)]
        reason: String,
    },

    /// Approve or reject a pending review (mentor/admin)
    Decide {
        #[arg(long)]
        session: String,

        #[arg(long, value_parser = parse_decision)]
        decision: Decision,

        #[arg(long)]
        comments: Option<String>,
    },

    /// List live sessions for the mentor dashboard
    Sessions,

    /// Stop a candidate's exam (mentor/admin)
    Terminate {
        #[arg(long)]
        session: String,

        #[arg(long)]
        reason: String,
    },

    /// Stream image files from a directory as the session's video feed
    Publish {
        #[arg(long)]
        session: String,

        #[arg(long)]
        dir: PathBuf,

        /// Seconds between frames; defaults to the exam's frame interval
        #[arg(long)]
        interval: Option<u64>,

        /// Exam whose settings supply the frame interval
        #[arg(long)]
        exam: Option<String>,

        /// Cycle through the frames until stopped
        #[arg(long)]
        repeat: bool,
    },

    /// Watch a session's video feed (mentor/admin)
    Watch {
        #[arg(long)]
        session: String,

        #[arg(long)]
        viewer: Option<String>,
    },

    /// Check daemon health
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let identity = cli.user.clone().map(|user_id| Identity {
        user_id,
        role: cli.role,
    });
    let client = match DaemonClient::new(identity) {
        Ok(client) => client,
        Err(err) => exit_with(&err),
    };

    if let Err(err) = run(&client, cli.command) {
        exit_with(&err);
    }
}

fn run(client: &DaemonClient, command: Commands) -> Result<(), AgentError> {
    match command {
        Commands::Monitor { exam, session } => monitor(client, &exam, session),
        Commands::Start {
            exam,
            environment_check,
        } => {
            let check = environment_check
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?;
            print_json(&client.start_session(&exam, check)?)
        }
        Commands::Report {
            session,
            violation_type,
            severity,
            description,
        } => {
            let params = ViolationParams {
                session_id: session,
                violation_type,
                severity,
                description,
                metadata: Some(serde_json::json!({
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "user_agent": signals::user_agent(),
                    "source": "manual",
                })),
            };
            print_json(&client.record_violation(&params)?)
        }
        Commands::End { session } => print_json(&client.end_session(&session)?),
        Commands::Settings { exam } => print_json(&client.session_settings(&exam)?),
        Commands::Session { session } => print_json(&client.get_session(&session)?),
        Commands::ReviewStatus { session } => print_json(&client.review_status(&session)?),
        Commands::RequestReview { session, reason } => {
            print_json(&client.request_review(&session, &reason)?)
        }
        Commands::Decide {
            session,
            decision,
            comments,
        } => print_json(&client.decide_review(&session, decision, comments)?),
        Commands::Sessions => print_json(&client.active_sessions()?),
        Commands::Terminate { session, reason } => {
            print_json(&client.terminate_exam(&session, &reason)?)
        }
        Commands::Publish {
            session,
            dir,
            interval,
            exam,
            repeat,
        } => {
            let interval_secs = match (interval, exam) {
                (Some(secs), _) => secs,
                (None, Some(exam)) => client.session_settings(&exam)?.frame_interval_secs,
                (None, None) => DEFAULT_FRAME_INTERVAL_SECS,
            };
            let frames = stream::collect_frames(&dir)?;
            let options = PublishOptions {
                interval: Duration::from_secs(interval_secs.max(1)),
                repeat,
            };
            let exit = stream::publish(client, &session, &frames, &options, Arc::new(AtomicBool::new(false)))?;
            match exit {
                PublishExit::Terminated { reason } => {
                    eprintln!("Your exam was ended by a mentor: {}", reason);
                    std::process::exit(2);
                }
                PublishExit::Disconnected => {
                    eprintln!("Relay connection closed by the daemon");
                    std::process::exit(1);
                }
                PublishExit::Finished { frames } => {
                    print_json(&serde_json::json!({ "session_id": session, "frames": frames }))
                }
                PublishExit::Cancelled => Ok(()),
            }
        }
        Commands::Watch { session, viewer } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            stream::watch(client, &session, viewer.as_deref(), &mut out).map(|_| ())
        }
        Commands::Health => print_json(&client.health()?),
    }
}

fn monitor(client: &DaemonClient, exam: &str, session: Option<String>) -> Result<(), AgentError> {
    let settings = client.session_settings(exam)?;
    if !settings.proctoring_enabled {
        tracing::info!(exam_id = exam, "Proctoring disabled for exam; nothing to monitor");
        return print_json(&settings);
    }

    let session_id = match session {
        Some(session_id) => session_id,
        None => client.start_session(exam, None)?.session_id,
    };
    print_json(&serde_json::json!({ "session_id": session_id }))?;

    let options = MonitorOptions::from_settings(&settings);
    let input = BufReader::new(std::io::stdin());
    let exit = Monitor::new(client, &session_id, options, Arc::new(AtomicBool::new(false))).run(input)?;
    tracing::info!(session_id = %session_id, exit = ?exit, "Monitoring stopped");

    match exit {
        MonitorExit::Rejected | MonitorExit::Terminated => {
            eprintln!("Your exam session was ended after mentor review.");
            std::process::exit(2);
        }
        MonitorExit::InputClosed(status) => {
            print_json(&serde_json::json!({ "session_id": session_id, "status": status }))
        }
        MonitorExit::Completed | MonitorExit::Cancelled => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AgentError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_with(err: &AgentError) -> ! {
    tracing::error!(error = %err, "proctor-agent failed");
    eprintln!("error: {}", err);
    std::process::exit(1);
}

fn parse_role(value: &str) -> Result<Role, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown role '{}' (expected candidate, mentor or admin)", value))
}

fn parse_severity(value: &str) -> Result<Severity, String> {
    Severity::parse(value)
        .ok_or_else(|| format!("unknown severity '{}' (expected low, medium, high or critical)", value))
}

fn parse_decision(value: &str) -> Result<Decision, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown decision '{}' (expected approve or reject)", value))
}
