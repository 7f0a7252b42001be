mod cli;

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use conductor_eventbus::EventSubscription;
use conductor_protocol::error::ConductorError;
use conductor_protocol::event::ConductorEvent;
use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
use conductor_protocol::session::{SessionCommand, SessionDate, SessionState};
use conductor_runtime::{Conductor, ConductorSettings};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::cli::{CliCommand, parse_cli_args, print_cli_help};

/// How long a killed session waits for a replacement before `run` exits.
const RETRY_FOLLOW_WINDOW: Duration = Duration::from_secs(3);
const KILLED_EXIT_CODE: i32 = 137;

#[tokio::main]
async fn main() -> Result<()> {
    let command = parse_cli_args(std::env::args().skip(1))?;
    if command == CliCommand::Help {
        print_cli_help();
        return Ok(());
    }

    let config = conductor_config::load_from_env()?;
    init_file_logging(&config.persistence.log_path())?;
    let settings = ConductorSettings::from_config(&config)?;
    let conductor = Conductor::start_with_pty(settings, None).await?;

    let outcome = dispatch(&conductor, command).await;
    let shutdown = conductor.shutdown().await;
    tracing::debug!(
        snapshots_saved = shutdown.snapshots_saved,
        sessions_destroyed = shutdown.sessions_destroyed,
        "host exiting"
    );

    let exit_code = outcome?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn init_file_logging(log_path: &Path) -> Result<(), ConductorError> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ConductorError::Configuration(format!(
                    "failed to create conductor log directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| {
            ConductorError::Configuration(format!(
                "failed to open conductor log file '{}': {error}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

/// Runs one command and returns the process exit code.
async fn dispatch(conductor: &Conductor, command: CliCommand) -> Result<i32> {
    match command {
        CliCommand::Run {
            project_id,
            command,
            profile_id,
        } => run_attached(conductor, project_id, command, profile_id).await,
        CliCommand::Dates { project_id } => {
            let dates = conductor.saved_dates(&project_id).await?;
            if dates.is_empty() {
                println!("No saved sessions for project {project_id}.");
            }
            for date in dates {
                println!("{date}");
            }
            Ok(0)
        }
        CliCommand::Sessions { project_id, date } => {
            for snapshot in conductor.saved_sessions(&project_id, date).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    snapshot.session_id,
                    snapshot.state.as_str(),
                    snapshot.profile_id.as_ref().map_or("-", ProfileId::as_str),
                    snapshot.title.as_deref().unwrap_or("-"),
                    render_command(&snapshot.command),
                );
            }
            Ok(0)
        }
        CliCommand::Restore { project_id, date } => restore_attached(conductor, &project_id, date).await,
        CliCommand::Clear {
            project_id,
            confirmed,
        } => {
            if !confirmed {
                eprintln!("Refusing to delete saved sessions of {project_id} without --yes.");
                return Ok(2);
            }
            let removed = conductor.clear_history(&project_id).await?;
            println!("Removed {removed} saved session(s) of {project_id}.");
            Ok(0)
        }
        CliCommand::Profiles => {
            for profile in conductor.list_profiles()? {
                let usage = profile.usage.map_or_else(
                    || "usage unknown".to_owned(),
                    |usage| {
                        format!(
                            "session {:.0}% weekly {:.0}%",
                            usage.session_percent, usage.weekly_percent
                        )
                    },
                );
                println!(
                    "{}{}\t{}\t{}\t{}",
                    if profile.active { "* " } else { "  " },
                    profile.id,
                    profile.name,
                    profile.credential,
                    usage
                );
            }
            Ok(0)
        }
        CliCommand::Help => {
            print_cli_help();
            Ok(0)
        }
    }
}

fn render_command(command: &SessionCommand) -> String {
    std::iter::once(command.program.as_str())
        .chain(command.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Attaches a session to this terminal: output to stdout, stdin to the
/// session. Follows the session across failover retries and exits with the
/// final session's exit code.
async fn run_attached(
    conductor: &Conductor,
    project_id: ProjectId,
    command: SessionCommand,
    profile_id: Option<ProfileId>,
) -> Result<i32> {
    let mut events = conductor.subscribe_all();
    let handle = conductor.create_session(project_id, command, profile_id).await?;
    let (current_tx, current_rx) = watch::channel(handle.session_id.clone());
    let input_task = tokio::spawn(forward_stdin(conductor.clone(), current_rx));

    let exit_code = follow_session(&mut events, handle.session_id, current_tx).await;
    input_task.abort();
    Ok(exit_code)
}

async fn forward_stdin(conductor: Conductor, current: watch::Receiver<SessionId>) {
    let mut stdin = tokio::io::stdin();
    let mut buffer = [0_u8; 4096];
    loop {
        let read = match stdin.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) => {
                tracing::warn!(error = %error, "stdin read failed");
                break;
            }
        };
        let session_id = current.borrow().clone();
        if let Err(error) = conductor.send_input(&session_id, &buffer[..read]).await {
            tracing::warn!(session_id = %session_id, error = %error, "failed to forward input");
        }
    }
}

async fn follow_session(
    events: &mut EventSubscription,
    first: SessionId,
    current_tx: watch::Sender<SessionId>,
) -> i32 {
    let mut current = first;
    let mut pending_exit: Option<(tokio::time::Instant, i32)> = None;
    let mut stdout = std::io::stdout();

    loop {
        let deadline = pending_exit.map(|(deadline, _)| deadline);
        let envelope = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\r\nInterrupted; shutting down sessions.");
                return 130;
            }
            _ = sleep_until_optional(deadline) => {
                return pending_exit.map_or(0, |(_, code)| code);
            }
            envelope = events.next_event() => match envelope {
                Some(envelope) => envelope,
                None => return 1,
            },
        };

        match envelope.event {
            ConductorEvent::Output(bytes) if envelope.session_id.as_ref() == Some(&current) => {
                let _ = stdout.write_all(&bytes);
                let _ = stdout.flush();
            }
            ConductorEvent::Started(started) if started.retried_from.as_ref() == Some(&current) => {
                if let Some(replacement) = envelope.session_id {
                    eprintln!("\r\n[conductor] session retried as {replacement}");
                    current = replacement;
                    current_tx.send_replace(current.clone());
                    pending_exit = None;
                }
            }
            ConductorEvent::Ended(ended) if envelope.session_id.as_ref() == Some(&current) => {
                let code = ended.exit_code.unwrap_or(match ended.state {
                    SessionState::Killed => KILLED_EXIT_CODE,
                    _ => 1,
                });
                if ended.state == SessionState::Killed {
                    pending_exit = Some((tokio::time::Instant::now() + RETRY_FOLLOW_WINDOW, code));
                } else {
                    if let Some(reason) = ended.reason {
                        eprintln!("\r\n[conductor] session ended: {reason}");
                    }
                    return code;
                }
            }
            ConductorEvent::RateLimited(event) => {
                eprintln!(
                    "\r\n[conductor] rate limit on profile {} ({:?})",
                    event.profile_id, event.kind
                );
            }
            ConductorEvent::ProfileSwitched(report) => {
                if let Some(to_profile) = report.to_profile {
                    eprintln!("\r\n[conductor] switched to profile {to_profile}");
                }
            }
            ConductorEvent::NoProfileAvailable { profile_id, .. } => {
                eprintln!("\r\n[conductor] profile {profile_id} is limited and no other profile is eligible");
            }
            _ => {}
        }
    }
}

async fn sleep_until_optional(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Restores a date partition, then waits until every restored session ended
/// or the user interrupts.
async fn restore_attached(conductor: &Conductor, project_id: &ProjectId, date: SessionDate) -> Result<i32> {
    let mut events = conductor.subscribe_all();
    let report = conductor.restore(project_id, date).await?;
    println!(
        "Restored {} session(s), {} failed.",
        report.restored_count, report.failed_count
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.snapshot_id, failure.reason);
    }

    let mut live: HashSet<SessionId> = report
        .sessions
        .iter()
        .map(|restored| restored.session_id.clone())
        .collect();
    // A retried session ends before its replacement starts.
    let mut finished = HashSet::new();
    while !live.is_empty() {
        let envelope = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            envelope = events.next_event() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let Some(session_id) = envelope.session_id else {
            continue;
        };
        match envelope.event {
            ConductorEvent::Started(started) => {
                let follows_restored = started
                    .retried_from
                    .is_some_and(|previous| live.remove(&previous) || finished.contains(&previous));
                if follows_restored {
                    live.insert(session_id);
                }
            }
            ConductorEvent::Ended(ended) if live.remove(&session_id) => {
                println!("{session_id} ended ({})", ended.state.as_str());
                finished.insert(session_id);
            }
            _ => {}
        }
    }

    Ok(i32::from(report.failed_count > 0))
}
