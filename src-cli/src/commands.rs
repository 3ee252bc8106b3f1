//! CLI command implementations.

use crate::client::{ServiceClient, ServiceError};
use crate::colors;
use crate::exit_codes::ExitCode;
use sotto_common::ipc::{read_json, write_json, Reply, Request};
use sotto_common::Phase;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a transcription or refinement to settle.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often `watch` probes the service for transitions whose events were
/// dropped from a lagging stream.
const STATUS_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Start recording dictation.
pub async fn start(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect_or_spawn().await {
        if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    match client.request(Request::StartRecording).await {
        Ok(reply) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "recording_started",
                        "sequence": reply.state.sequence,
                    })
                );
            } else if !quiet {
                println!("{}", colors::success("Recording started."));
            }
            ExitCode::Success
        }
        Err(ServiceError::RemoteError(msg)) if msg.contains("already recording") => {
            if json {
                println!(r#"{{"status": "already_recording"}}"#);
            } else if !quiet {
                println!("{}", colors::dim("Already recording."));
            }
            ExitCode::Success
        }
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            match e {
                ServiceError::RemoteError(_) => ExitCode::RecordingFailedToStart,
                _ => e.to_exit_code(),
            }
        }
    }
}

/// Stop recording and print the transcript.
pub async fn stop(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect().await {
        if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    let ack = match client.request(Request::StopRecording).await {
        Ok(reply) => reply,
        Err(ServiceError::RemoteError(msg)) if msg.contains("not recording") => {
            if json {
                println!(r#"{{"status": "not_recording"}}"#);
            } else if !quiet {
                println!("{}", colors::dim("No recording in progress."));
            }
            return ExitCode::Success;
        }
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            return e.to_exit_code();
        }
    };

    if !quiet && !json {
        eprintln!("{}", colors::info("Transcribing..."));
    }

    await_transcript(&client, ack.state.sequence, json, quiet).await
}

/// Poll the service until the work acknowledged at `sequence` settles,
/// then print the resulting text.
///
/// Transcripts go to stdout so the command composes with pipes; everything
/// else goes to stderr.
async fn await_transcript(
    client: &ServiceClient,
    sequence: u64,
    json: bool,
    quiet: bool,
) -> ExitCode {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let reply = match client.request(Request::GetStatus).await {
            Ok(reply) => reply,
            Err(e) => {
                if !quiet {
                    eprintln!("{}", colors::error(&e.to_string()));
                }
                return e.to_exit_code();
            }
        };

        // Nothing has happened since the ack
        if reply.state.sequence <= sequence {
            continue;
        }

        let transcript = reply
            .data
            .as_ref()
            .and_then(|d| d.get("transcript"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        match reply.state.phase {
            Phase::Transcribing | Phase::Processing => continue,
            Phase::Idle | Phase::Recording => {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "status": "complete",
                            "transcript": transcript,
                        })
                    );
                } else if transcript.is_empty() {
                    if !quiet {
                        eprintln!("{}", colors::dim("(no speech detected)"));
                    }
                } else {
                    println!("{}", transcript);
                }
                return ExitCode::Success;
            }
            Phase::Error => {
                let message = reply
                    .state
                    .last_error
                    .unwrap_or_else(|| "transcription failed".to_string());
                if json {
                    println!(
                        "{}",
                        serde_json::json!({"status": "failed", "error": message})
                    );
                } else if !quiet {
                    eprintln!("{}", colors::error(&message));
                }
                return ExitCode::TranscriptionFailed;
            }
            Phase::Paused | Phase::Restarting | Phase::ShuttingDown => {
                if !quiet && !json {
                    eprintln!("{}", colors::warning("Transcription interrupted."));
                }
                return ExitCode::GeneralError;
            }
        }
    }
}

/// Record until interrupted or the duration elapses, then print the
/// transcript.
pub async fn record(duration: Option<u64>, json: bool, quiet: bool, verbose: bool) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect_or_spawn().await {
        if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    // Health check
    if let Err(e) = client.ping().await {
        if !quiet {
            eprintln!(
                "{}",
                colors::error(&format!("Service health check failed: {}", e))
            );
        }
        return ExitCode::ServiceConnectionFailed;
    }

    if verbose && !quiet {
        eprintln!("Connected to service.");
    }

    if let Err(e) = client.request(Request::StartRecording).await {
        if !quiet {
            eprintln!(
                "{}",
                colors::error(&format!("Error starting recording: {}", e))
            );
        }
        return ExitCode::RecordingFailedToStart;
    }

    if !quiet && !json {
        eprintln!("{}", colors::dim("Recording. Press Ctrl-C to stop."));
    }

    // Set up signal handling for graceful stop
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to set up SIGINT handler");
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to set up SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }

            stop_flag_clone.store(true, Ordering::SeqCst);
        });
    }

    // Duration timer
    let start_time = Instant::now();
    let duration_limit = duration.map(Duration::from_secs);

    // Main loop - wait for a stop signal or an external transition
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            if !quiet && !json {
                eprintln!("\n{}", colors::info("Stopping recording..."));
            }
            break;
        }

        if let Some(limit) = duration_limit {
            if start_time.elapsed() >= limit {
                if !quiet && !json {
                    eprintln!(
                        "\n{}",
                        colors::info("Duration limit reached. Stopping recording...")
                    );
                }
                break;
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;

        match client.request(Request::GetStatus).await {
            Ok(reply) if reply.state.phase == Phase::Recording => {
                // Live elapsed display only when stdout is a terminal, so
                // piped output stays clean
                if !quiet && !json && colors::is_interactive() {
                    let seconds = start_time.elapsed().as_secs();
                    print!(
                        "\r{} {}",
                        colors::recording("Recording:"),
                        colors::elapsed_time(seconds / 60, seconds % 60)
                    );
                    std::io::stdout().flush().ok();
                }
            }
            Ok(reply) => {
                // Another session stopped or redirected the recording
                if !quiet && !json {
                    eprintln!(
                        "\n{}",
                        colors::info(&format!(
                            "Recording ended externally (state: {}).",
                            reply.state.phase
                        ))
                    );
                }
                return ExitCode::Success;
            }
            Err(_) => {}
        }
    }

    // Stop and wait for the transcript
    let ack = match client.request(Request::StopRecording).await {
        Ok(reply) => reply,
        Err(ServiceError::RemoteError(msg)) if msg.contains("not recording") => {
            if !quiet && !json {
                eprintln!("{}", colors::dim("Recording already stopped."));
            }
            return ExitCode::Success;
        }
        Err(e) => {
            if !quiet {
                eprintln!(
                    "\n{}",
                    colors::error(&format!("Error stopping recording: {}", e))
                );
            }
            return e.to_exit_code();
        }
    };

    await_transcript(&client, ack.state.sequence, json, quiet).await
}

/// Send text through the refinement provider and print the result.
pub async fn process(text: Option<String>, json: bool, quiet: bool) -> ExitCode {
    let text = match text {
        Some(text) => text,
        None => {
            // Read from stdin so the command composes with pipes
            let mut buffer = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut buffer) {
                if !quiet {
                    eprintln!(
                        "{}",
                        colors::error(&format!("Failed to read stdin: {}", e))
                    );
                }
                return ExitCode::GeneralError;
            }
            buffer
        }
    };

    let text = text.trim_end().to_string();
    if text.is_empty() {
        if !quiet {
            eprintln!("{}", colors::error("No text to process."));
        }
        return ExitCode::InvalidArguments;
    }

    let client = ServiceClient::new();

    if let Err(e) = client.connect_or_spawn().await {
        if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    let ack = match client.request(Request::ProcessText { text: text.clone() }).await {
        Ok(reply) => reply,
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            return e.to_exit_code();
        }
    };

    if !quiet && !json {
        eprintln!("{}", colors::info("Refining..."));
    }

    // Poll until the refinement settles
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let reply = match client.request(Request::GetStatus).await {
            Ok(reply) => reply,
            Err(e) => {
                if !quiet {
                    eprintln!("{}", colors::error(&e.to_string()));
                }
                return e.to_exit_code();
            }
        };

        if reply.state.sequence <= ack.state.sequence {
            continue;
        }

        match reply.state.phase {
            Phase::Processing => continue,
            Phase::Idle => {
                let refined = reply
                    .data
                    .as_ref()
                    .and_then(|d| d.get("transcript"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
                if json {
                    println!(
                        "{}",
                        serde_json::json!({"status": "complete", "text": refined})
                    );
                } else {
                    println!("{}", refined);
                }
                return ExitCode::Success;
            }
            Phase::Error => {
                let message = reply
                    .state
                    .last_error
                    .unwrap_or_else(|| "refinement failed".to_string());
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "status": "failed",
                            "error": message,
                            "text": text,
                        })
                    );
                } else {
                    if !quiet {
                        eprintln!("{}", colors::error(&message));
                    }
                    // The original text is preserved on failure
                    println!("{}", text);
                }
                return ExitCode::RefinementFailed;
            }
            _ => {
                if !quiet && !json {
                    eprintln!("{}", colors::warning("Refinement interrupted."));
                }
                return ExitCode::GeneralError;
            }
        }
    }
}

/// Show the service's current status.
pub async fn status(json: bool) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect().await {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "status": "service_unavailable",
                    "error": e.to_string(),
                })
            );
        } else {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    match client.request(Request::GetStatus).await {
        Ok(reply) => {
            let data = reply.data.unwrap_or_else(|| serde_json::json!({}));
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "state": reply.state.phase.as_str(),
                        "sequence": reply.state.sequence,
                        "last_error": reply.state.last_error,
                        "transcript": data.get("transcript"),
                        "sessions": data.get("sessions"),
                        "owner": data.get("owner"),
                    })
                );
            } else {
                println!(
                    "{} {}",
                    colors::bold("State:"),
                    colors::state(reply.state.phase.as_str())
                );
                println!("{} {}", colors::bold("Sequence:"), reply.state.sequence);
                if let Some(error) = &reply.state.last_error {
                    println!("{} {}", colors::bold("Last error:"), error);
                }
                let transcript = data.get("transcript").and_then(|t| t.as_str()).unwrap_or("");
                if transcript.is_empty() {
                    println!("{} {}", colors::bold("Transcript:"), colors::dim("(none)"));
                } else {
                    println!("{} {}", colors::bold("Transcript:"), transcript);
                }
                if let Some(sessions) = data.get("sessions").and_then(|s| s.as_u64()) {
                    println!("{} {}", colors::bold("Sessions:"), sessions);
                }
                if let Some(owner) = data.get("owner").and_then(|o| o.as_u64()) {
                    println!("{} session {}", colors::bold("Recording owner:"), owner);
                }
            }
            ExitCode::Success
        }
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({"error": e.to_string()}));
            } else {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            e.to_exit_code()
        }
    }
}

/// Send a bare command and report the resulting state.
async fn simple_command(
    request: Request,
    json_status: &str,
    message: &str,
    json: bool,
    quiet: bool,
) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect().await {
        if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    match client.request(request).await {
        Ok(reply) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": json_status,
                        "state": reply.state.phase.as_str(),
                    })
                );
            } else if !quiet {
                println!("{}", colors::success(message));
            }
            ExitCode::Success
        }
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            e.to_exit_code()
        }
    }
}

/// Pause the service.
pub async fn pause(json: bool, quiet: bool) -> ExitCode {
    simple_command(Request::Pause, "paused", "Paused.", json, quiet).await
}

/// Resume the service from pause.
pub async fn resume(json: bool, quiet: bool) -> ExitCode {
    simple_command(Request::Resume, "resumed", "Resumed.", json, quiet).await
}

/// Restart the service's engines.
pub async fn restart(json: bool, quiet: bool) -> ExitCode {
    simple_command(Request::Restart, "restarted", "Engines restarted.", json, quiet).await
}

/// Ask the service to shut down.
pub async fn shutdown(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();

    // Nothing to shut down
    if client.connect().await.is_err() {
        if json {
            println!(r#"{{"status": "not_running"}}"#);
        } else if !quiet {
            println!("{}", colors::dim("Service is not running."));
        }
        return ExitCode::Success;
    }

    match client.request(Request::Shutdown).await {
        Ok(_) => {
            if json {
                println!(r#"{{"status": "shutting_down"}}"#);
            } else if !quiet {
                println!("{}", colors::success("Service shutting down."));
            }
            ExitCode::Success
        }
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            e.to_exit_code()
        }
    }
}

/// Check that the service is alive.
pub async fn ping(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();

    if let Err(e) = client.connect().await {
        if json {
            println!(r#"{{"status": "unreachable"}}"#);
        } else if !quiet {
            eprintln!("{}", colors::error(&e.to_string()));
        }
        return e.to_exit_code();
    }

    let start = Instant::now();
    match client.ping().await {
        Ok(()) => {
            let elapsed = start.elapsed();
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "ok",
                        "rtt_us": elapsed.as_micros() as u64,
                    })
                );
            } else if !quiet {
                println!("{}", colors::success(&format!("pong ({:?})", elapsed)));
            }
            ExitCode::Success
        }
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({"status": "error", "error": e.to_string()}));
            } else if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            e.to_exit_code()
        }
    }
}

/// Stream state events as they happen.
pub async fn watch(json: bool, quiet: bool) -> ExitCode {
    let client = ServiceClient::new();

    let stream = match client.open_event_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            if !quiet {
                eprintln!("{}", colors::error(&e.to_string()));
            }
            return e.to_exit_code();
        }
    };

    if !quiet && !json {
        eprintln!("{}", colors::info("Watching events. Press Ctrl-C to exit."));
    }

    let (reader, mut writer) = stream.into_split();

    // Periodic status probes catch transitions whose events were dropped
    // from a lagging stream
    let poller = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_PROBE_INTERVAL);
        loop {
            ticker.tick().await;
            if write_json(&mut writer, &Request::GetStatus).await.is_err() {
                break;
            }
        }
    });

    let code = tokio::select! {
        code = watch_events(reader, json, quiet) => code,
        _ = tokio::signal::ctrl_c() => {
            if !quiet && !json {
                eprintln!();
            }
            ExitCode::Success
        }
    };

    poller.abort();
    code
}

/// Print each event frame; status probe replies fill in anything missed.
async fn watch_events(
    mut reader: tokio::net::unix::OwnedReadHalf,
    json: bool,
    quiet: bool,
) -> ExitCode {
    let mut last_sequence: Option<u64> = None;

    loop {
        let reply: Reply = match read_json(&mut reader).await {
            Ok(reply) => reply,
            Err(e) => {
                if !quiet {
                    eprintln!(
                        "{}",
                        colors::error(&format!("Event stream closed: {}", e))
                    );
                }
                return ExitCode::ServiceConnectionFailed;
            }
        };

        let sequence = reply.sequence();

        match reply.event_kind() {
            Some(kind) => {
                if let Some(last) = last_sequence {
                    let missed = sequence.saturating_sub(last + 1);
                    if missed > 0 && !quiet && !json {
                        eprintln!(
                            "{}",
                            colors::warning(&format!("{} event(s) missed", missed))
                        );
                    }
                }
                if json {
                    if let Ok(line) = serde_json::to_string(&reply) {
                        println!("{}", line);
                    }
                } else {
                    println!(
                        "{:>6}  {}  {}{}",
                        sequence,
                        colors::pad_left(reply.state.phase.as_str(), 14, colors::state),
                        colors::bold(kind),
                        describe_event(&reply)
                    );
                }
                last_sequence = Some(sequence);
            }
            None => {
                // Status probe reply. The first one establishes a baseline;
                // later ones only matter if they reveal missed transitions.
                match last_sequence {
                    Some(last) if sequence > last => {
                        if !quiet && !json {
                            println!(
                                "{:>6}  {}  {}",
                                sequence,
                                colors::pad_left(reply.state.phase.as_str(), 14, colors::state),
                                colors::dim("(state probe; events were missed)")
                            );
                        }
                        last_sequence = Some(sequence);
                    }
                    Some(_) => {}
                    None => {
                        if !quiet && !json {
                            println!(
                                "{:>6}  {}  {}",
                                sequence,
                                colors::pad_left(reply.state.phase.as_str(), 14, colors::state),
                                colors::dim("(current state)")
                            );
                        }
                        last_sequence = Some(sequence);
                    }
                }
            }
        }
    }
}

/// Short human-readable suffix for events that carry a payload.
fn describe_event(reply: &Reply) -> String {
    if let Some(error) = &reply.error {
        return format!("  {}", error);
    }
    let text = reply
        .data
        .as_ref()
        .and_then(|d| d.get("transcription").or_else(|| d.get("text")))
        .and_then(|t| t.as_str());
    match text {
        Some("") => "  (empty)".to_string(),
        Some(t) if t.chars().count() > 60 => {
            format!("  {}...", t.chars().take(57).collect::<String>())
        }
        Some(t) => format!("  {}", t),
        None => String::new(),
    }
}

/// Show version information.
pub fn version(json: bool) {
    let version = env!("CARGO_PKG_VERSION");
    if json {
        println!(r#"{{"version": "{}"}}"#, version);
    } else {
        println!("{} {}", colors::bold("sotto"), version);
    }
}
