//! Foreground single-run mode: the child's output goes to this terminal
//! and its prompts are answered from it.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use dialoguer::Input;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::events::BridgeEvent;
use crate::hub::BroadcastHub;
use crate::paths;
use crate::registry::PidRegistry;
use crate::session::ProcessSession;

/// Run a single job to completion. Returns `true` when the child exited
/// successfully.
pub async fn run(
    config: &BridgeConfig,
    state_dir: &Path,
    run_id: String,
    job: Value,
) -> Result<bool> {
    let hub = Arc::new(BroadcastHub::new());
    let registry = Arc::new(PidRegistry::open(paths::registry_file(state_dir)));
    let mut events = hub.subscribe(&run_id);

    let session = ProcessSession {
        run_id: run_id.clone(),
        job,
        settings: config.session.clone(),
        classifier: config.classifier.clone(),
        hub: hub.clone(),
        registry,
        log_dir: paths::log_dir(state_dir),
        cancelled: Arc::new(AtomicBool::new(false)),
    };
    let mut child = tokio::spawn(session.run());

    let mut success = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(ok) = handle_event(&hub, &run_id, event).await? {
                    success = ok;
                }
            }
            outcome = &mut child => {
                let outcome = outcome.context("session task panicked")?;
                // Events published just before the session returned are
                // still queued; drain them so the tail is not lost.
                while let Ok(event) = events.try_recv() {
                    if let Some(ok) = handle_event(&hub, &run_id, event).await? {
                        success = ok;
                    }
                }
                debug!(run_id, ?outcome, "session finished");
                break;
            }
        }
    }
    Ok(success)
}

async fn handle_event(
    hub: &Arc<BroadcastHub>,
    run_id: &str,
    event: BridgeEvent,
) -> Result<Option<bool>> {
    match event {
        BridgeEvent::Output { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        BridgeEvent::Tag { kind, data, .. } => match data.as_str() {
            Some(text) => println!("[{}] {}", kind.name(), text.trim_end()),
            None => println!("[{}] {}", kind.name(), data),
        },
        BridgeEvent::Prompt { prompt, multiline } => {
            let reply = tokio::task::spawn_blocking(move || read_reply(&prompt, multiline))
                .await
                .context("prompt reader panicked")??;
            if !hub.send_input(run_id, reply) {
                warn!(run_id, "child is no longer accepting input");
            }
        }
        BridgeEvent::PromptContinuation { prompt } => {
            println!("{prompt}");
        }
        BridgeEvent::Start { command, .. } => {
            debug!(run_id, command, "launching");
        }
        BridgeEvent::ProcessStarted { pid, .. } => {
            debug!(run_id, pid, "child started");
        }
        BridgeEvent::Error { error } => {
            eprintln!("error: {error}");
        }
        BridgeEvent::Cancelled { message } => {
            eprintln!("{message}");
        }
        BridgeEvent::Complete { exit_code, success } => {
            println!("run {run_id} finished (exit {exit_code})");
            return Ok(Some(success));
        }
        _ => {}
    }
    Ok(None)
}

/// Blocking terminal read. Multiline prompts collect lines until an empty
/// one, matching the double-newline the child waits for.
fn read_reply(prompt: &str, multiline: bool) -> Result<String> {
    if multiline {
        println!("{prompt}");
        println!("(finish with an empty line)");
        let mut lines: Vec<String> = Vec::new();
        loop {
            let line: String = Input::new().allow_empty(true).interact_text()?;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    } else {
        let reply: String = Input::new()
            .with_prompt(prompt.trim_end())
            .allow_empty(true)
            .interact_text()?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config(tmp: &tempfile::TempDir, body: &str) -> BridgeConfig {
        let script = tmp.path().join("job.sh");
        std::fs::write(&script, body).unwrap();
        let mut config = BridgeConfig::default();
        config.session.program = "/bin/sh".to_string();
        config.session.script = script.display().to_string();
        config.session.args = Vec::new();
        config.session.working_dir = Some(tmp.path().to_path_buf());
        config
    }

    #[tokio::test]
    async fn foreground_run_reports_success() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sh_config(&tmp, "echo hello\n");

        let ok = run(&config, tmp.path(), "fg-ok".to_string(), Value::Null)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn foreground_run_reports_nonzero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let config = sh_config(&tmp, "echo failing\nexit 3\n");

        let ok = run(&config, tmp.path(), "fg-bad".to_string(), Value::Null)
            .await
            .unwrap();
        assert!(!ok);
    }
}
