//! Child process supervision: the bridge's pump loop.
//!
//! Spawns one agent process with piped stdio, relays its output as events,
//! infers when it is blocked on stdin, and feeds client replies back. The
//! loop is the only writer to the child's stdin and the only reader of its
//! stdout/stderr, so per-run event order is arrival order.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::classify::{Decision, HeuristicClassifier, PromptClassifier};
use crate::config::{ClassifierSettings, SessionSettings};
use crate::events::BridgeEvent;
use crate::hub::BroadcastHub;
use crate::log::RunLog;
use crate::registry::PidRegistry;
use crate::router::OutputRouter;

/// Terminal state of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// One supervised run. Constructed by the scheduler's launcher and consumed
/// by `run`.
pub struct ProcessSession {
    pub run_id: String,
    pub job: Value,
    pub settings: SessionSettings,
    pub classifier: ClassifierSettings,
    pub hub: Arc<BroadcastHub>,
    pub registry: Arc<PidRegistry>,
    pub log_dir: PathBuf,
    pub cancelled: Arc<AtomicBool>,
}

enum AwaitOutcome {
    Reply(String),
    ChildEof,
    InputClosed,
}

impl ProcessSession {
    /// Drive the child to a terminal state and publish `complete`.
    ///
    /// The loop:
    /// 1. Spawns the configured script with a filtered environment
    /// 2. Merges stdout/stderr and routes chunks through the tag parser
    /// 3. On quiet ticks, asks the classifier about the held line
    /// 4. On an accepted prompt, suspends and awaits a client reply
    /// 5. At EOF, force-flushes, reaps the child, and reports the exit
    pub async fn run(self) -> SessionOutcome {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        self.hub.register_input(&self.run_id, input_tx);

        let log = match RunLog::create(&self.log_dir, &self.run_id) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(run_id = %self.run_id, %err, "running without transcript logs");
                None
            }
        };

        let outcome = self.supervise(&mut input_rx, &log).await;

        self.registry.unregister(&self.run_id);
        self.hub.clear_input(&self.run_id);
        outcome
    }

    async fn supervise(
        &self,
        input_rx: &mut mpsc::UnboundedReceiver<String>,
        log: &Option<RunLog>,
    ) -> SessionOutcome {
        let mut classifier = match HeuristicClassifier::from_settings(&self.classifier) {
            Ok(classifier) => classifier,
            Err(err) => {
                self.emit(log, BridgeEvent::Error { error: format!("{err:#}") });
                return SessionOutcome::Failed;
            }
        };

        let script = self.resolve_script();
        let working_dir = self.settings.working_dir.clone().unwrap_or_else(|| {
            script
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let command_line = format!(
            "{} {} {}",
            self.settings.program,
            self.settings.args.join(" "),
            script.display()
        );
        self.emit(
            log,
            BridgeEvent::Start {
                command: command_line.clone(),
                working_dir: working_dir.display().to_string(),
            },
        );

        if !script.is_file() {
            self.emit(
                log,
                BridgeEvent::Error {
                    error: format!("agent script not found: {}", script.display()),
                },
            );
            return SessionOutcome::Failed;
        }

        let mut child = match self.spawn(&script, &working_dir) {
            Ok(child) => child,
            Err(err) => {
                self.emit(log, BridgeEvent::Error { error: format!("{err:#}") });
                return SessionOutcome::Failed;
            }
        };
        let pid = child.id().unwrap_or_default();
        self.registry.register(&self.run_id, pid);
        info!(run_id = %self.run_id, pid, command = %command_line, "agent process started");

        // A cancel may have landed between admission and spawn.
        if self.cancelled.load(Ordering::SeqCst) {
            let _ = child.start_kill();
        }

        let transcript = log
            .as_ref()
            .map(|l| l.transcript_path().display().to_string())
            .unwrap_or_default();
        self.emit(
            log,
            BridgeEvent::ProcessStarted {
                pid,
                log_file: transcript,
            },
        );

        let mut stdin = child.stdin.take();
        let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, data_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, data_tx);
        }

        let mut router = OutputRouter::new(self.settings.failure_sentinels.clone());
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let mut last_data = Instant::now();
        let mut pipe_broken = false;

        'pump: loop {
            match timeout(poll, data_rx.recv()).await {
                Ok(Some(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    self.append_transcript(log, &text);
                    let routed = router.ingest(&text);
                    for line in &routed.lines {
                        classifier.observe(line);
                    }
                    for event in routed.events {
                        self.emit(log, event);
                    }
                    last_data = Instant::now();
                }
                Ok(None) => break 'pump,
                Err(_) => {
                    if router.passthrough() {
                        continue;
                    }
                    match classifier.classify(router.held_line(), last_data.elapsed()) {
                        Decision::Candidate => {}
                        Decision::Release => {
                            if let Some(event) = router.release_held() {
                                self.emit(log, event);
                            }
                        }
                        Decision::Prompt { text, multiline } => {
                            router.consume_held();
                            let restart = classifier.is_restart_prompt(&text);
                            self.emit(
                                log,
                                BridgeEvent::Prompt {
                                    prompt: text,
                                    multiline,
                                },
                            );
                            match self
                                .await_reply(
                                    input_rx,
                                    &mut data_rx,
                                    &mut router,
                                    &mut classifier,
                                    log,
                                    &mut last_data,
                                    poll,
                                )
                                .await
                            {
                                AwaitOutcome::Reply(reply) => {
                                    debug!(run_id = %self.run_id, len = reply.len(), "forwarding reply");
                                    let mut payload = reply.clone();
                                    payload.push('\n');
                                    if multiline {
                                        payload.push('\n');
                                    }
                                    let write = match stdin.as_mut() {
                                        Some(stdin) => write_reply(stdin, &payload).await,
                                        None => Err(std::io::Error::from(
                                            std::io::ErrorKind::BrokenPipe,
                                        )),
                                    };
                                    if let Err(err) = write {
                                        self.emit(
                                            log,
                                            BridgeEvent::Error {
                                                error: format!(
                                                    "failed to write to agent stdin: {err}"
                                                ),
                                            },
                                        );
                                        pipe_broken = true;
                                        break 'pump;
                                    }
                                    if restart && is_affirmative(&reply) {
                                        classifier.reset_cycle();
                                        router.reset_cycle();
                                    }
                                    last_data = Instant::now();
                                }
                                AwaitOutcome::ChildEof => break 'pump,
                                AwaitOutcome::InputClosed => {
                                    warn!(run_id = %self.run_id, "input channel closed while awaiting reply");
                                }
                            }
                        }
                    }
                }
            }
        }

        // Surface unterminated tag content and any held text, then let the
        // child see EOF on its stdin.
        for event in router.finish().events {
            self.emit(log, event);
        }
        drop(stdin.take());

        let exit_code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(err) => {
                self.emit(
                    log,
                    BridgeEvent::Error {
                        error: format!("failed to reap agent process: {err}"),
                    },
                );
                -1
            }
        };
        let success = exit_code == 0 && !pipe_broken;
        self.emit(
            log,
            BridgeEvent::Complete { exit_code, success },
        );
        info!(run_id = %self.run_id, exit_code, success, "agent process exited");

        if self.cancelled.load(Ordering::SeqCst) {
            SessionOutcome::Cancelled
        } else if success {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Failed
        }
    }

    /// Consume output while a prompt is pending. A newly accepted prompt in
    /// this window is published as a continuation, not a fresh prompt.
    #[allow(clippy::too_many_arguments)]
    async fn await_reply(
        &self,
        input_rx: &mut mpsc::UnboundedReceiver<String>,
        data_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        router: &mut OutputRouter,
        classifier: &mut HeuristicClassifier,
        log: &Option<RunLog>,
        last_data: &mut Instant,
        poll: Duration,
    ) -> AwaitOutcome {
        loop {
            tokio::select! {
                reply = input_rx.recv() => {
                    return match reply {
                        Some(reply) => AwaitOutcome::Reply(reply),
                        None => AwaitOutcome::InputClosed,
                    };
                }
                chunk = data_rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            let text = String::from_utf8_lossy(&chunk).into_owned();
                            self.append_transcript(log, &text);
                            let routed = router.ingest(&text);
                            for line in &routed.lines {
                                classifier.observe(line);
                            }
                            for event in routed.events {
                                self.emit(log, event);
                            }
                            *last_data = Instant::now();
                        }
                        None => return AwaitOutcome::ChildEof,
                    }
                }
                _ = tokio::time::sleep(poll) => {
                    if router.passthrough() {
                        continue;
                    }
                    match classifier.classify(router.held_line(), last_data.elapsed()) {
                        Decision::Candidate => {}
                        Decision::Release => {
                            if let Some(event) = router.release_held() {
                                self.emit(log, event);
                            }
                        }
                        Decision::Prompt { text, .. } => {
                            router.consume_held();
                            self.emit(log, BridgeEvent::PromptContinuation { prompt: text });
                        }
                    }
                }
            }
        }
    }

    fn spawn(
        &self,
        script: &std::path::Path,
        working_dir: &std::path::Path,
    ) -> Result<tokio::process::Child> {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args);
        cmd.arg(script);
        if !self.job.is_null() {
            cmd.arg(self.job.to_string());
        }
        cmd.current_dir(working_dir);
        cmd.env_clear();
        for key in self
            .settings
            .env_passthrough
            .iter()
            .map(String::as_str)
            .chain(["PATH", "HOME", "LANG", "LC_ALL"])
        {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("PYTHONPATH", working_dir);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
            .with_context(|| format!("failed to spawn {}", self.settings.program))
    }

    fn resolve_script(&self) -> PathBuf {
        let script = PathBuf::from(&self.settings.script);
        if script.is_absolute() {
            return script;
        }
        match &self.settings.working_dir {
            Some(dir) => dir.join(script),
            None => script,
        }
    }

    fn append_transcript(&self, log: &Option<RunLog>, text: &str) {
        if let Some(log) = log {
            if let Err(err) = log.append_output(text) {
                warn!(run_id = %self.run_id, %err, "transcript write failed");
            }
        }
    }

    fn emit(&self, log: &Option<RunLog>, event: BridgeEvent) {
        if let Some(log) = log {
            if let Err(err) = log.record(&event) {
                warn!(run_id = %self.run_id, %err, "event log write failed");
            }
        }
        self.hub.publish(&self.run_id, event);
    }
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn write_reply(
    stdin: &mut tokio::process::ChildStdin,
    payload: &str,
) -> std::io::Result<()> {
    stdin.write_all(payload.as_bytes()).await?;
    stdin.flush().await
}

fn is_affirmative(reply: &str) -> bool {
    let reply = reply.trim();
    reply.eq_ignore_ascii_case("y") || reply.eq_ignore_ascii_case("yes")
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
