//! Encoder process supervision.
//!
//! At most one encoder runs at a time. Each process is owned by a monitor task
//! which is the only place that waits on it, so the exit of every process is
//! reported exactly once, whether it quit on its own or was stopped.

use crate::error::{StreamError, StreamResult};
use crate::stream::command::EncoderCommand;
use futures::channel::mpsc::UnboundedSender;
use serde::Serialize;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub type ProcessId = u64;

/// Extra time allowed for a force-killed process to be reaped.
const REAP_MARGIN: Duration = Duration::from_secs(2);
/// How long the monitor waits for the stderr reader to drain after exit.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The process was stopped on request.
    ExplicitStop,
    /// The process exited successfully on its own, e.g. at the end of the input.
    Completed,
    /// The process exited with a failure code, or was killed by a signal.
    Failed { code: Option<i32> },
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ExitReason::Completed
        } else {
            ExitReason::Failed {
                code: status.code(),
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExitEvent {
    pub process_id: ProcessId,
    pub reason: ExitReason,
    /// Most recent stderr output, lossily decoded.
    pub stderr_tail: String,
}

/// Notifications from monitor tasks to the engine.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// The process outlived the startup probe.
    Started { process_id: ProcessId },
    Exited(ExitEvent),
}

/// Bounded buffer keeping the last `capacity` bytes written to it.
#[derive(Clone, Debug)]
pub struct StderrTail {
    buffer: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = &bytes[bytes.len().saturating_sub(self.capacity)..];
        let overflow = (buffer.len() + bytes.len()).saturating_sub(self.capacity);
        buffer.drain(..overflow);
        buffer.extend(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let (front, back) = buffer.as_slices();
        let mut bytes = Vec::with_capacity(buffer.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// The supervisor's view of the running process.
#[derive(Debug)]
struct ProcessHandle {
    id: ProcessId,
    stop_tx: Option<oneshot::Sender<Duration>>,
    reaped_rx: oneshot::Receiver<()>,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    program: String,
    startup_probe: Duration,
    stderr_tail_bytes: usize,
    events: UnboundedSender<EngineEvent>,
    next_id: ProcessId,
    active: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(
        program: impl Into<String>,
        startup_probe: Duration,
        stderr_tail_bytes: usize,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            program: program.into(),
            startup_probe,
            stderr_tail_bytes,
            events,
            next_id: 0,
            active: None,
        }
    }

    /// Id of the process whose events are still relevant, if any.
    pub fn active_id(&self) -> Option<ProcessId> {
        self.active.as_ref().map(|handle| handle.id)
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Spawns the encoder. Fails without side effects if one is already active.
    pub fn start(&mut self, command: &EncoderCommand) -> StreamResult<ProcessId> {
        if self.active.is_some() {
            return Err(StreamError::AlreadyRunning);
        }

        let mut child = Command::new(&self.program)
            .args(command.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| StreamError::Spawn(format!("{}: {error}", self.program)))?;

        self.next_id += 1;
        let id = self.next_id;
        let pid = child.id();
        info!(process_id = id, ?pid, %command, "Encoder started");

        let tail = StderrTail::new(self.stderr_tail_bytes);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, tail.clone())));

        let (stop_tx, stop_rx) = oneshot::channel();
        let (reaped_tx, reaped_rx) = oneshot::channel();
        let monitor = Monitor {
            id,
            startup_probe: self.startup_probe,
            events: self.events.clone(),
            tail,
            stderr_task,
        };
        tokio::spawn(monitor.run(child, stop_rx, reaped_tx));

        self.active = Some(ProcessHandle {
            id,
            stop_tx: Some(stop_tx),
            reaped_rx,
        });
        Ok(id)
    }

    /// Stops the active process, force-killing it after `grace`.
    ///
    /// The handle is cleared on every path. Stopping with nothing running is a no-op.
    pub async fn stop(&mut self, grace: Duration) -> StreamResult<()> {
        let Some(mut handle) = self.active.take() else {
            return Ok(());
        };

        debug!(process_id = handle.id, ?grace, "Stopping encoder");
        if let Some(stop_tx) = handle.stop_tx.take() {
            // Fails only when the monitor already finished
            _ = stop_tx.send(grace);
        }

        match timeout(grace + REAP_MARGIN, handle.reaped_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(StreamError::Stop(format!(
                "encoder {} was not reaped within {:?}",
                handle.id,
                grace + REAP_MARGIN
            ))),
        }
    }

    /// Forgets the handle of a process that has already exited.
    pub fn release(&mut self, process_id: ProcessId) {
        if self.active_id() == Some(process_id) {
            self.active = None;
        }
    }
}

/// Owns a spawned child until it is reaped.
struct Monitor {
    id: ProcessId,
    startup_probe: Duration,
    events: UnboundedSender<EngineEvent>,
    tail: StderrTail,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        mut stop_rx: oneshot::Receiver<Duration>,
        reaped_tx: oneshot::Sender<()>,
    ) {
        let id = self.id;
        let probe = tokio::time::sleep(self.startup_probe);
        tokio::pin!(probe);
        let mut probed = false;

        let reason = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => ExitReason::from_status(status),
                        Err(error) => {
                            error!(process_id = id, ?error, "Failed to wait for encoder");
                            ExitReason::Failed { code: None }
                        }
                    };
                }
                grace = &mut stop_rx => {
                    // A dropped handle means nobody is left to wait for a graceful stop
                    shutdown(&mut child, id, grace.unwrap_or(Duration::ZERO)).await;
                    break ExitReason::ExplicitStop;
                }
                _ = &mut probe, if !probed => {
                    probed = true;
                    debug!(process_id = id, "Encoder passed startup probe");
                    _ = self.events.unbounded_send(EngineEvent::Started { process_id: id });
                }
            }
        };

        if let Some(stderr_task) = self.stderr_task
            && timeout(STDERR_DRAIN, stderr_task).await.is_err()
        {
            debug!(process_id = id, "Stderr reader still busy after exit");
        }

        let stderr_tail = self.tail.contents();
        match &reason {
            ExitReason::Failed { code } => {
                warn!(process_id = id, ?code, stderr = %stderr_tail, "Encoder failed")
            }
            reason => info!(process_id = id, ?reason, "Encoder exited"),
        }

        _ = self.events.unbounded_send(EngineEvent::Exited(ExitEvent {
            process_id: id,
            reason,
            stderr_tail,
        }));
        _ = reaped_tx.send(());
    }
}

/// Asks the encoder to quit through its stdin command interface, then kills it
/// if it is still running after `grace`.
async fn shutdown(child: &mut Child, id: ProcessId, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take()
        && let Err(error) = stdin.write_all(b"q\n").await
    {
        debug!(process_id = id, ?error, "Failed to send quit command");
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(process_id = id, %status, "Encoder quit gracefully"),
        Ok(Err(error)) => warn!(process_id = id, ?error, "Failed to wait for encoder"),
        Err(_) => {
            warn!(process_id = id, ?grace, "Encoder did not quit in time, killing it");
            if let Err(error) = child.kill().await {
                error!(process_id = id, ?error, "Failed to kill encoder");
            }
        }
    }
}

async fn collect_stderr(mut stderr: ChildStderr, tail: StderrTail) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(error) => {
                debug!(?error, "Stopped reading encoder stderr");
                break;
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ProbeReport {
    pub success: bool,
    pub message: String,
}

/// Checks that the encoder can be executed by running `<program> -version`.
pub async fn probe_encoder(program: &str, limit: Duration) -> ProbeReport {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let (success, message) = match timeout(limit, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout.lines().next().unwrap_or_default().trim();
            (true, format!("Encoder available: {version}"))
        }
        Ok(Ok(output)) => (false, format!("Encoder check exited with {}", output.status)),
        Ok(Err(error)) => (false, format!("Encoder not available: {error}")),
        Err(_) => (false, format!("Encoder did not respond within {limit:?}")),
    };

    debug!(program, success, %message, "Encoder probe finished");
    ProbeReport { success, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::new(8);
        tail.push(b"abc");
        assert_eq!(tail.contents(), "abc");

        tail.push(b"defghij");
        assert_eq!(tail.len(), 8);
        assert_eq!(tail.contents(), "cdefghij");

        tail.push(b"0123456789abcdef");
        assert_eq!(tail.contents(), "89abcdef");
    }

    #[test]
    fn test_stderr_tail_lossy_decode() {
        let tail = StderrTail::new(16);
        tail.push(&[b'o', b'k', 0xff, b'!']);
        assert_eq!(tail.contents(), "ok\u{fffd}!");
        assert!(!tail.is_empty());
    }

    #[tokio::test]
    async fn test_probe_missing_encoder() {
        let report = probe_encoder("/nonexistent/ffmpeg", Duration::from_secs(1)).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Encoder not available"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::models::StreamConfig;
        use crate::stream::command::build_command;
        use futures::StreamExt;
        use futures::channel::mpsc::{UnboundedReceiver, unbounded};
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::time::Instant;
        use tempfile::TempDir;

        fn fake_encoder(dir: &TempDir, name: &str, body: &str) -> String {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn command() -> EncoderCommand {
            let config = StreamConfig {
                stream_key: "key".into(),
                ..Default::default()
            };
            build_command(&config, Path::new("in.mp4")).unwrap()
        }

        fn supervisor(
            program: String,
            probe: Duration,
        ) -> (ProcessSupervisor, UnboundedReceiver<EngineEvent>) {
            let (tx, rx) = unbounded();
            (ProcessSupervisor::new(program, probe, 1024, tx), rx)
        }

        async fn next_event(rx: &mut UnboundedReceiver<EngineEvent>) -> EngineEvent {
            timeout(Duration::from_secs(10), rx.next())
                .await
                .expect("event in time")
                .expect("channel open")
        }

        #[tokio::test]
        async fn test_spawn_error_leaves_no_handle() {
            let (mut supervisor, _rx) =
                supervisor("/nonexistent/ffmpeg".into(), Duration::from_secs(10));
            let result = supervisor.start(&command());
            assert!(matches!(result, Err(StreamError::Spawn(_))));
            assert!(!supervisor.is_running());
        }

        #[tokio::test]
        async fn test_failure_reports_code_and_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "fail.sh", "echo 'Invalid argument' >&2\nexit 3");
            let (mut supervisor, mut rx) = supervisor(program, Duration::from_secs(10));

            let id = supervisor.start(&command()).unwrap();
            let EngineEvent::Exited(exit) = next_event(&mut rx).await else {
                panic!("expected exit event");
            };
            assert_eq!(exit.process_id, id);
            assert_eq!(exit.reason, ExitReason::Failed { code: Some(3) });
            assert_eq!(exit.stderr_tail, "Invalid argument");

            // Still active until the owner releases it
            assert_eq!(supervisor.active_id(), Some(id));
            supervisor.release(id);
            assert!(!supervisor.is_running());
        }

        #[tokio::test]
        async fn test_second_start_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "wait.sh", "read line\nexit 0");
            let (mut supervisor, _rx) = supervisor(program, Duration::from_secs(10));

            let id = supervisor.start(&command()).unwrap();
            assert!(matches!(
                supervisor.start(&command()),
                Err(StreamError::AlreadyRunning)
            ));
            assert_eq!(supervisor.active_id(), Some(id));
            supervisor.stop(Duration::from_secs(5)).await.unwrap();
        }

        #[tokio::test]
        async fn test_graceful_stop() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "wait.sh", "read line\nexit 0");
            let (mut supervisor, mut rx) = supervisor(program, Duration::from_secs(10));

            let id = supervisor.start(&command()).unwrap();
            let started = Instant::now();
            supervisor.stop(Duration::from_secs(5)).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(!supervisor.is_running());

            let EngineEvent::Exited(exit) = next_event(&mut rx).await else {
                panic!("expected exit event");
            };
            assert_eq!(exit.process_id, id);
            assert_eq!(exit.reason, ExitReason::ExplicitStop);

            // Idempotent
            supervisor.stop(Duration::from_secs(5)).await.unwrap();
        }

        #[tokio::test]
        async fn test_stop_kills_unresponsive_encoder() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "stuck.sh", "exec sleep 30");
            let (mut supervisor, mut rx) = supervisor(program, Duration::from_secs(10));

            supervisor.start(&command()).unwrap();
            let started = Instant::now();
            supervisor.stop(Duration::from_millis(200)).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(10));

            let EngineEvent::Exited(exit) = next_event(&mut rx).await else {
                panic!("expected exit event");
            };
            assert_eq!(exit.reason, ExitReason::ExplicitStop);
        }

        #[tokio::test]
        async fn test_started_event_after_probe() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "stuck.sh", "exec sleep 30");
            let (mut supervisor, mut rx) = supervisor(program, Duration::from_millis(50));

            let id = supervisor.start(&command()).unwrap();
            assert!(matches!(
                next_event(&mut rx).await,
                EngineEvent::Started { process_id } if process_id == id
            ));

            supervisor.stop(Duration::from_millis(200)).await.unwrap();
            assert!(matches!(next_event(&mut rx).await, EngineEvent::Exited(_)));
        }

        #[tokio::test]
        async fn test_probe_encoder_reports_version() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_encoder(&dir, "ffmpeg", "echo 'ffmpeg version 7.1'");
            let report = probe_encoder(&program, Duration::from_secs(5)).await;
            assert!(report.success, "{}", report.message);
            assert_eq!(report.message, "Encoder available: ffmpeg version 7.1");
        }
    }
}
