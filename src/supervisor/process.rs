//! Backend subprocess handle
//!
//! Owns one OS process: spawn, output capture, exit detection, and layered termination.
//! Output and exit are delivered on a bounded channel of [`ProcessEvent`]s.

use crate::error::StartError;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Capacity of the event channel; line readers wait when it is full
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Longest line forwarded as one event; longer output is split
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Exited { code: Option<i32>, signal: Option<i32> },
    FailedToStart { reason: String },
    Stopped,
}

impl ProcessState {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    fn from_exit_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ProcessState::Exited {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited { code: Some(code), .. } => write!(f, "exited with code {}", code),
            ProcessState::Exited { signal: Some(signal), .. } => write!(f, "killed by signal {}", signal),
            ProcessState::Exited { .. } => write!(f, "exited"),
            ProcessState::FailedToStart { reason } => write!(f, "failed to start: {}", reason),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Something observed on a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ProcessState),
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Graceful,
    Killed,
    /// The process did not report an exit even after the kill
    TimedOut,
}

/// Everything needed to launch the backend
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Handle to a running backend process
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct BackendProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessState>>,
}

impl BackendProcess {
    /// Spawn the process and start capturing its output
    pub fn start(spec: &LaunchSpec) -> Result<(Self, mpsc::Receiver<ProcessEvent>), StartError> {
        let program = spec.program.display().to_string();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches the backend's children too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| StartError::from_io(&program, &e))?;
        let pid = child.id();
        info!("✅ Backend started with PID {:?}: {}", pid, spec.display_command());

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump_lines(stdout, event_tx.clone(), ProcessEvent::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_lines(stderr, event_tx.clone(), ProcessEvent::Stderr)));

        tokio::spawn(async move {
            let state = wait_for_exit(child, kill_rx, pid).await;
            debug!("Backend PID {:?} {}", pid, state);

            // Let buffered output drain before announcing the exit
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = timeout(Duration::from_millis(500), task).await;
            }

            let _ = exit_tx.send(Some(state.clone()));
            let _ = event_tx.send(ProcessEvent::Exited(state)).await;
        });

        Ok((
            Self {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx,
            },
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit state, once the process has exited
    pub fn exit_state(&self) -> Option<ProcessState> {
        self.exit_rx.borrow().clone()
    }

    /// Graceful signal, wait; then forceful kill, wait. Always resolves.
    pub async fn stop(mut self, graceful: Duration, kill_wait: Duration) -> StopOutcome {
        if self.exit_state().is_some() {
            return StopOutcome::AlreadyExited;
        }

        if self.send_terminate() {
            if self.wait_exit(graceful).await {
                info!("Backend PID {:?} exited after SIGTERM", self.pid);
                return StopOutcome::Graceful;
            }
            warn!(
                "Backend PID {:?} ignored SIGTERM for {:?}, killing",
                self.pid, graceful
            );
        }

        self.send_kill();
        if self.wait_exit(kill_wait).await {
            StopOutcome::Killed
        } else {
            warn!("Backend PID {:?} did not exit within {:?} of the kill", self.pid, kill_wait);
            StopOutcome::TimedOut
        }
    }

    async fn wait_exit(&mut self, limit: Duration) -> bool {
        matches!(
            timeout(limit, self.exit_rx.wait_for(|state| state.is_some())).await,
            Ok(Ok(_))
        )
    }

    /// Send SIGTERM to the process group; false when no graceful signal exists
    #[cfg(unix)]
    fn send_terminate(&self) -> bool {
        match self.pid {
            Some(pid) => {
                let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
                if rc != 0 {
                    // Group may already be gone; fall back to the process itself
                    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                }
                true
            }
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&self) -> bool {
        false
    }

    fn send_kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        }
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Forward output lines until the pipe closes
///
/// The pipe is drained to the end even when nobody listens any more, so the backend never
/// writes into a closed pipe.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<ProcessEvent>, wrap: fn(String) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    let mut forwarding = true;
    loop {
        match read_capped_line(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(wrap(text)).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                debug!("Backend output pipe failed: {}", e);
                break;
            }
        }
    }
}

/// Read up to and including the next newline, keeping at most `max` bytes
///
/// Returns the number of bytes consumed from the reader; 0 means end of stream. A line
/// longer than `max` is returned in pieces.
async fn read_capped_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let room = max - line.len();
        let (take, complete) = match available.iter().take(room).position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len().min(room), false),
        };
        line.extend_from_slice(&available[..take]);
        reader.consume(take);
        consumed += take;
        if complete || line.len() >= max {
            return Ok(consumed);
        }
    }
}

async fn wait_for_exit(mut child: Child, kill_rx: oneshot::Receiver<()>, pid: Option<u32>) -> ProcessState {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the handle is dropped
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("start_kill for PID {:?} failed: {}", pid, e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => ProcessState::from_exit_status(status),
        Err(e) => {
            warn!("Failed to wait for backend PID {:?}: {}", pid, e);
            ProcessState::Exited { code: None, signal: None }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: vec![("GATE_TEST".to_string(), "yes".to_string())],
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit() {
        let (_process, mut events) =
            BackendProcess::start(&sh("echo out-$GATE_TEST; echo err >&2; exit 3")).unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, ProcessEvent::Exited(_));
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(seen.contains(&ProcessEvent::Stdout("out-yes".to_string())));
        assert!(seen.contains(&ProcessEvent::Stderr("err".to_string())));
        assert_eq!(
            seen.last(),
            Some(&ProcessEvent::Exited(ProcessState::Exited { code: Some(3), signal: None }))
        );
    }

    async fn collect_until_exit(events: &mut mpsc::Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, ProcessEvent::Exited(_));
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_capture() {
        let (_process, mut events) =
            BackendProcess::start(&sh("printf 'bad \\377 byte\\n'; echo after; exit 0")).unwrap();

        let seen = collect_until_exit(&mut events).await;
        assert!(seen.contains(&ProcessEvent::Stdout("bad \u{FFFD} byte".to_string())));
        assert!(seen.contains(&ProcessEvent::Stdout("after".to_string())));
        assert_eq!(
            seen.last(),
            Some(&ProcessEvent::Exited(ProcessState::Exited { code: Some(0), signal: None }))
        );
    }

    #[tokio::test]
    async fn test_long_line_is_split() {
        let (_process, mut events) = BackendProcess::start(&sh(
            "head -c 40000 /dev/zero | tr '\\0' 'a'; echo; echo tail",
        ))
        .unwrap();

        let seen = collect_until_exit(&mut events).await;
        let pieces: Vec<&String> = seen
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stdout(line) if line.starts_with('a') => Some(line),
                _ => None,
            })
            .collect();
        assert!(pieces.iter().all(|p| p.len() <= MAX_LINE_BYTES));
        assert_eq!(pieces.iter().map(|p| p.len()).sum::<usize>(), 40_000);
        assert!(seen.contains(&ProcessEvent::Stdout("tail".to_string())));
    }

    #[tokio::test]
    async fn test_output_drained_without_listener() {
        let (process, events) = BackendProcess::start(&sh(
            "i=0; while [ $i -lt 3000 ]; do echo line-$i; i=$((i+1)); done; exit 0",
        ))
        .unwrap();
        drop(events);

        let mut exit = None;
        for _ in 0..200 {
            exit = process.exit_state();
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(exit, Some(ProcessState::Exited { code: Some(0), signal: None }));
    }

    #[tokio::test]
    async fn test_read_capped_line() {
        let mut reader = BufReader::new(&b"abcdef\nxy"[..]);
        let mut line = Vec::new();

        assert_eq!(read_capped_line(&mut reader, &mut line, 4).await.unwrap(), 4);
        assert_eq!(line, b"abcd");
        assert_eq!(read_capped_line(&mut reader, &mut line, 4).await.unwrap(), 3);
        assert_eq!(line, b"ef\n");
        assert_eq!(read_capped_line(&mut reader, &mut line, 4).await.unwrap(), 2);
        assert_eq!(line, b"xy");
        assert_eq!(read_capped_line(&mut reader, &mut line, 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        let spec = LaunchSpec {
            program: PathBuf::from("/definitely/not/here/opencode"),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: vec![],
        };
        let err = BackendProcess::start(&spec).unwrap_err();
        assert!(matches!(err, StartError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (process, _events) = BackendProcess::start(&sh("sleep 30")).unwrap();
        let outcome = process
            .stop(Duration::from_secs(2), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_kill_after_ignored_sigterm() {
        let (process, mut events) =
            BackendProcess::start(&sh("trap '' TERM; echo armed; while true; do sleep 1; done")).unwrap();

        // Wait until the trap is installed
        while let Some(event) = events.recv().await {
            if event == ProcessEvent::Stdout("armed".to_string()) {
                break;
            }
        }

        let outcome = process
            .stop(Duration::from_millis(300), Duration::from_secs(3))
            .await;
        assert_eq!(outcome, StopOutcome::Killed);
    }
}
