//! One interactive shell in a pseudo-terminal

use crate::error::{GateError, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 4096;

/// Event delivered to stream subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalEvent {
    Data { data: String },
    Exit,
}

pub struct TerminalSession {
    id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output: broadcast::Sender<TerminalEvent>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("exited", &self.has_exited())
            .finish()
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl TerminalSession {
    /// Open a PTY and start `shell` in `cwd`
    pub fn spawn(id: String, shell: &str, cwd: &Path, cols: u16, rows: u16) -> Result<Arc<Self>> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| GateError::terminal(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GateError::terminal(format!("Failed to start shell '{}': {}", shell, e)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GateError::terminal(format!("Failed to read from PTY: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GateError::terminal(format!("Failed to write to PTY: {}", e)))?;

        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));

        let session = Arc::new(Self {
            id: id.clone(),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            output: output.clone(),
            exited: Arc::clone(&exited),
        });

        // PTY reads block, so they get a thread of their own
        std::thread::Builder::new()
            .name(format!("pty-{}", id))
            .spawn(move || read_loop(reader, output, exited))
            .map_err(|e| GateError::terminal(format!("Failed to start PTY reader: {}", e)))?;

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Live output from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.output.subscribe()
    }

    pub fn write(&self, data: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(|e| GateError::terminal(format!("Failed to resize PTY: {}", e)))
    }

    /// Kill the shell; the reader thread ends once the PTY closes
    pub fn kill(&self) {
        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.kill() {
            debug!("Terminal {} kill failed: {}", self.id, e);
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    output: broadcast::Sender<TerminalEvent>,
    exited: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    // Bytes of a UTF-8 sequence split across reads
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buffer[..n]);
                let data = take_utf8(&mut pending);
                if !data.is_empty() {
                    // No subscribers is fine
                    let _ = output.send(TerminalEvent::Data { data });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        let _ = output.send(TerminalEvent::Data { data });
    }
    exited.store(true, Ordering::SeqCst);
    if output.send(TerminalEvent::Exit).is_err() {
        warn!("Terminal exited with no stream attached");
    }
}

/// Decode the longest valid prefix, keeping an incomplete trailing sequence for later
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let tail = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let data = serde_json::to_value(TerminalEvent::Data { data: "hi".to_string() }).unwrap();
        assert_eq!(data, serde_json::json!({"type": "data", "data": "hi"}));
        let exit = serde_json::to_value(TerminalEvent::Exit).unwrap();
        assert_eq!(exit, serde_json::json!({"type": "exit"}));
    }

    #[test]
    fn test_split_utf8_sequence_is_kept() {
        let bytes = "héllo".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_echo_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let session = TerminalSession::spawn("t1".to_string(), "/bin/sh", dir.path(), 80, 24).unwrap();
        let mut rx = session.subscribe();

        session.write("echo agentgate-pty-$((40+2))\n").unwrap();
        session.write("exit\n").unwrap();

        let mut seen = String::new();
        let mut exited = false;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await {
                Ok(Ok(TerminalEvent::Data { data })) => seen.push_str(&data),
                Ok(Ok(TerminalEvent::Exit)) => {
                    exited = true;
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }

        assert!(seen.contains("agentgate-pty-42"), "output was: {:?}", seen);
        assert!(exited);
        assert!(session.has_exited());
    }
}
