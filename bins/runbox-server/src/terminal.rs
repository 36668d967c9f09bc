/// Terminal Session Registry - One Shell Per Project
///
/// **Core Responsibility:**
/// Own at most one interactive shell (on a PTY) per project id, multiplex
/// its output to every subscriber in order, and detect the completion
/// sentinel for remotely-issued commands.
///
/// Lifecycle per project:
/// - first join spawns the shell; later joins reuse it
/// - output chunks are sentinel-scanned, then broadcast
/// - the session dies when the shell exits by itself (subscribers get
///   `Closed`) or when the last subscriber leaves (shell is killed)
///
/// Mutations of one project's entry are serialized by the registry lock;
/// different projects and their I/O proceed fully in parallel.
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Textual marker appended to remotely-issued commands; a line consisting
/// of exactly this text signals that the command has finished.
pub const COMPLETION_SENTINEL: &str = "--CMD_COMPLETE--";

const BROADCAST_CAPACITY: usize = 256;

/// Events fanned out to every subscriber of a project's room, in the order
/// they were produced.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Raw shell output, cleaned of the completion sentinel.
    Data(String),
    /// A sentinel-tagged command finished.
    CommandDone,
    /// A code-change delta relayed between collaborators.
    CodeChange(serde_json::Value),
    /// The shell exited on its own; the session is gone.
    Closed,
}

struct Session {
    // Held to keep the PTY alive; dropping it unblocks the reader thread.
    _master: Box<dyn MasterPty + Send>,
    // Per-session lock: a stalled PTY writer must only stall its own
    // project, never the registry.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Box<dyn Child + Send + Sync>,
    events: broadcast::Sender<RoomEvent>,
    subscribers: usize,
    pending: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    epoch: u64,
}

pub struct TerminalRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    shell: String,
    cols: u16,
    rows: u16,
    epochs: AtomicU64,
    sessions: Mutex<HashMap<String, Session>>,
}

impl TerminalRegistry {
    pub fn new(shell: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                shell: shell.into(),
                cols,
                rows,
                epochs: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a subscriber to the project's session, spawning the shell on
    /// first join. Idempotent with respect to the shell: a second join
    /// never spawns a duplicate. On spawn failure the registry stays
    /// Absent, so a later join can retry.
    pub fn join(&self, project_id: &str) -> Result<broadcast::Receiver<RoomEvent>> {
        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get_mut(project_id) {
            session.subscribers += 1;
            debug!(project_id, subscribers = session.subscribers, "Joined existing terminal session");
            return Ok(session.events.subscribe());
        }

        let session = self.spawn_session(project_id)?;
        let receiver = session.events.subscribe();
        sessions.insert(project_id.to_string(), session);
        info!(project_id, shell = %self.inner.shell, "Terminal session started");
        Ok(receiver)
    }

    /// Detach a subscriber. When the last one leaves, the shell is killed
    /// and the entry discarded; a later join gets a fresh session.
    pub fn leave(&self, project_id: &str) {
        let mut sessions = self.inner.sessions.lock();
        let Some(session) = sessions.get_mut(project_id) else {
            return;
        };
        session.subscribers = session.subscribers.saturating_sub(1);
        if session.subscribers > 0 {
            debug!(project_id, subscribers = session.subscribers, "Left terminal session");
            return;
        }

        let mut session = sessions.remove(project_id).expect("entry present");
        if let Err(e) = session.child.kill() {
            warn!(project_id, error = %e, "Failed to kill shell process");
        }
        info!(project_id, "Terminal session torn down (room empty)");
        // dropping the session closes the PTY and unblocks the reader
    }

    /// Forward raw bytes to the shell's input, in submission order. The
    /// registry lock is released before the write, so a stalled PTY only
    /// blocks its own project.
    pub fn write(&self, project_id: &str, data: &str) -> Result<()> {
        let writer = self.writer_for(project_id)?;
        let mut writer = writer.lock();
        writer
            .write_all(data.as_bytes())
            .context("failed to write to shell")?;
        writer.flush().context("failed to flush shell input")?;
        Ok(())
    }

    /// Issue a command tagged with the completion sentinel. The returned
    /// receiver resolves exactly once, when the sentinel shows up in the
    /// shell's output. Rejected while a previous command is still
    /// outstanding for this project.
    pub fn run_command(&self, project_id: &str, command: &str) -> Result<oneshot::Receiver<()>> {
        let (writer, pending) = {
            let sessions = self.inner.sessions.lock();
            let session = sessions
                .get(project_id)
                .ok_or_else(|| anyhow!("no terminal session for project {project_id}"))?;
            (Arc::clone(&session.writer), Arc::clone(&session.pending))
        };

        let rx = {
            let mut slot = pending.lock();
            if slot.is_some() {
                bail!("a command is already running for project {project_id}");
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };

        let line = format!("{command} ; echo \"{COMPLETION_SENTINEL}\"\n");
        let mut writer = writer.lock();
        if let Err(e) = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
        {
            // never leave the slot armed for a command that was not sent
            pending.lock().take();
            return Err(anyhow!("failed to issue command: {e}"));
        }
        Ok(rx)
    }

    /// Relay a code-change delta to every subscriber of the project's room.
    /// Deltas ride the same ordered channel as terminal output.
    pub fn broadcast_code_change(&self, project_id: &str, delta: serde_json::Value) -> Result<()> {
        let sessions = self.inner.sessions.lock();
        let session = sessions
            .get(project_id)
            .ok_or_else(|| anyhow!("no room for project {project_id}"))?;
        let _ = session.events.send(RoomEvent::CodeChange(delta));
        Ok(())
    }

    fn writer_for(&self, project_id: &str) -> Result<Arc<Mutex<Box<dyn Write + Send>>>> {
        self.inner
            .sessions
            .lock()
            .get(project_id)
            .map(|s| Arc::clone(&s.writer))
            .ok_or_else(|| anyhow!("no terminal session for project {project_id}"))
    }

    pub fn has_session(&self, project_id: &str) -> bool {
        self.inner.sessions.lock().contains_key(project_id)
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .get(project_id)
            .map(|s| s.subscribers)
            .unwrap_or(0)
    }

    fn spawn_session(&self, project_id: &str) -> Result<Session> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.inner.rows,
                cols: self.inner.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(&self.inner.shell);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn shell {}", self.inner.shell))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let pending: Arc<Mutex<Option<oneshot::Sender<()>>>> = Arc::new(Mutex::new(None));
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let project = project_id.to_string();
        let events_tx = events.clone();
        let pending_slot = Arc::clone(&pending);
        thread::spawn(move || {
            let mut scanner = SentinelScanner::new(COMPLETION_SENTINEL);
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        let scanned = scanner.scan(&chunk);
                        for _ in 0..scanned.completions {
                            let _ = events_tx.send(RoomEvent::CommandDone);
                            // slot cleared before firing, so a stray
                            // duplicate sentinel cannot re-trigger the waiter
                            if let Some(tx) = pending_slot.lock().take() {
                                let _ = tx.send(());
                            }
                        }
                        if !scanned.data.is_empty() {
                            let _ = events_tx.send(RoomEvent::Data(scanned.data));
                        }
                    }
                }
            }
            inner.remove_exited(&project, epoch);
        });

        Ok(Session {
            _master: pair.master,
            writer: Arc::new(Mutex::new(writer)),
            child,
            events,
            subscribers: 1,
            pending,
            epoch,
        })
    }
}

impl Inner {
    /// Called from a session's reader thread when its PTY reaches EOF. The
    /// epoch check keeps a stale thread from tearing down a fresh session
    /// created for the same project after a rejoin.
    fn remove_exited(&self, project_id: &str, epoch: u64) {
        let mut sessions = self.sessions.lock();
        let matches = sessions
            .get(project_id)
            .map(|s| s.epoch == epoch)
            .unwrap_or(false);
        if !matches {
            return;
        }
        let mut session = sessions.remove(project_id).expect("entry present");
        let _ = session.events.send(RoomEvent::Closed);
        let _ = session.child.kill();
        info!(project_id, "Terminal session closed (shell exited)");
    }
}

/// Incremental sentinel detector. Output arrives in arbitrary chunks, so
/// the scanner carries unterminated line state across calls. A completed
/// line *ending* with the sentinel counts as a completion: `echo` always
/// puts the marker at end of line, and a command whose output lacks a
/// trailing newline leaves that output glued to the front of the marker
/// (`printf hi` -> `hi--CMD_COMPLETE--`), which is forwarded with the
/// sentinel stripped. A mid-line occurrence is the PTY echoing the issued
/// command back (`cmd ; echo "--CMD_COMPLETE--"`) and is excised without
/// completing. Unterminated output such as prompts is flushed immediately,
/// minus any tail that could still grow into a sentinel.
struct SentinelScanner {
    sentinel: &'static str,
    carry: String,
}

struct ScannedChunk {
    data: String,
    completions: usize,
}

impl SentinelScanner {
    fn new(sentinel: &'static str) -> Self {
        Self {
            sentinel,
            carry: String::new(),
        }
    }

    fn scan(&mut self, chunk: &str) -> ScannedChunk {
        self.carry.push_str(chunk);
        let mut data = String::new();
        let mut completions = 0;

        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if let Some(prefix) = trimmed.strip_suffix(self.sentinel) {
                completions += 1;
                let prefix = prefix.replace(self.sentinel, "");
                if !prefix.is_empty() {
                    data.push_str(&prefix);
                    data.push_str(&line[trimmed.len()..]);
                }
            } else if line.contains(self.sentinel) {
                data.push_str(&line.replace(self.sentinel, ""));
            } else {
                data.push_str(&line);
            }
        }

        // Flush the unterminated tail so prompts stay interactive, holding
        // back only a suffix that is still a prefix of the sentinel.
        let hold = self.holdback_len();
        if self.carry.len() > hold {
            let flush_to = self.carry.len() - hold;
            let flushed: String = self.carry.drain(..flush_to).collect();
            data.push_str(&flushed);
        }

        ScannedChunk { data, completions }
    }

    /// Longest suffix of the carry (capped at the sentinel length) that is
    /// a prefix of the sentinel. Byte-wise: the sentinel is ASCII, so a
    /// match is always a valid char boundary in the carry.
    fn holdback_len(&self) -> usize {
        let carry = self.carry.as_bytes();
        let sentinel = self.sentinel.as_bytes();
        let max = sentinel.len().min(carry.len());
        for len in (1..=max).rev() {
            if sentinel.starts_with(&carry[carry.len() - len..]) {
                return len;
            }
        }
        0
    }
}
