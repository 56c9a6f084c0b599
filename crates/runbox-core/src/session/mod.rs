//! Session manager — interactive shells inside sandboxes
//!
//! Each session is one terminal attached to a sandbox container. Lifecycle:
//! `initializing -> ready -> running -> ready ...`, ending whenever the
//! process exits or the session is killed. At most one command is in flight
//! per session; the state transition that claims a session happens under
//! the session's state lock so two dispatches can never both win it.
//!
//! A command that outlives its timeout keeps the session `running`. The
//! caller gets the partial output plus the session ID and may [`poll`] later
//! to keep waiting on the same invocation. Without a poll the session stays
//! busy and new dispatches open a fresh session.
//!
//! [`poll`]: SessionManager::poll

pub mod matcher;
pub mod protocol;
pub mod pty;
pub mod readiness;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ResourceKind, Result, RunboxError};
use crate::ids::{generate_session_id, validate_id};
use crate::registry::{CommandLease, SandboxRegistry};

use matcher::SentinelMatcher;
use protocol::{COMPLETION_COUNT, extract_output, new_sentinel, wrap_command};
use pty::{TerminalIo, TerminalSize, TerminalSpawner};
use readiness::{ReadinessDetector, detector_for};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Ready,
    Running,
}

/// Public view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub sandbox_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// The command in flight, if any
    pub command: Option<String>,
}

/// Result of running a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed {
        session_id: String,
        /// The command's own output, without the echoed line or sentinel
        output: String,
        /// Everything the terminal printed for this invocation, ANSI-stripped
        transcript: String,
        truncated: bool,
    },
    /// Not a failure: the command is still running in `session_id`
    TimedOut {
        session_id: String,
        partial: String,
    },
}

impl ExecOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            ExecOutcome::Completed { session_id, .. } | ExecOutcome::TimedOut { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecOutcome::Completed { .. })
    }
}

struct Status {
    state: SessionState,
    last_used_at: DateTime<Utc>,
    command: Option<String>,
}

/// One command in flight
struct Invocation {
    sentinel: String,
    matcher: SentinelMatcher,
    buffer: Vec<u8>,
    truncated: bool,
    started: Instant,
    // Keeps the sandbox off the eviction list until the command is collected
    _lease: Option<CommandLease>,
}

impl Invocation {
    fn new(sentinel: String, lease: Option<CommandLease>) -> Self {
        Self {
            matcher: SentinelMatcher::new(&sentinel),
            sentinel,
            buffer: Vec::new(),
            truncated: false,
            started: Instant::now(),
            _lease: lease,
        }
    }

    fn feed(&mut self, chunk: &[u8], max_bytes: usize) -> usize {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > max_bytes {
            let excess = self.buffer.len() - max_bytes;
            let cut = trim_point(&self.buffer, excess);
            self.buffer.drain(..cut);
            self.truncated = true;
        }
        self.matcher.feed(chunk)
    }

    fn transcript(&self) -> String {
        strip_ansi_escapes::strip_str(String::from_utf8_lossy(&self.buffer))
    }
}

/// Where to cut the head of a capped buffer: just past the first newline
/// at or after `excess`, so no partial line (split UTF-8 sequence or escape
/// sequence) is kept. Without a newline, the next character boundary.
fn trim_point(buffer: &[u8], excess: usize) -> usize {
    let rest = &buffer[excess..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(newline) => excess + newline + 1,
        None => {
            let continuation = rest.iter().take_while(|&&b| b & 0xC0 == 0x80).count();
            excess + continuation
        }
    }
}

struct Channel {
    output: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    invocation: Option<Invocation>,
}

struct Session {
    id: String,
    sandbox_id: String,
    created_at: DateTime<Utc>,
    status: Mutex<Status>,
    io: Mutex<Box<dyn TerminalIo>>,
    channel: tokio::sync::Mutex<Channel>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        let status = self.status.lock();
        SessionInfo {
            id: self.id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            state: status.state,
            created_at: self.created_at,
            last_used_at: status.last_used_at,
            command: status.command.clone(),
        }
    }

    /// `ready -> running`, atomically
    fn try_claim(&self, command: &str) -> bool {
        let mut status = self.status.lock();
        if status.state != SessionState::Ready {
            return false;
        }
        status.state = SessionState::Running;
        status.command = Some(command.to_string());
        status.last_used_at = Utc::now();
        true
    }

    fn set_ready(&self) {
        let mut status = self.status.lock();
        status.state = SessionState::Ready;
        status.command = None;
        status.last_used_at = Utc::now();
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.io.lock().write(data)
    }

    fn kill(&self) {
        self.io.lock().kill();
    }

    fn has_exited(&self) -> bool {
        self.io.lock().has_exited()
    }
}

struct Settings {
    default_timeout: Duration,
    ready_timeout: Duration,
    size: TerminalSize,
    max_output_bytes: usize,
}

pub struct SessionManager {
    registry: Arc<SandboxRegistry>,
    spawner: Arc<dyn TerminalSpawner>,
    detector: Arc<dyn ReadinessDetector>,
    pool: Mutex<HashMap<String, Vec<Arc<Session>>>>,
    settings: Settings,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        registry: Arc<SandboxRegistry>,
        spawner: Arc<dyn TerminalSpawner>,
    ) -> Self {
        Self {
            registry,
            spawner,
            detector: detector_for(config),
            pool: Mutex::new(HashMap::new()),
            settings: Settings {
                default_timeout: config.default_timeout(),
                ready_timeout: config.ready_timeout(),
                size: TerminalSize {
                    rows: config.pty_rows,
                    cols: config.pty_cols,
                },
                max_output_bytes: config.max_output_bytes,
            },
        }
    }

    /// Run `command` in a ready session of `sandbox_id`, opening one if needed.
    ///
    /// Returns `TimedOut` (not an error) when the command has not finished
    /// within `timeout`; the session stays busy with it.
    pub async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome> {
        validate_id(sandbox_id)?;
        let sentinel = new_sentinel();
        let line = wrap_command(command, &sentinel)?;
        let timeout = timeout.unwrap_or(self.settings.default_timeout);

        let session = match self.claim_ready(sandbox_id, command) {
            Some(session) => session,
            None => self.open_session(sandbox_id, command).await?,
        };
        self.registry.touch(sandbox_id);

        {
            let mut channel = session.channel.lock().await;
            // Leftovers from the previous command's prompt
            loop {
                match channel.output.try_recv() {
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        drop(channel);
                        self.discard(&session);
                        return Err(RunboxError::runtime(
                            "session",
                            format!("shell in session {} has exited", session.id),
                        ));
                    }
                }
            }
            channel.invocation = Some(Invocation::new(sentinel, self.registry.lease(sandbox_id)));
        }

        if let Err(e) = session.write(format!("{}\r", line).as_bytes()) {
            self.discard(&session);
            return Err(e);
        }
        debug!("Session {} running: {}", session.id, command);

        self.wait(&session, timeout).await
    }

    /// Keep waiting on the command a timed-out `execute` left behind
    pub async fn poll(&self, session_id: &str, timeout: Option<Duration>) -> Result<ExecOutcome> {
        let session = self
            .find(session_id)
            .ok_or_else(|| RunboxError::not_found(ResourceKind::Session, session_id))?;
        if session.status.lock().state != SessionState::Running {
            return Err(RunboxError::InvalidInput(format!(
                "session {} has no command in flight",
                session_id
            )));
        }
        session.status.lock().last_used_at = Utc::now();
        self.registry.touch(&session.sandbox_id);
        self.wait(&session, timeout.unwrap_or(self.settings.default_timeout))
            .await
    }

    fn claim_ready(&self, sandbox_id: &str, command: &str) -> Option<Arc<Session>> {
        let mut pool = self.pool.lock();
        let sessions = pool.get_mut(sandbox_id)?;
        sessions.retain(|s| {
            let alive = !s.has_exited();
            if !alive {
                debug!("Dropping exited session {}", s.id);
            }
            alive
        });
        sessions.iter().find(|s| s.try_claim(command)).cloned()
    }

    /// Spawn a shell in the sandbox, wait for it to become ready, and hand it
    /// back already claimed for `command`
    async fn open_session(&self, sandbox_id: &str, command: &str) -> Result<Arc<Session>> {
        self.registry.ensure_running(sandbox_id).await?;

        let argv = self.registry.runtime().attach_command(sandbox_id);
        let terminal = self.spawner.spawn(&argv, self.settings.size)?;
        let now = Utc::now();
        let session = Arc::new(Session {
            id: generate_session_id(),
            sandbox_id: sandbox_id.to_string(),
            created_at: now,
            status: Mutex::new(Status {
                state: SessionState::Initializing,
                last_used_at: now,
                command: None,
            }),
            io: Mutex::new(terminal.io),
            channel: tokio::sync::Mutex::new(Channel {
                output: terminal.output,
                invocation: None,
            }),
        });
        self.pool
            .lock()
            .entry(sandbox_id.to_string())
            .or_default()
            .push(session.clone());
        info!("Opened session {} in sandbox {}", session.id, sandbox_id);

        if let Err(e) = self.await_ready(&session).await {
            warn!("Session {} failed to start: {}", session.id, e);
            session.kill();
            self.discard(&session);
            return Err(e);
        }

        // Straight to running: nobody else may claim it in between
        let mut status = session.status.lock();
        status.state = SessionState::Running;
        status.command = Some(command.to_string());
        status.last_used_at = Utc::now();
        drop(status);
        Ok(session)
    }

    async fn await_ready(&self, session: &Session) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.settings.ready_timeout;
        let mut channel = session.channel.lock().await;
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, channel.output.recv()).await {
                Ok(Some(chunk)) => {
                    seen.extend_from_slice(&chunk);
                    let text = strip_ansi_escapes::strip_str(String::from_utf8_lossy(&seen));
                    if self.detector.is_ready(&text) {
                        debug!(
                            "Session {} ready after {:.2}s ({} detector)",
                            session.id,
                            started.elapsed().as_secs_f64(),
                            self.detector.name()
                        );
                        return Ok(());
                    }
                }
                Ok(None) => {
                    return Err(RunboxError::SessionStart(format!(
                        "shell exited during start-up: {}",
                        String::from_utf8_lossy(&seen).trim()
                    )));
                }
                Err(_) => {
                    return Err(RunboxError::SessionStart(format!(
                        "shell not ready after {}s",
                        self.settings.ready_timeout.as_secs()
                    )));
                }
            }
        }
    }

    /// Read output until the sentinel has been seen twice or `timeout` passes
    async fn wait(&self, session: &Arc<Session>, timeout: Duration) -> Result<ExecOutcome> {
        let deadline = Instant::now() + timeout;
        let mut channel = session.channel.lock().await;
        let Channel { output, invocation } = &mut *channel;
        let Some(current) = invocation.as_mut() else {
            return Err(RunboxError::InvalidInput(format!(
                "session {} has no command in flight",
                session.id
            )));
        };

        while current.matcher.count() < COMPLETION_COUNT {
            match tokio::time::timeout_at(deadline, output.recv()).await {
                Ok(Some(chunk)) => {
                    current.feed(&chunk, self.settings.max_output_bytes);
                }
                Ok(None) => {
                    let partial = current.transcript();
                    drop(channel);
                    self.discard(session);
                    warn!("Session {} exited mid-command", session.id);
                    return Err(RunboxError::runtime(
                        "session",
                        format!("shell exited before the command finished: {}", partial.trim()),
                    ));
                }
                Err(_) => {
                    info!(
                        "Command in session {} still running after {:.1}s",
                        session.id,
                        current.started.elapsed().as_secs_f64()
                    );
                    return Ok(ExecOutcome::TimedOut {
                        session_id: session.id.clone(),
                        partial: current.transcript(),
                    });
                }
            }
        }

        let Some(finished) = invocation.take() else {
            return Err(RunboxError::InvalidInput("invocation vanished".to_string()));
        };
        drop(channel);
        session.set_ready();
        self.registry.touch(&session.sandbox_id);

        let transcript = finished.transcript();
        debug!(
            "Session {} finished in {:.2}s ({} bytes)",
            session.id,
            finished.started.elapsed().as_secs_f64(),
            transcript.len()
        );
        Ok(ExecOutcome::Completed {
            session_id: session.id.clone(),
            output: extract_output(&transcript, &finished.sentinel),
            transcript,
            truncated: finished.truncated,
        })
    }

    fn find(&self, session_id: &str) -> Option<Arc<Session>> {
        self.pool
            .lock()
            .values()
            .flatten()
            .find(|s| s.id == session_id)
            .cloned()
    }

    fn discard(&self, session: &Session) {
        let mut pool = self.pool.lock();
        if let Some(sessions) = pool.get_mut(&session.sandbox_id) {
            sessions.retain(|s| s.id != session.id);
            if sessions.is_empty() {
                pool.remove(&session.sandbox_id);
            }
        }
    }

    /// Terminate one session
    pub fn kill_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .find(session_id)
            .ok_or_else(|| RunboxError::not_found(ResourceKind::Session, session_id))?;
        session.kill();
        self.discard(&session);
        info!("Killed session {}", session_id);
        Ok(())
    }

    /// Terminate every session of a sandbox; used before stop and destroy
    pub fn close_sandbox(&self, sandbox_id: &str) -> usize {
        let sessions = self.pool.lock().remove(sandbox_id).unwrap_or_default();
        for session in &sessions {
            session.kill();
        }
        if !sessions.is_empty() {
            info!("Closed {} session(s) of sandbox {}", sessions.len(), sandbox_id);
        }
        sessions.len()
    }

    pub fn close_all(&self) -> usize {
        let all: Vec<Arc<Session>> = self.pool.lock().drain().flat_map(|(_, s)| s).collect();
        for session in &all {
            session.kill();
        }
        all.len()
    }

    /// Sessions, optionally of one sandbox, oldest first
    pub fn list(&self, sandbox_id: Option<&str>) -> Vec<SessionInfo> {
        let pool = self.pool.lock();
        let mut infos: Vec<SessionInfo> = pool
            .iter()
            .filter(|(id, _)| sandbox_id.is_none_or(|wanted| wanted == id.as_str()))
            .flat_map(|(_, sessions)| sessions.iter().map(|s| s.info()))
            .collect();
        infos.sort_by_key(|s| s.created_at);
        infos
    }

    /// Kill sessions idle for longer than `ttl`, and any whose shell is gone.
    /// A `running` session counts as idle once its command is older than `ttl`
    /// without anybody polling it.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let mut reaped = Vec::new();
        {
            let mut pool = self.pool.lock();
            for sessions in pool.values_mut() {
                sessions.retain(|s| {
                    let status = s.status.lock();
                    let stale = status.state != SessionState::Initializing
                        && status.last_used_at < cutoff;
                    drop(status);
                    if stale || s.has_exited() {
                        reaped.push(s.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            pool.retain(|_, sessions| !sessions.is_empty());
        }
        for session in &reaped {
            session.kill();
            info!("Reaped idle session {} of {}", session.id, session.sandbox_id);
        }
        reaped.len()
    }

    /// Periodically reap idle sessions until `cancel` fires
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = manager.reap_idle(ttl);
                        if reaped > 0 {
                            debug!("Reaper removed {} session(s)", reaped);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSpawner, Harness};

    fn completed_output(outcome: &ExecOutcome) -> &str {
        match outcome {
            ExecOutcome::Completed { output, .. } => output,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();

        let outcome = h
            .sessions
            .execute(&sandbox.id, "echo hello", None)
            .await
            .unwrap();
        assert_eq!(completed_output(&outcome), "hello");
        if let ExecOutcome::Completed { transcript, .. } = &outcome {
            assert!(transcript.contains("hello"));
            assert!(!transcript.contains('\u{1b}'));
        }

        let sessions = h.sessions.list(Some(&sandbox.id));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Ready);
        assert_eq!(h.spawner.spawned_argv()[0], vec!["fake-shell", sandbox.id.as_str()]);
    }

    #[tokio::test]
    async fn test_ready_session_is_reused() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();

        let first = h.sessions.execute(&sandbox.id, "echo one", None).await.unwrap();
        let second = h.sessions.execute(&sandbox.id, "echo two", None).await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(completed_output(&second), "two");
        assert_eq!(h.spawner.spawned_argv().len(), 1);
    }

    #[tokio::test]
    async fn test_each_dispatch_uses_a_fresh_sentinel() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.sessions.execute(&sandbox.id, "echo one", None).await.unwrap();
        h.sessions.execute(&sandbox.id, "echo two", None).await.unwrap();

        let sentinels = h.spawner.sentinels();
        assert_eq!(sentinels.len(), 2);
        assert_ne!(sentinels[0], sentinels[1]);
    }

    #[tokio::test]
    async fn test_command_is_escaped_and_terminated_with_cr() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let outcome = h
            .sessions
            .execute(&sandbox.id, "echo 'it''s'", None)
            .await
            .unwrap();
        assert!(outcome.is_completed());

        let written = h.spawner.writes().pop().unwrap();
        assert!(written.starts_with(r"sh -c 'echo '\''it'\'''\''s'\''; echo __END_SIG_"));
        assert!(written.ends_with("__'\r"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_session_busy() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();

        let outcome = h
            .sessions
            .execute(&sandbox.id, "sleep 30", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        let ExecOutcome::TimedOut { session_id, partial } = &outcome else {
            panic!("expected timeout, got {:?}", outcome);
        };
        assert!(!session_id.is_empty());
        assert!(partial.contains("sleep 30"));

        let busy = h.sessions.list(Some(&sandbox.id));
        assert_eq!(busy[0].state, SessionState::Running);
        assert_eq!(busy[0].command.as_deref(), Some("sleep 30"));

        // The next dispatch cannot interleave; it gets a new session
        let next = h.sessions.execute(&sandbox.id, "echo hi", None).await.unwrap();
        assert_ne!(next.session_id(), session_id);
        assert_eq!(h.sessions.list(Some(&sandbox.id)).len(), 2);
    }

    #[tokio::test]
    async fn test_poll_collects_finished_command() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let outcome = h
            .sessions
            .execute(&sandbox.id, "sleep 30", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        let session_id = outcome.session_id().to_string();

        let still = h
            .sessions
            .poll(&session_id, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!still.is_completed());

        h.spawner.finish_sleeps("woke up");
        let done = h.sessions.poll(&session_id, None).await.unwrap();
        assert_eq!(completed_output(&done), "woke up");
        assert_eq!(h.sessions.list(None)[0].state, SessionState::Ready);

        // Ready again, so the next command reuses it
        let again = h.sessions.execute(&sandbox.id, "echo x", None).await.unwrap();
        assert_eq!(again.session_id(), session_id);
    }

    #[tokio::test]
    async fn test_poll_errors() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        assert!(h.sessions.poll("missing", None).await.unwrap_err().is_not_found());

        let done = h.sessions.execute(&sandbox.id, "echo x", None).await.unwrap();
        let err = h.sessions.poll(done.session_id(), None).await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_timed_out_command_holds_eviction_lease() {
        let h = Harness::new(10);
        let busy = h.registry.create(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let idle = h.registry.create(None).await.unwrap();

        h.sessions
            .execute(&busy.id, "sleep 30", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        // Make busy the least recently used
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.registry.touch(&idle.id);

        let evicted = h.registry.evict_if_over_capacity(1).await.unwrap();
        assert_eq!(evicted.as_deref(), Some(idle.id.as_str()));
    }

    #[tokio::test]
    async fn test_execute_resumes_stopped_sandbox() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.registry.stop(&sandbox.id).await.unwrap();

        let outcome = h.sessions.execute(&sandbox.id, "echo back", None).await.unwrap();
        assert_eq!(completed_output(&outcome), "back");
        assert!(h.registry.get(&sandbox.id).unwrap().is_running());
    }

    #[tokio::test]
    async fn test_shell_that_never_prompts_fails_to_start() {
        let h = Harness::with_spawner(3, FakeSpawner::silent());
        let sandbox = h.registry.create(None).await.unwrap();
        let err = h
            .sessions
            .execute(&sandbox.id, "echo hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboxError::SessionStart(_)));
        assert!(h.sessions.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_shell_exit_removes_session() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let err = h
            .sessions
            .execute(&sandbox.id, "exit", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboxError::RuntimeInvocation { .. }));
        assert!(h.sessions.list(None).is_empty());

        let outcome = h.sessions.execute(&sandbox.id, "echo fine", None).await.unwrap();
        assert_eq!(completed_output(&outcome), "fine");
    }

    #[tokio::test]
    async fn test_empty_command_rejected_before_dispatch() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let err = h.sessions.execute(&sandbox.id, " ; ", None).await.unwrap_err();
        assert!(matches!(err, RunboxError::InvalidInput(_)));
        assert!(h.spawner.spawned_argv().is_empty());
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let h = Harness::with_output_cap(3, 64);
        let sandbox = h.registry.create(None).await.unwrap();
        let long = "x".repeat(500);
        let outcome = h
            .sessions
            .execute(&sandbox.id, &format!("echo {}", long), None)
            .await
            .unwrap();
        let ExecOutcome::Completed { transcript, truncated, .. } = outcome else {
            panic!("expected completion");
        };
        assert!(truncated);
        assert!(transcript.len() <= 64);
    }

    #[test]
    fn test_cap_drops_partial_leading_line() {
        let mut invocation = Invocation::new("S".to_string(), None);
        invocation.feed("h\u{e9}llo \x1b[31mred\x1b[0m\nkept\n".as_bytes(), 12);
        assert!(invocation.truncated);
        assert_eq!(invocation.transcript(), "kept\n");
    }

    #[test]
    fn test_cap_without_newline_keeps_char_boundary() {
        let mut invocation = Invocation::new("S".to_string(), None);
        // 'é' is two bytes; a 3-byte cap would start on its second byte
        invocation.feed("x\u{e9}ab".as_bytes(), 3);
        assert!(invocation.truncated);
        assert_eq!(invocation.buffer, b"ab");
        assert!(!invocation.transcript().contains('\u{fffd}'));
    }

    #[tokio::test]
    async fn test_kill_session() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        let outcome = h.sessions.execute(&sandbox.id, "echo x", None).await.unwrap();

        h.sessions.kill_session(outcome.session_id()).unwrap();
        assert!(h.sessions.list(None).is_empty());
        assert_eq!(h.spawner.kills(), 1);
        assert!(h.sessions.kill_session(outcome.session_id()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_close_sandbox_kills_all_its_sessions() {
        let h = Harness::new(3);
        let a = h.registry.create(None).await.unwrap();
        let b = h.registry.create(None).await.unwrap();
        h.sessions
            .execute(&a.id, "sleep 30", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        h.sessions.execute(&a.id, "echo 1", None).await.unwrap();
        h.sessions.execute(&b.id, "echo 2", None).await.unwrap();

        assert_eq!(h.sessions.close_sandbox(&a.id), 2);
        let left = h.sessions.list(None);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sandbox_id, b.id);
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.sessions.execute(&sandbox.id, "echo x", None).await.unwrap();

        assert_eq!(h.sessions.reap_idle(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.sessions.reap_idle(Duration::from_millis(10)), 1);
        assert!(h.sessions.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_cancel() {
        let h = Harness::new(3);
        let cancel = CancellationToken::new();
        let handle = h.sessions.spawn_reaper(
            Duration::from_millis(10),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_never_shares_a_session() {
        let h = Harness::new(3);
        let sandbox = h.registry.create(None).await.unwrap();
        h.sessions.execute(&sandbox.id, "echo warm", None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let sessions = h.sessions.clone();
            let id = sandbox.id.clone();
            handles.push(tokio::spawn(async move {
                sessions
                    .execute(&id, &format!("echo n{}", i), None)
                    .await
                    .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let outcome = handle.await.unwrap();
            assert_eq!(completed_output(&outcome), format!("n{}", i));
        }
    }
}
