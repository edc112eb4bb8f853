//! Interactive session: one long-lived child on a PTY, driven one request at
//! a time.
//!
//! Each session runs two tasks. The reader owns the framer and polls the PTY
//! without blocking; the writer owns the write path and acknowledges every
//! write. Both talk to the session through bounded channels, and all of them
//! observe the lifecycle through a `watch` channel so that `stop` or a crash
//! fails an in-flight `send` at once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{PatternError, PtyError, SendError, SendResult, StartupError, StartupResult};
use crate::framer::{FramePolicy, Flush, Framer};
use crate::launch::{CredentialEnv, LaunchSpec};
use crate::pty::{PtyHandle, ReadOutcome};
use crate::sanitize::Sanitizer;
use crate::transcript::{Direction, Transcript, TranscriptEntry};

const READ_CHUNK: usize = 8 * 1024;
const MIN_READ_BACKOFF: Duration = Duration::from_millis(5);
const MAX_READ_BACKOFF: Duration = Duration::from_millis(50);
const COMMAND_QUEUE: usize = 4;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Terminating,
    Terminated,
    Crashed,
}

impl SessionState {
    /// `stop` has begun or finished.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }

    /// No further request can succeed.
    pub fn is_dead(self) -> bool {
        self.is_shutting_down() || self == SessionState::Crashed
    }
}

/// Compare-and-set wrapper over the lifecycle watch channel.
struct Lifecycle {
    tx: watch::Sender<SessionState>,
}

impl Lifecycle {
    fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Starting);
        Self { tx }
    }

    fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.tx.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Any live state moves to `Crashed`. Returns false if already dead.
    fn crash(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.is_dead() {
                false
            } else {
                *s = SessionState::Crashed;
                true
            }
        })
    }

    /// Claim the stop. Only the first caller gets `true`.
    fn begin_stop(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.is_shutting_down() {
                false
            } else {
                *s = SessionState::Terminating;
                true
            }
        })
    }

    fn finish(&self) {
        self.tx.send_replace(SessionState::Terminated);
    }
}

/// Returns the session to `Ready` when a `send` ends, however it ends.
struct BusyGuard<'a>(&'a Lifecycle);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.transition(SessionState::Busy, SessionState::Ready);
    }
}

/// Compiled framer and sanitizer tables, shared by every session of a
/// registry.
#[derive(Debug, Clone)]
pub struct SessionRules {
    pub framer: Arc<FramePolicy>,
    pub sanitizer: Arc<Sanitizer>,
}

impl SessionRules {
    pub fn compile(config: &SessionConfig) -> Result<Self, PatternError> {
        Ok(Self {
            framer: Arc::new(FramePolicy::new(&config.framer)?),
            sanitizer: Arc::new(Sanitizer::new(&config.sanitizer)?),
        })
    }
}

impl Default for SessionRules {
    fn default() -> Self {
        Self {
            framer: Arc::new(FramePolicy::default()),
            sanitizer: Arc::new(Sanitizer::default()),
        }
    }
}

/// `{exists, alive}` as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub exists: bool,
    pub alive: bool,
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub program: PathBuf,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub alive: bool,
    pub transcript_len: usize,
}

enum ReaderCommand {
    /// Arm the framer for a request and deliver the next flush to `reply`.
    Begin {
        echo: String,
        reply: oneshot::Sender<Flush>,
    },
    /// Discard the startup banner once output has been quiet for `quiet`,
    /// or at `deadline`. Reports the number of bytes dropped.
    Settle {
        quiet: Duration,
        deadline: Instant,
        done: oneshot::Sender<usize>,
    },
}

struct WriteRequest {
    bytes: Vec<u8>,
    ack: oneshot::Sender<Result<(), PtyError>>,
}

/// A running interactive child.
pub struct InteractiveSession {
    id: String,
    program: PathBuf,
    line_terminator: String,
    pty: Arc<PtyHandle>,
    lifecycle: Lifecycle,
    reader_tx: mpsc::Sender<ReaderCommand>,
    writer_tx: mpsc::Sender<WriteRequest>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    transcript: Option<Mutex<Transcript>>,
    stop_grace: Duration,
    created_at: Instant,
    started_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
}

impl InteractiveSession {
    /// Resolve, spawn and wait for the child to settle. The startup banner,
    /// if any, is discarded.
    pub async fn start(
        id: impl Into<String>,
        launch: &LaunchSpec,
        env: &CredentialEnv,
        config: &SessionConfig,
        rules: &SessionRules,
    ) -> StartupResult<Self> {
        let id = id.into();
        let resolved = launch.resolve(env)?;
        let pty = Arc::new(PtyHandle::spawn(&resolved, env, config.cols, config.rows)?);

        let lifecycle = Lifecycle::new();
        let now = Instant::now();
        let framer = Framer::new(Arc::clone(&rules.framer), Arc::clone(&rules.sanitizer), now);

        let (reader_tx, reader_rx) = mpsc::channel(COMMAND_QUEUE);
        let (writer_tx, writer_rx) = mpsc::channel(COMMAND_QUEUE);

        let reader = ReadLoop {
            id: id.clone(),
            pty: Arc::clone(&pty),
            framer,
            pending: None,
            settling: None,
        };
        let reader = tokio::spawn(reader.run(reader_rx, lifecycle.subscribe()));
        let writer = tokio::spawn(write_loop(
            id.clone(),
            Arc::clone(&pty),
            writer_rx,
            lifecycle.subscribe(),
        ));

        let session = Self {
            id,
            program: resolved.program,
            line_terminator: resolved.line_terminator,
            pty,
            lifecycle,
            reader_tx,
            writer_tx,
            tasks: Mutex::new(vec![reader, writer]),
            transcript: config
                .transcript
                .then(|| Mutex::new(Transcript::new(config.transcript_max_entries))),
            stop_grace: config.stop_grace(),
            created_at: now,
            started_at: Utc::now(),
            last_activity: Mutex::new(now),
        };

        let banner = session
            .settle(config.banner_settle(), config.startup_grace())
            .await;
        match banner {
            Some(discarded)
                if session.pty.is_alive()
                    && session
                        .lifecycle
                        .transition(SessionState::Starting, SessionState::Ready) =>
            {
                info!(
                    session_id = %session.id,
                    pid = ?session.pty.pid(),
                    banner_bytes = discarded,
                    "session ready"
                );
                Ok(session)
            }
            _ => {
                session.stop().await;
                let code = session.pty.exit_code();
                warn!(session_id = %session.id, code = ?code, "child exited during startup");
                Err(StartupError::ExitedEarly { code })
            }
        }
    }

    /// Ask the reader to drop the banner. `None` if the reader went away,
    /// which only happens when the PTY closed.
    async fn settle(&self, quiet: Duration, grace: Duration) -> Option<usize> {
        let (done, rx) = oneshot::channel();
        let cmd = ReaderCommand::Settle {
            quiet,
            deadline: Instant::now() + grace,
            done,
        };
        self.reader_tx.send(cmd).await.ok()?;
        rx.await.ok()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    /// Observe lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn is_alive(&self) -> bool {
        !self.state().is_dead() && self.pty.is_alive()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            exists: true,
            alive: self.is_alive(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            pid: self.pid(),
            program: self.program.clone(),
            started_at: self.started_at,
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.idle_for().as_secs(),
            alive: self.is_alive(),
            transcript_len: self
                .transcript
                .as_ref()
                .and_then(|t| t.lock().ok().map(|t| t.len()))
                .unwrap_or(0),
        }
    }

    /// Time since the last `send` (or since start).
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    /// Send one message and wait for one framed response.
    pub async fn send(&self, text: &str, timeout: Duration) -> SendResult<String> {
        if !self
            .lifecycle
            .transition(SessionState::Ready, SessionState::Busy)
        {
            return Err(match self.state() {
                SessionState::Starting | SessionState::Busy | SessionState::Ready => {
                    SendError::Busy
                }
                _ => SendError::ProcessDied,
            });
        }
        let _busy = BusyGuard(&self.lifecycle);
        self.touch();
        self.record(Direction::Request, text);

        let result = self.exchange(text, timeout).await;
        match &result {
            Ok(response) => self.record(Direction::Response, response),
            Err(SendError::ProcessDied) => {
                if !self.pty.is_alive() && self.lifecycle.crash() {
                    warn!(session_id = %self.id, code = ?self.pty.exit_code(), "child died during send");
                }
            }
            Err(e) => debug!(session_id = %self.id, error = %e, "send failed"),
        }
        result
    }

    async fn exchange(&self, text: &str, timeout: Duration) -> SendResult<String> {
        let deadline = tokio::time::Instant::now() + timeout;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.reader_tx
            .send(ReaderCommand::Begin {
                echo: text.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SendError::ProcessDied)?;

        let mut bytes = Vec::with_capacity(text.len() + self.line_terminator.len());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(self.line_terminator.as_bytes());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteRequest { bytes, ack: ack_tx })
            .await
            .map_err(|_| SendError::ProcessDied)?;

        let mut state = self.lifecycle.subscribe();
        let outcome = tokio::time::timeout_at(deadline, async {
            let died = state.wait_for(|s| s.is_dead());
            tokio::pin!(died);

            tokio::select! {
                ack = ack_rx => ack.map_err(|_| SendError::ProcessDied)??,
                _ = &mut died => return Err(SendError::ProcessDied),
            }
            tokio::select! {
                reply = reply_rx => reply.map_err(|_| SendError::ProcessDied),
                _ = &mut died => Err(SendError::ProcessDied),
            }
        })
        .await;

        match outcome {
            Ok(Ok(flush)) => {
                debug!(
                    session_id = %self.id,
                    reason = ?flush.reason,
                    bytes = flush.raw.len(),
                    chars = flush.text.len(),
                    "response received"
                );
                Ok(flush.text)
            }
            Ok(Err(e)) => Err(e),
            Err(_) if !self.pty.is_alive() => Err(SendError::ProcessDied),
            Err(_) => Err(SendError::Timeout(timeout)),
        }
    }

    /// Write Ctrl-C to the child. Does not touch the in-flight request.
    pub async fn interrupt(&self) -> SendResult<()> {
        if self.state().is_dead() {
            return Err(SendError::ProcessDied);
        }
        let (ack, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteRequest {
                bytes: vec![0x03],
                ack,
            })
            .await
            .map_err(|_| SendError::ProcessDied)?;
        rx.await.map_err(|_| SendError::ProcessDied)??;
        debug!(session_id = %self.id, "interrupt sent");
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pty.resize(cols, rows)
    }

    /// Mark the session crashed. Fails any in-flight `send` with
    /// `ProcessDied`. Returns false if it was already dead.
    pub fn mark_crashed(&self) -> bool {
        let changed = self.lifecycle.crash();
        if changed {
            warn!(session_id = %self.id, code = ?self.pty.exit_code(), "session crashed");
        }
        changed
    }

    /// Terminate the child and both loops. Idempotent; concurrent callers all
    /// return once the session is `Terminated`.
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            let mut state = self.lifecycle.subscribe();
            let _ = state.wait_for(|s| *s == SessionState::Terminated).await;
            return;
        }
        info!(session_id = %self.id, pid = ?self.pty.pid(), "stopping session");

        self.pty.terminate(self.stop_grace).await;

        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(session_id = %self.id, error = %e, "session task failed");
            }
        }

        self.lifecycle.finish();
        info!(session_id = %self.id, "session terminated");
    }

    fn record(&self, direction: Direction, text: &str) {
        if let Some(transcript) = &self.transcript {
            if let Ok(mut t) = transcript.lock() {
                t.record(direction, text);
            }
        }
    }

    /// Recorded request/response pairs; empty when transcripts are off.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .as_ref()
            .and_then(|t| t.lock().ok().map(|t| t.entries()))
            .unwrap_or_default()
    }

    pub fn transcript_jsonl(&self) -> String {
        self.transcript
            .as_ref()
            .and_then(|t| t.lock().ok().map(|t| t.to_jsonl()))
            .unwrap_or_default()
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        // Dropped without `stop`: abort the loops so the PTY handle is
        // released and its child killed.
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

struct Settling {
    quiet: Duration,
    deadline: Instant,
    done: oneshot::Sender<usize>,
}

/// Reader task state. Owns the framer and the pending reply.
struct ReadLoop {
    id: String,
    pty: Arc<PtyHandle>,
    framer: Framer,
    pending: Option<oneshot::Sender<Flush>>,
    settling: Option<Settling>,
}

impl ReadLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ReaderCommand>,
        mut state: watch::Receiver<SessionState>,
    ) {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut backoff = MIN_READ_BACKOFF;

        loop {
            if state.borrow_and_update().is_shutting_down() {
                break;
            }
            while let Ok(cmd) = commands.try_recv() {
                self.apply(cmd);
                backoff = MIN_READ_BACKOFF;
            }

            let now = Instant::now();
            let got_data = match self.pty.read_available(&mut buf) {
                ReadOutcome::Data(n) => {
                    self.framer.push(&buf[..n], now);
                    true
                }
                ReadOutcome::Empty => false,
                ReadOutcome::Closed => {
                    debug!(session_id = %self.id, buffered = self.framer.len(), "PTY output closed");
                    break;
                }
            };

            self.check_settled(now);
            self.try_flush(now);
            if self.pending.is_none() {
                self.cap_unclaimed();
            }

            if got_data {
                backoff = MIN_READ_BACKOFF;
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        self.apply(cmd);
                        backoff = MIN_READ_BACKOFF;
                    }
                    None => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff) => {
                    backoff = (backoff * 2).min(MAX_READ_BACKOFF);
                }
            }
        }
        // Dropping `pending` here fails a waiting `send` with ProcessDied.
        debug!(session_id = %self.id, "reader stopped");
    }

    fn apply(&mut self, cmd: ReaderCommand) {
        let now = Instant::now();
        match cmd {
            ReaderCommand::Begin { echo, reply } => {
                if !self.framer.is_empty() {
                    debug!(
                        session_id = %self.id,
                        carried = self.framer.len(),
                        "carrying late output into new request"
                    );
                }
                self.framer.begin(now, Some(&echo));
                self.pending = Some(reply);
            }
            ReaderCommand::Settle {
                quiet,
                deadline,
                done,
            } => {
                self.settling = Some(Settling {
                    quiet,
                    deadline,
                    done,
                });
            }
        }
    }

    fn check_settled(&mut self, now: Instant) {
        let Some(settling) = self.settling.take() else {
            return;
        };
        let quiet = !self.framer.is_empty() && self.framer.quiet_for(now) >= settling.quiet;
        if quiet || now >= settling.deadline {
            let discarded = self.framer.len();
            self.framer.clear();
            let _ = settling.done.send(discarded);
        } else {
            self.settling = Some(settling);
        }
    }

    /// With no caller waiting the overflow rule never runs, so output that
    /// nobody asked for is bounded here instead.
    fn cap_unclaimed(&mut self) {
        let dropped = self.framer.trim_to_cap();
        if dropped > 0 {
            warn!(
                session_id = %self.id,
                dropped,
                kept = self.framer.len(),
                "unclaimed output over buffer limit, dropped oldest bytes"
            );
        }
    }

    fn try_flush(&mut self, now: Instant) {
        let Some(reply) = self.pending.take() else {
            return;
        };
        if reply.is_closed() {
            // Caller timed out or went away; keep the bytes for the next flush.
            debug!(session_id = %self.id, buffered = self.framer.len(), "request abandoned");
            return;
        }
        let Some(flush) = self.framer.poll(now) else {
            self.pending = Some(reply);
            return;
        };
        debug!(session_id = %self.id, reason = ?flush.reason, bytes = flush.raw.len(), "flush");
        if let Err(flush) = reply.send(flush) {
            // Lost the race with a timeout; put the bytes back.
            self.framer.push(&flush.raw, now);
        }
    }
}

async fn write_loop(
    id: String,
    pty: Arc<PtyHandle>,
    mut requests: mpsc::Receiver<WriteRequest>,
    mut state: watch::Receiver<SessionState>,
) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = state.wait_for(|s| s.is_shutting_down()) => break,
        };
        let result = pty.write(&request.bytes).await;
        if let Err(e) = &result {
            debug!(session_id = %id, error = %e, "PTY write failed");
        }
        let _ = request.ack.send(result);
    }
    debug!(session_id = %id, "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    const ECHO_LOOP: &str = r#"while IFS= read -r line; do printf '%s world.\n' "$line"; done"#;
    const SILENT_LOOP: &str = r#"while IFS= read -r line; do :; done"#;

    fn test_config() -> SessionConfig {
        SessionConfig {
            startup_grace_ms: 300,
            banner_settle_ms: 100,
            stop_grace_ms: 500,
            ..SessionConfig::default()
        }
    }

    async fn start_sh(script: &str, config: &SessionConfig) -> StartupResult<InteractiveSession> {
        let launch = LaunchSpec::new(["/bin/sh"]).args(["-c", script]);
        InteractiveSession::start(
            "s1",
            &launch,
            &CredentialEnv::new(),
            config,
            &SessionRules::default(),
        )
        .await
    }

    #[test]
    fn lifecycle_transitions() {
        let l = Lifecycle::new();
        assert!(!l.transition(SessionState::Ready, SessionState::Busy));
        assert!(l.transition(SessionState::Starting, SessionState::Ready));
        assert!(l.transition(SessionState::Ready, SessionState::Busy));
        assert!(l.crash());
        assert!(!l.crash());
        // Crashed sessions can still be stopped.
        assert!(l.begin_stop());
        assert!(!l.begin_stop());
        l.finish();
        assert_eq!(l.get(), SessionState::Terminated);
        assert!(!l.crash());
    }

    #[tokio::test]
    async fn send_returns_framed_answer() {
        let session = start_sh(ECHO_LOOP, &test_config()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        let reply = session.send("hello", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "hello world.");
        assert_eq!(session.state(), SessionState::Ready);

        let reply = session.send("again", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "again world.");
        session.stop().await;
    }

    #[tokio::test]
    async fn banner_is_discarded() {
        let script = format!("printf 'Welcome to the assistant!\\n>>> '; {ECHO_LOOP}");
        let session = start_sh(&script, &test_config()).await.unwrap();
        let reply = session.send("hi", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "hi world.");
        session.stop().await;
    }

    #[tokio::test]
    async fn concurrent_send_is_busy_and_stop_fails_in_flight() {
        let session = Arc::new(start_sh(SILENT_LOOP, &test_config()).await.unwrap());

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send("first", Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), SessionState::Busy);
        assert!(matches!(
            session.send("second", Duration::from_secs(1)).await,
            Err(SendError::Busy)
        ));

        let started = Instant::now();
        tokio::join!(session.stop(), session.stop());
        let first = first.await.unwrap();
        assert!(matches!(first, Err(SendError::ProcessDied)), "got {first:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.is_alive());

        session.stop().await;
        assert!(matches!(
            session.send("late", Duration::from_secs(1)).await,
            Err(SendError::ProcessDied)
        ));
    }

    #[tokio::test]
    async fn timeout_keeps_session_ready_and_late_bytes() {
        let script = r#"while IFS= read -r line; do sleep 1; printf '%s done.\n' "$line"; done"#;
        let config = SessionConfig {
            transcript: true,
            ..test_config()
        };
        let session = start_sh(script, &config).await.unwrap();

        let err = session.send("a", Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)), "got {err:?}");
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.transcript().len(), 1);

        // The late answer to "a" is still buffered and comes out first.
        let reply = session.send("b", Duration::from_secs(5)).await.unwrap();
        assert!(reply.contains("a done."), "got {reply:?}");

        let entries = session.transcript();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].direction, Direction::Request);
        assert_eq!(entries[2].direction, Direction::Response);
        session.stop().await;
    }

    #[tokio::test]
    async fn unclaimed_output_stays_within_buffer_limit() {
        let script = r#"while IFS= read -r line; do sleep 0.5; i=0; while [ $i -lt 4000 ]; do echo "$line chatter $i,"; i=$((i+1)); done; done"#;
        let mut config = test_config();
        config.framer.max_buffer_bytes = 4096;
        let rules = SessionRules::compile(&config).unwrap();
        let launch = LaunchSpec::new(["/bin/sh"]).args(["-c", script]);
        let session = InteractiveSession::start("s1", &launch, &CredentialEnv::new(), &config, &rules)
            .await
            .unwrap();

        let err = session.send("a", Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)), "got {err:?}");
        // Let the whole unclaimed stream arrive.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let reply = session.send("b", Duration::from_secs(10)).await.unwrap();
        assert!(reply.contains("chatter"), "got {reply:?}");
        assert!(reply.len() < 16 * 1024, "reply grew to {} bytes", reply.len());
        session.stop().await;
    }

    #[tokio::test]
    async fn killed_child_fails_send_fast() {
        let session = start_sh(SILENT_LOOP, &test_config()).await.unwrap();
        let pid = session.pid().unwrap();

        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        });
        let started = Instant::now();
        let result = session.send("anything", Duration::from_secs(20)).await;
        killer.await.unwrap();

        assert!(matches!(result, Err(SendError::ProcessDied)), "got {result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!session.status().alive);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn child_exiting_at_startup_is_reported() {
        let err = start_sh("exit 3", &test_config()).await.err().unwrap();
        assert!(matches!(err, StartupError::ExitedEarly { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unresolvable_launch_fails() {
        let launch = LaunchSpec::new(["no-such-assistant-ptymux"]);
        let err = InteractiveSession::start(
            "s1",
            &launch,
            &CredentialEnv::new(),
            &test_config(),
            &SessionRules::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, StartupError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn interrupt_and_info() {
        let script = format!("trap '' INT; {ECHO_LOOP}");
        let session = start_sh(&script, &test_config()).await.unwrap();
        session.interrupt().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let info = session.info();
        assert_eq!(info.id, "s1");
        assert_eq!(info.state, SessionState::Ready);
        assert!(info.alive);
        assert_eq!(info.pid, session.pid());
        assert_eq!(info.transcript_len, 0);

        session.resize(100, 30).unwrap();
        session.stop().await;
        assert!(matches!(session.interrupt().await, Err(SendError::ProcessDied)));
    }
}
