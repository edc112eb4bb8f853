//! PTY process handle using portable-pty.
//!
//! Owns one child attached to one pseudo-terminal pair. The master side is
//! switched to non-blocking mode so reads return immediately with `Empty`
//! instead of parking a thread. The child and the descriptors are created by
//! `spawn` and released together by `terminate`.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{
    native_pty_system, Child as _, ChildKiller as _, CommandBuilder, MasterPty, PtySize,
};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::PtyError;
use crate::launch::{CredentialEnv, ResolvedLaunch};

/// Result of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// The child exited or the handle was torn down.
    Closed,
}

/// A managed child process on its own PTY.
pub struct PtyHandle {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Kept for resize; `MasterPty` is not `Sync`.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    pid: Option<u32>,
    exit_code: Mutex<Option<u32>>,
    /// Set once `terminate` has started; all I/O fails with `Closed` after.
    closed: AtomicBool,
    size: Mutex<(u16, u16)>,
}

impl PtyHandle {
    /// Spawn `launch` on a fresh PTY with the given environment and size.
    pub fn spawn(
        launch: &ResolvedLaunch,
        env: &CredentialEnv,
        cols: u16,
        rows: u16,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&launch.program);
        cmd.args(&launch.args);
        if let Some(dir) = &launch.working_dir {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (name, value) in env.iter() {
            cmd.env(name, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The child holds its own copy; ours would keep the master from
        // seeing EOF after the child exits.
        drop(pair.slave);

        set_nonblocking(pair.master.as_ref())?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(format!("failed to take PTY writer: {e}")))?;

        let pid = child.process_id();
        info!(
            program = %launch.program.display(),
            pid = ?pid,
            cols,
            rows,
            env_vars = env.len(),
            "PTY spawned"
        );

        Ok(Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            pid,
            exit_code: Mutex::new(None),
            closed: AtomicBool::new(false),
            size: Mutex::new((cols, rows)),
        })
    }

    /// Read whatever the child has produced without blocking.
    pub fn read_available(&self, buf: &mut [u8]) -> ReadOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return ReadOutcome::Closed;
        }
        let Ok(mut guard) = self.reader.lock() else {
            return ReadOutcome::Closed;
        };
        let Some(reader) = guard.as_mut() else {
            return ReadOutcome::Closed;
        };
        loop {
            match reader.read(buf) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => return ReadOutcome::Data(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::Empty,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) => {
                    debug!(error = %e, "PTY read ended");
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    /// Single non-blocking write attempt. Returns `Ok(0)` when the PTY input
    /// queue is full.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let mut guard = self.writer.lock().map_err(|_| PtyError::Closed)?;
        let writer = guard.as_mut().ok_or(PtyError::Closed)?;
        match writer.write(data) {
            Ok(n) => {
                writer.flush().ok();
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Write all of `data`, backing off while the input queue is full.
    /// Fails with `Closed` once the child has exited.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut written = 0;
        let mut backoff = Duration::from_millis(1);
        while written < data.len() {
            if !self.is_alive() {
                return Err(PtyError::Closed);
            }
            match self.try_write(&data[written..])? {
                0 => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(20));
                }
                n => {
                    written += n;
                    backoff = Duration::from_millis(1);
                }
            }
        }
        debug!(bytes = data.len(), "wrote to PTY");
        Ok(())
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.child_running()
    }

    fn child_running(&self) -> bool {
        if self.exit_code().is_some() {
            return false;
        }
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                let code = status.exit_code();
                if let Ok(mut slot) = self.exit_code.lock() {
                    *slot = Some(code);
                }
                debug!(pid = ?self.pid, code, "PTY child exited");
                false
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to poll PTY child");
                false
            }
        }
    }

    /// Child process id, if the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the child has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code.lock().ok().and_then(|c| *c)
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = self.master.lock().map_err(|_| PtyError::Closed)?;
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(format!("PTY resize failed: {e}")))?;
        drop(guard);
        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// SIGTERM the child's process group, wait up to `grace`, SIGKILL if it
    /// is still there, reap it, then close every descriptor. Idempotent.
    pub async fn terminate(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.child_running() {
            if let Some(pid) = self.pid {
                signal_group(pid, Signal::SIGTERM);
            }
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline && self.child_running() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            if self.child_running() {
                warn!(pid = ?self.pid, "grace period expired, killing PTY child");
                match self.pid {
                    Some(pid) => signal_group(pid, Signal::SIGKILL),
                    None => {
                        if let Ok(mut child) = self.child.lock() {
                            child.kill().ok();
                        }
                    }
                }
                // Reap so the child does not linger as a zombie.
                for _ in 0..40 {
                    if !self.child_running() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }

        if let Ok(mut w) = self.writer.lock() {
            w.take();
        }
        if let Ok(mut r) = self.reader.lock() {
            r.take();
        }
        if let Ok(mut m) = self.master.lock() {
            m.take();
        }
        info!(pid = ?self.pid, code = ?self.exit_code(), "PTY closed");
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || !self.child_running() {
            return;
        }
        // Never terminated: no grace period left to give.
        if let Some(pid) = self.pid {
            debug!(pid, "killing PTY child on drop");
            signal_group(pid, Signal::SIGKILL);
        }
        if let Ok(mut child) = self.child.lock() {
            child.try_wait().ok();
        }
    }
}

fn set_nonblocking(master: &(dyn MasterPty + Send)) -> Result<(), PtyError> {
    let fd = master
        .as_raw_fd()
        .ok_or_else(|| PtyError::Open("PTY master has no file descriptor".into()))?;
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| PtyError::Open(format!("fcntl F_GETFL failed: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| PtyError::Open(format!("fcntl F_SETFL failed: {e}")))?;
    Ok(())
}

/// portable-pty makes the child a session leader, so its pid is also the
/// process group id; signalling the group reaches anything it forked.
fn signal_group(pid: u32, signal: Signal) {
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, signal).is_err() {
        if let Err(e) = kill(pid, signal) {
            debug!(pid = %pid, signal = ?signal, error = %e, "signal not delivered");
        }
    }
}
