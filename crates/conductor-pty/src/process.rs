use std::sync::Mutex;

use async_trait::async_trait;
use conductor_protocol::backend::{ProcessHandle, ProcessOutput, ProcessSignal};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::session::TerminalSize;
use portable_pty::{ChildKiller, MasterPty, PtySize};
use tokio::sync::mpsc;

pub(crate) struct PtyProcess {
    pub(crate) master: Mutex<Box<dyn MasterPty + Send>>,
    pub(crate) killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pub(crate) stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) process_id: Option<u32>,
}

#[async_trait]
impl ProcessHandle for PtyProcess {
    async fn write(&self, bytes: &[u8]) -> ConductorResult<()> {
        self.stdin_tx.send(bytes.to_vec()).map_err(|_| {
            ConductorError::Process("PTY stdin writer is no longer available".to_owned())
        })
    }

    async fn resize(&self, size: TerminalSize) -> ConductorResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| ConductorError::Internal("PTY master lock poisoned".to_owned()))?;
        master.resize(to_pty_size(size)).map_err(process_error)
    }

    async fn terminate(&self) -> ConductorResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.process_id.and_then(|pid| i32::try_from(pid).ok()) {
            signal_process_group(pid, libc::SIGTERM);
            return Ok(());
        }
        self.kill().await
    }

    async fn kill(&self) -> ConductorResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.process_id.and_then(|pid| i32::try_from(pid).ok()) {
            signal_process_group(pid, libc::SIGKILL);
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| ConductorError::Internal("PTY killer lock poisoned".to_owned()))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(error) => {
                tracing::debug!(error = %error, "PTY child kill reported an error");
                Ok(())
            }
        }
    }
}

/// The PTY child leads its own session, so its pid doubles as the group id.
#[cfg(unix)]
fn signal_process_group(pid: i32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let group_result = unsafe { libc::kill(-pid, signal) };
    if group_result != 0 {
        // SAFETY: as above.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

pub(crate) struct PtyProcessOutput {
    pub(crate) receiver: mpsc::UnboundedReceiver<ProcessSignal>,
}

#[async_trait]
impl ProcessOutput for PtyProcessOutput {
    async fn next_signal(&mut self) -> ConductorResult<Option<ProcessSignal>> {
        Ok(self.receiver.recv().await)
    }
}

pub(crate) fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        cols: size.cols,
        rows: size.rows,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub(crate) fn process_error(error: impl std::fmt::Display) -> ConductorError {
    ConductorError::Process(error.to_string())
}
