use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::backend::{
    ProcessHandle, ProcessOutput, ProcessSignal, SpawnBackend, SpawnedProcess,
};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::ids::SessionId;
use conductor_protocol::session::{SpawnRequest, TerminalSize};
use tokio::sync::mpsc;

pub const TERMINATED_EXIT_CODE: i32 = 143;
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Default)]
struct FakeBackendState {
    processes: Vec<Arc<FakeProcess>>,
    failing_programs: HashSet<String>,
    queued_failures: VecDeque<ConductorError>,
    ignore_terminate: bool,
    without_resize: bool,
    spawn_delay: Option<Duration>,
}

/// Scripted [`SpawnBackend`]. Every spawn produces a [`FakeProcess`] the test
/// drives by hand.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeBackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes that ignore graceful termination and only stop on kill.
    pub fn ignoring_terminate(self) -> Self {
        self.lock().ignore_terminate = true;
        self
    }

    pub fn without_resize(self) -> Self {
        self.lock().without_resize = true;
        self
    }

    pub fn with_spawn_delay(self, delay: Duration) -> Self {
        self.lock().spawn_delay = Some(delay);
        self
    }

    pub fn fail_program(&self, program: impl Into<String>) {
        self.lock().failing_programs.insert(program.into());
    }

    pub fn allow_program(&self, program: &str) {
        self.lock().failing_programs.remove(program);
    }

    pub fn fail_next_spawn(&self, error: ConductorError) {
        self.lock().queued_failures.push_back(error);
    }

    pub fn spawn_count(&self) -> usize {
        self.lock().processes.len()
    }

    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.lock().processes.clone()
    }

    pub fn process(&self, session_id: &SessionId) -> Option<Arc<FakeProcess>> {
        self.lock()
            .processes
            .iter()
            .find(|process| &process.request.session_id == session_id)
            .cloned()
    }

    pub fn last_process(&self) -> Option<Arc<FakeProcess>> {
        self.lock().processes.last().cloned()
    }

    fn lock(&self) -> MutexGuard<'_, FakeBackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SpawnBackend for FakeBackend {
    async fn spawn(&self, request: SpawnRequest) -> ConductorResult<SpawnedProcess> {
        let delay = self.lock().spawn_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.queued_failures.pop_front() {
            return Err(error);
        }
        if state.failing_programs.contains(&request.command.program) {
            return Err(ConductorError::Spawn(format!(
                "{}: no such file or directory",
                request.command.program
            )));
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let process = Arc::new(FakeProcess {
            request,
            output_tx,
            ignore_terminate: state.ignore_terminate,
            supports_resize: !state.without_resize,
            exited: AtomicBool::new(false),
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
        });
        state.processes.push(Arc::clone(&process));

        Ok(SpawnedProcess {
            handle: process,
            output: Box::new(FakeOutput {
                receiver: output_rx,
            }),
        })
    }
}

pub struct FakeProcess {
    pub request: SpawnRequest,
    output_tx: mpsc::UnboundedSender<ProcessSignal>,
    ignore_terminate: bool,
    supports_resize: bool,
    exited: AtomicBool,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<TerminalSize>>,
}

impl FakeProcess {
    pub fn session_id(&self) -> &SessionId {
        &self.request.session_id
    }

    pub fn env_value(&self, key: &str) -> Option<String> {
        self.request
            .merged_environment()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn emit(&self, bytes: impl AsRef<[u8]>) {
        if !self.has_exited() {
            let _ = self
                .output_tx
                .send(ProcessSignal::Output(bytes.as_ref().to_vec()));
        }
    }

    pub fn exit(&self, exit_code: i32) {
        self.finish(Some(exit_code));
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    fn finish(&self, exit_code: Option<i32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.output_tx.send(ProcessSignal::Exited { exit_code });
        }
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    async fn write(&self, bytes: &[u8]) -> ConductorResult<()> {
        if self.has_exited() {
            return Err(ConductorError::Process("process has exited".to_owned()));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }

    fn supports_resize(&self) -> bool {
        self.supports_resize
    }

    async fn resize(&self, size: TerminalSize) -> ConductorResult<()> {
        self.resizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(size);
        Ok(())
    }

    async fn terminate(&self) -> ConductorResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.finish(Some(TERMINATED_EXIT_CODE));
        }
        Ok(())
    }

    async fn kill(&self) -> ConductorResult<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.finish(Some(KILLED_EXIT_CODE));
        Ok(())
    }
}

struct FakeOutput {
    receiver: mpsc::UnboundedReceiver<ProcessSignal>,
}

#[async_trait]
impl ProcessOutput for FakeOutput {
    async fn next_signal(&mut self) -> ConductorResult<Option<ProcessSignal>> {
        Ok(self.receiver.recv().await)
    }
}
