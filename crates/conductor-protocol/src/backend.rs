use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ConductorResult;
use crate::session::{SpawnRequest, TerminalSize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessSignal {
    Output(Vec<u8>),
    Exited { exit_code: Option<i32> },
}

/// Ordered output of one process. Yields `Exited` once after the last chunk.
#[async_trait]
pub trait ProcessOutput: Send {
    async fn next_signal(&mut self) -> ConductorResult<Option<ProcessSignal>>;
}

pub type ProcessOutputStream = Box<dyn ProcessOutput>;

#[async_trait]
pub trait ProcessHandle: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> ConductorResult<()>;
    fn supports_resize(&self) -> bool {
        true
    }
    async fn resize(&self, size: TerminalSize) -> ConductorResult<()>;
    /// Ask the process to exit.
    async fn terminate(&self) -> ConductorResult<()>;
    async fn kill(&self) -> ConductorResult<()>;
}

pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    pub output: ProcessOutputStream,
}

#[async_trait]
pub trait SpawnBackend: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> ConductorResult<SpawnedProcess>;
}
