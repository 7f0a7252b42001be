use async_trait::async_trait;
use conductor_protocol::error::ConductorResult;
use conductor_protocol::session::SessionSnapshot;

/// Receives a snapshot every time a session reaches a terminal state.
/// Errors are logged by the registry and never delay termination.
#[async_trait]
pub trait SessionSnapshotSink: Send + Sync {
    async fn persist(&self, snapshot: SessionSnapshot) -> ConductorResult<()>;
}
