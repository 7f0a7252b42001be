use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::ids::{ProjectId, SessionId};
use conductor_protocol::session::{SessionDate, SessionSnapshot};
use conductor_sessions::{CreateOptions, SessionRegistry, SessionSnapshotSink};

use crate::store::SnapshotStore;

pub type SharedSnapshotStore = Arc<Mutex<dyn SnapshotStore>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSession {
    pub snapshot_id: SessionId,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub snapshot_id: SessionId,
    pub reason: String,
}

/// Outcome of restoring one date partition. `restored_count + failed_count`
/// equals the number of snapshots found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored_count: usize,
    pub failed_count: usize,
    pub sessions: Vec<RestoredSession>,
    pub failures: Vec<RestoreFailure>,
}

/// Runs blocking store calls off the async runtime.
async fn with_store<T, F>(store: &SharedSnapshotStore, operation: F) -> ConductorResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn SnapshotStore) -> ConductorResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || {
        let mut guard = store
            .lock()
            .map_err(|_| ConductorError::Internal("snapshot store lock poisoned".to_owned()))?;
        operation(&mut *guard)
    })
    .await
    .map_err(|err| ConductorError::Internal(format!("snapshot store task failed: {err}")))?
}

/// [`SessionSnapshotSink`] writing terminal snapshots into the store.
#[derive(Clone)]
pub struct StoreSnapshotSink {
    store: SharedSnapshotStore,
}

impl StoreSnapshotSink {
    pub fn new(store: SharedSnapshotStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionSnapshotSink for StoreSnapshotSink {
    async fn persist(&self, snapshot: SessionSnapshot) -> ConductorResult<()> {
        with_store(&self.store, move |store| store.save(&snapshot)).await
    }
}

/// Session persistence on top of a [`SnapshotStore`]: saving live
/// partitions, listing history and restoring a day's sessions.
#[derive(Clone)]
pub struct SessionPersistence {
    store: SharedSnapshotStore,
    sessions: SessionRegistry,
}

impl SessionPersistence {
    pub fn new(store: SharedSnapshotStore, sessions: SessionRegistry) -> Self {
        Self { store, sessions }
    }

    /// Registers the terminal-transition sink on the session registry.
    pub fn attach(&self) {
        self.sessions
            .set_snapshot_sink(Arc::new(StoreSnapshotSink::new(Arc::clone(&self.store))));
    }

    pub async fn save(&self, snapshot: SessionSnapshot) -> ConductorResult<()> {
        with_store(&self.store, move |store| store.save(&snapshot)).await
    }

    /// Snapshots every live session of the partition. Returns the number
    /// written.
    pub async fn save_all_for_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<usize> {
        let snapshots = self.sessions.snapshots_for_date(project_id, date).await;
        if snapshots.is_empty() {
            return Ok(0);
        }
        let written = with_store(&self.store, move |store| {
            for snapshot in &snapshots {
                store.save(snapshot)?;
            }
            Ok(snapshots.len())
        })
        .await?;
        tracing::debug!(project_id = %project_id, date = %date, written, "saved session partition");
        Ok(written)
    }

    pub async fn list_dates(&self, project_id: &ProjectId) -> ConductorResult<Vec<SessionDate>> {
        let project_id = project_id.clone();
        with_store(&self.store, move |store| store.list_dates(&project_id)).await
    }

    pub async fn list_by_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<Vec<SessionSnapshot>> {
        let project_id = project_id.clone();
        with_store(&self.store, move |store| store.list_by_date(&project_id, date)).await
    }

    /// Starts a new session for every snapshot of the partition under the
    /// active profile, seeded with the snapshot's scrollback. A snapshot that
    /// cannot be restored is recorded in the report and the rest continue.
    pub async fn restore_from_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<RestoreReport> {
        let snapshots = self.list_by_date(project_id, date).await?;
        let mut report = RestoreReport::default();

        for snapshot in snapshots {
            let snapshot_id = snapshot.session_id.clone();
            let options = CreateOptions {
                profile_id: None,
                restored_from: Some(snapshot_id.clone()),
                seed_scrollback: Some(snapshot.scrollback),
                size: None,
            };
            match self
                .sessions
                .create_with(project_id.clone(), snapshot.command, options)
                .await
            {
                Ok(handle) => {
                    report.restored_count += 1;
                    report.sessions.push(RestoredSession {
                        snapshot_id,
                        session_id: handle.session_id,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        project_id = %project_id,
                        snapshot_id = %snapshot_id,
                        error = %error,
                        "failed to restore session"
                    );
                    report.failed_count += 1;
                    report.failures.push(RestoreFailure {
                        snapshot_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            project_id = %project_id,
            date = %date,
            restored = report.restored_count,
            failed = report.failed_count,
            "restore finished"
        );
        Ok(report)
    }

    /// Irreversibly deletes every snapshot of the project.
    pub async fn clear(&self, project_id: &ProjectId) -> ConductorResult<usize> {
        let project_id_for_store = project_id.clone();
        let removed = with_store(&self.store, move |store| store.clear(&project_id_for_store)).await?;
        tracing::info!(project_id = %project_id, removed, "cleared session history");
        Ok(removed)
    }
}
