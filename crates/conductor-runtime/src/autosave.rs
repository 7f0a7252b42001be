use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use conductor_persistence::SessionPersistence;
use conductor_protocol::ids::ProjectId;
use conductor_protocol::session::{SessionDate, SessionState};
use conductor_sessions::SessionRegistry;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// Saves every (project, date) partition holding a running session. Returns
/// the number of snapshots written; failures are logged per partition.
pub(crate) async fn save_live_partitions(
    sessions: &SessionRegistry,
    persistence: &SessionPersistence,
) -> usize {
    let partitions: BTreeSet<(ProjectId, SessionDate)> = sessions
        .list_sessions()
        .await
        .into_iter()
        .filter(|info| info.state == SessionState::Running)
        .map(|info| (info.project_id, info.date))
        .collect();

    let mut written = 0;
    for (project_id, date) in partitions {
        match persistence.save_all_for_date(&project_id, date).await {
            Ok(count) => written += count,
            Err(error) => tracing::warn!(
                project_id = %project_id,
                date = %date,
                error = %error,
                "failed to save session partition"
            ),
        }
    }
    written
}

struct AutosaveTask {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub(crate) struct Autosave {
    sessions: SessionRegistry,
    persistence: SessionPersistence,
    task: Arc<Mutex<Option<AutosaveTask>>>,
}

impl Autosave {
    pub(crate) fn new(sessions: SessionRegistry, persistence: SessionPersistence) -> Self {
        Self {
            sessions,
            persistence,
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn start(&self, period: Duration) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let autosave = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; nothing is worth saving yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let written = save_live_partitions(&autosave.sessions, &autosave.persistence).await;
                        tracing::debug!(written, "autosave tick");
                    }
                }
            }
        });
        *guard = Some(AutosaveTask {
            stop_tx: Some(stop_tx),
            task,
        });
    }

    pub(crate) async fn stop(&self) {
        let state = self.task.lock().await.take();
        if let Some(mut state) = state {
            if let Some(stop_tx) = state.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Err(error) = state.task.await {
                tracing::warn!(error = %error, "autosave task join failed");
            }
        }
    }
}
