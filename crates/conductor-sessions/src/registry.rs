use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use conductor_eventbus::{EventBus, EventSubscription};
use conductor_protocol::backend::{ProcessOutputStream, ProcessSignal, SpawnBackend};
use conductor_protocol::credential::CredentialSource;
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::event::{ConductorEvent, SessionEnded, SessionStarted};
use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
use conductor_protocol::session::{
    SessionCommand, SessionDate, SessionInfo, SessionSnapshot, SessionState, SpawnRequest,
    TerminalSize,
};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use crate::multiplexer::OutputMultiplexer;
use crate::perf::{SessionRegistryPerfCounters, SessionRegistryPerfSnapshot};
use crate::scrollback::ScrollbackLimits;
use crate::sink::SessionSnapshotSink;
use crate::table::{SessionControl, SessionEntry, SessionRecord, SessionTable};

pub const DEFAULT_DESTROY_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRegistryConfig {
    pub scrollback: ScrollbackLimits,
    pub destroy_grace_period: Duration,
    /// Wait after a forced kill before the session is marked killed anyway.
    pub kill_confirm_timeout: Duration,
    pub terminal_size: TerminalSize,
    /// Offset used to derive a session's calendar date.
    pub utc_offset: UtcOffset,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            scrollback: ScrollbackLimits::default(),
            destroy_grace_period: DEFAULT_DESTROY_GRACE_PERIOD,
            kill_confirm_timeout: DEFAULT_KILL_CONFIRM_TIMEOUT,
            terminal_size: TerminalSize::default(),
            utc_offset: UtcOffset::UTC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub date: SessionDate,
    pub profile_id: Option<ProfileId>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit profile; the active profile is used when `None`.
    pub profile_id: Option<ProfileId>,
    pub restored_from: Option<SessionId>,
    pub seed_scrollback: Option<Vec<u8>>,
    pub size: Option<TerminalSize>,
}

/// Owns every live session: spawning, output ingestion, termination and
/// retry. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    backend: Arc<dyn SpawnBackend>,
    credentials: Arc<dyn CredentialSource>,
    eventbus: Arc<EventBus>,
    config: SessionRegistryConfig,
    table: Arc<RwLock<SessionTable>>,
    stream_tasks: Arc<RwLock<HashMap<SessionId, JoinHandle<()>>>>,
    snapshot_sink: Arc<std::sync::RwLock<Option<Arc<dyn SessionSnapshotSink>>>>,
    perf: Arc<SessionRegistryPerfCounters>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn SpawnBackend>,
        credentials: Arc<dyn CredentialSource>,
        eventbus: Arc<EventBus>,
        config: SessionRegistryConfig,
    ) -> Self {
        Self {
            backend,
            credentials,
            eventbus,
            config: SessionRegistryConfig {
                scrollback: config.scrollback.normalized(),
                ..config
            },
            table: Arc::new(RwLock::new(SessionTable::default())),
            stream_tasks: Arc::new(RwLock::new(HashMap::new())),
            snapshot_sink: Arc::new(std::sync::RwLock::new(None)),
            perf: Arc::new(SessionRegistryPerfCounters::default()),
        }
    }

    pub fn eventbus(&self) -> &Arc<EventBus> {
        &self.eventbus
    }

    pub fn config(&self) -> &SessionRegistryConfig {
        &self.config
    }

    pub fn set_snapshot_sink(&self, sink: Arc<dyn SessionSnapshotSink>) {
        let mut slot = self
            .snapshot_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(sink);
    }

    pub fn session_date(&self, at: OffsetDateTime) -> SessionDate {
        SessionDate::from_timestamp(at, self.config.utc_offset)
    }

    pub fn today(&self) -> SessionDate {
        self.session_date(OffsetDateTime::now_utc())
    }

    pub async fn create(
        &self,
        project_id: ProjectId,
        command: SessionCommand,
        profile_id: Option<ProfileId>,
    ) -> ConductorResult<SessionHandle> {
        self.create_with(
            project_id,
            command,
            CreateOptions {
                profile_id,
                ..CreateOptions::default()
            },
        )
        .await
    }

    pub async fn create_with(
        &self,
        project_id: ProjectId,
        command: SessionCommand,
        options: CreateOptions,
    ) -> ConductorResult<SessionHandle> {
        self.spawn_session(project_id, command, options, None).await
    }

    /// Forwards input to a running session. Input for a finished session is
    /// dropped.
    pub async fn send_input(&self, session_id: &SessionId, input: &[u8]) -> ConductorResult<()> {
        SessionRegistryPerfCounters::incr(&self.perf.send_input_requests_total);
        let (handle, multiplexer) = {
            let table = self.table.read().await;
            let entry = table
                .get(session_id)
                .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
            if entry.record.state.is_terminal() {
                return Ok(());
            }
            let Some(handle) = entry.handle.clone() else {
                return Ok(());
            };
            (handle, Arc::clone(&entry.multiplexer))
        };
        handle.write(input).await?;
        multiplexer.touch();
        Ok(())
    }

    pub async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> ConductorResult<()> {
        SessionRegistryPerfCounters::incr(&self.perf.resize_requests_total);
        if cols == 0 || rows == 0 {
            return Err(ConductorError::Configuration(
                "resize requires non-zero rows and columns".to_owned(),
            ));
        }
        let handle = {
            let table = self.table.read().await;
            let entry = table
                .get(session_id)
                .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
            if entry.record.state.is_terminal() {
                return Ok(());
            }
            let Some(handle) = entry.handle.clone() else {
                return Ok(());
            };
            handle
        };
        if !handle.supports_resize() {
            tracing::debug!(session_id = %session_id, "resize ignored; process has no terminal size");
            return Ok(());
        }
        handle.resize(TerminalSize { cols, rows }).await
    }

    /// Terminates the session, escalating to a forced kill after the grace
    /// period. Destroying a finished session is a no-op.
    pub async fn destroy(&self, session_id: &SessionId) -> ConductorResult<()> {
        SessionRegistryPerfCounters::incr(&self.perf.destroy_requests_total);
        let control = self.control(session_id).await?;
        control.destroyed.store(true, Ordering::SeqCst);
        control.terminate_requested.store(true, Ordering::SeqCst);
        let _op_guard = control.op_lock.lock().await;
        self.stop_process(session_id).await;
        Ok(())
    }

    /// Replaces the session with a fresh process running the same command
    /// under the currently active profile. Concurrent retries of one session
    /// share a single replacement.
    pub async fn retry(&self, session_id: &SessionId) -> ConductorResult<SessionId> {
        SessionRegistryPerfCounters::incr(&self.perf.retry_requests_total);
        let control = self.control(session_id).await?;
        if control.destroyed.load(Ordering::SeqCst) {
            return Err(ConductorError::SessionDestroyed(session_id.clone()));
        }
        let _op_guard = control.op_lock.lock().await;

        let (project_id, command, retried_into) = {
            let table = self.table.read().await;
            let entry = table
                .get(session_id)
                .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
            (
                entry.record.project_id.clone(),
                entry.record.command.clone(),
                entry.retried_into.clone(),
            )
        };
        if let Some(replacement) = retried_into {
            SessionRegistryPerfCounters::incr(&self.perf.retry_collapsed_total);
            return Ok(replacement);
        }
        if control.destroyed.load(Ordering::SeqCst) {
            return Err(ConductorError::SessionDestroyed(session_id.clone()));
        }

        control.terminate_requested.store(true, Ordering::SeqCst);
        self.stop_process(session_id).await;

        let replacement = self
            .spawn_session(
                project_id,
                command,
                CreateOptions::default(),
                Some(session_id.clone()),
            )
            .await?;

        if control.destroyed.load(Ordering::SeqCst) {
            tracing::info!(
                session_id = %session_id,
                replacement = %replacement.session_id,
                "session destroyed during retry; discarding replacement"
            );
            let _ = self.destroy(&replacement.session_id).await;
            return Err(ConductorError::SessionDestroyed(session_id.clone()));
        }

        {
            let mut table = self.table.write().await;
            if let Some(entry) = table.get_mut(session_id) {
                entry.retried_into = Some(replacement.session_id.clone());
            }
        }
        self.eventbus.publish(
            session_id.clone(),
            ConductorEvent::Retried {
                replacement: replacement.session_id.clone(),
            },
        );
        tracing::info!(
            session_id = %session_id,
            replacement = %replacement.session_id,
            profile_id = ?replacement.profile_id,
            "session retried"
        );
        Ok(replacement.session_id)
    }

    pub async fn list_by_date(&self, project_id: &ProjectId, date: SessionDate) -> Vec<SessionInfo> {
        let table = self.table.read().await;
        table
            .partition(project_id, date)
            .into_iter()
            .map(SessionEntry::info)
            .collect()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let table = self.table.read().await;
        table.all().into_iter().map(SessionEntry::info).collect()
    }

    pub async fn list_running_for_profile(&self, profile_id: &ProfileId) -> Vec<SessionId> {
        self.table.read().await.running_for_profile(profile_id)
    }

    pub async fn session(&self, session_id: &SessionId) -> ConductorResult<SessionInfo> {
        let table = self.table.read().await;
        table
            .get(session_id)
            .map(SessionEntry::info)
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))
    }

    pub async fn scrollback(&self, session_id: &SessionId) -> ConductorResult<Vec<u8>> {
        let multiplexer = self.multiplexer(session_id).await?;
        Ok(multiplexer.scrollback())
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> ConductorResult<SessionSnapshot> {
        let table = self.table.read().await;
        table
            .get(session_id)
            .map(SessionEntry::snapshot)
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))
    }

    /// Snapshots of the partition's live sessions. Finished sessions were
    /// handed to the snapshot sink when they ended.
    pub async fn snapshots_for_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> Vec<SessionSnapshot> {
        let table = self.table.read().await;
        table
            .partition(project_id, date)
            .into_iter()
            .filter(|entry| !entry.record.state.is_terminal())
            .map(SessionEntry::snapshot)
            .collect()
    }

    /// Subscribes to a session's events from now on. The stream ends after
    /// the session's `Ended` event.
    pub async fn subscribe(&self, session_id: &SessionId) -> ConductorResult<EventSubscription> {
        let (_, subscription) = self.subscribe_inner(session_id, false).await?;
        Ok(subscription)
    }

    /// Current scrollback plus a subscription starting right after it.
    pub async fn subscribe_with_scrollback(
        &self,
        session_id: &SessionId,
    ) -> ConductorResult<(Vec<u8>, EventSubscription)> {
        self.subscribe_inner(session_id, true).await
    }

    pub async fn destroy_all(&self) -> usize {
        let running = self.table.read().await.running_ids();
        let mut destroys = JoinSet::new();
        for session_id in running.iter().cloned() {
            let registry = self.clone();
            destroys.spawn(async move {
                if let Err(error) = registry.destroy(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %error, "failed to destroy session");
                }
            });
        }
        while destroys.join_next().await.is_some() {}
        running.len()
    }

    pub async fn perf_snapshot(&self) -> SessionRegistryPerfSnapshot {
        let summary = self.table.read().await.summary();
        let active_tasks = self.stream_tasks.read().await.len();
        self.perf.snapshot(summary, active_tasks)
    }

    async fn subscribe_inner(
        &self,
        session_id: &SessionId,
        with_scrollback: bool,
    ) -> ConductorResult<(Vec<u8>, EventSubscription)> {
        let table = self.table.read().await;
        let entry = table
            .get(session_id)
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
        let (scrollback, subscription) = if with_scrollback {
            entry.multiplexer.subscribe_with_scrollback()
        } else {
            (Vec::new(), entry.multiplexer.subscribe())
        };
        if entry.record.state.is_terminal() {
            self.eventbus.remove_session(session_id);
        }
        Ok((scrollback, subscription))
    }

    async fn spawn_session(
        &self,
        project_id: ProjectId,
        command: SessionCommand,
        options: CreateOptions,
        retried_from: Option<SessionId>,
    ) -> ConductorResult<SessionHandle> {
        SessionRegistryPerfCounters::incr(&self.perf.create_requests_total);
        let (profile_id, environment) = match self.resolve_credentials(options.profile_id.as_ref()) {
            Ok(resolved) => resolved,
            Err(error) => {
                SessionRegistryPerfCounters::incr(&self.perf.create_failures_total);
                return Err(error);
            }
        };

        let session_id = SessionId::generate();
        let created_at = OffsetDateTime::now_utc();
        let date = self.session_date(created_at);
        let multiplexer = Arc::new(OutputMultiplexer::new(
            session_id.clone(),
            Arc::clone(&self.eventbus),
            self.config.scrollback,
            created_at,
        ));
        if let Some(seed) = options.seed_scrollback.as_deref() {
            multiplexer.seed(seed);
        }

        let control = SessionControl::default();
        let _op_guard = Arc::clone(&control.op_lock).lock_owned().await;
        let record = SessionRecord {
            session_id: session_id.clone(),
            project_id: project_id.clone(),
            date,
            created_at,
            command: command.clone(),
            state: SessionState::Created,
            profile_id: profile_id.clone(),
            exit_code: None,
            error: None,
            retried_from: retried_from.clone(),
            restored_from: options.restored_from.clone(),
        };
        {
            let mut table = self.table.write().await;
            if !table.insert(SessionEntry::new(record, Arc::clone(&multiplexer), control)) {
                SessionRegistryPerfCounters::incr(&self.perf.create_failures_total);
                return Err(ConductorError::Internal(format!(
                    "session id collision: {session_id}"
                )));
            }
        }

        let spawn_result = if command.program.trim().is_empty() {
            Err(ConductorError::Spawn(
                "session program must not be empty".to_owned(),
            ))
        } else {
            self.backend
                .spawn(SpawnRequest {
                    session_id: session_id.clone(),
                    command: command.clone(),
                    size: options.size.unwrap_or(self.config.terminal_size),
                    environment,
                })
                .await
        };
        let spawned = match spawn_result {
            Ok(spawned) => spawned,
            Err(error) => {
                let error = match error {
                    ConductorError::Spawn(_) => error,
                    other => ConductorError::Spawn(other.to_string()),
                };
                SessionRegistryPerfCounters::incr(&self.perf.create_failures_total);
                tracing::warn!(
                    session_id = %session_id,
                    program = %command.program,
                    error = %error,
                    "session process failed to start"
                );
                self.finalize_session(&session_id, None, Some(error.to_string()))
                    .await;
                return Err(error);
            }
        };

        {
            let mut table = self.table.write().await;
            if let Some(entry) = table.get_mut(&session_id) {
                entry.handle = Some(spawned.handle);
                entry.record.state = SessionState::Running;
            }
        }
        self.eventbus.publish(
            session_id.clone(),
            ConductorEvent::Started(SessionStarted {
                project_id: project_id.clone(),
                profile_id: profile_id.clone(),
                retried_from,
                restored_from: options.restored_from,
            }),
        );

        {
            let mut stream_tasks = self.stream_tasks.write().await;
            let task =
                self.spawn_stream_ingestion_task(session_id.clone(), multiplexer, spawned.output);
            stream_tasks.insert(session_id.clone(), task);
        }

        SessionRegistryPerfCounters::incr(&self.perf.create_success_total);
        tracing::info!(
            session_id = %session_id,
            project_id = %project_id,
            profile_id = ?profile_id,
            program = %command.program,
            "session started"
        );
        Ok(SessionHandle {
            session_id,
            project_id,
            date,
            profile_id,
        })
    }

    fn resolve_credentials(
        &self,
        requested: Option<&ProfileId>,
    ) -> ConductorResult<(Option<ProfileId>, Vec<(String, String)>)> {
        let profile_id = match requested {
            Some(profile_id) => Some(profile_id.clone()),
            None => self.credentials.active_profile(),
        };
        match profile_id {
            Some(profile_id) => {
                let environment = self.credentials.spawn_environment(&profile_id)?;
                Ok((Some(profile_id), environment))
            }
            None => Ok((None, Vec::new())),
        }
    }

    fn spawn_stream_ingestion_task(
        &self,
        session_id: SessionId,
        multiplexer: Arc<OutputMultiplexer>,
        mut output: ProcessOutputStream,
    ) -> JoinHandle<()> {
        let registry = self.clone();

        tokio::spawn(async move {
            let (exit_code, error) = loop {
                match output.next_signal().await {
                    Ok(Some(ProcessSignal::Output(bytes))) => {
                        SessionRegistryPerfCounters::incr(&registry.perf.output_chunks_total);
                        multiplexer.ingest(bytes);
                    }
                    Ok(Some(ProcessSignal::Exited { exit_code })) => break (exit_code, None),
                    Ok(None) => break (None, None),
                    Err(error) => {
                        SessionRegistryPerfCounters::incr(&registry.perf.stream_errors_total);
                        break (None, Some(format!("session output stream failed: {error}")));
                    }
                }
            };

            registry.finalize_session(&session_id, exit_code, error).await;
            let mut stream_tasks = registry.stream_tasks.write().await;
            stream_tasks.remove(&session_id);
        })
    }

    /// Moves a session into its terminal state exactly once. Returns `false`
    /// when the session was already terminal.
    ///
    /// `Ended` is published while the table lock is held, so a reader that
    /// sees the terminal state never races the event. Sessions that never
    /// ran are not snapshotted.
    async fn finalize_session(
        &self,
        session_id: &SessionId,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> bool {
        let (state, snapshot, multiplexer) = {
            let mut table = self.table.write().await;
            let Some(entry) = table.get_mut(session_id) else {
                return false;
            };
            if entry.record.state.is_terminal() {
                return false;
            }
            let started = entry.record.state != SessionState::Created;
            let state = if !started || error.is_some() {
                SessionState::Errored
            } else if entry.control.terminate_requested.load(Ordering::SeqCst) {
                SessionState::Killed
            } else {
                SessionState::Exited
            };
            entry.record.state = state;
            entry.record.exit_code = exit_code;
            entry.record.error = error.clone();
            entry.handle = None;

            self.eventbus.publish(
                session_id.clone(),
                ConductorEvent::Ended(SessionEnded {
                    state,
                    exit_code,
                    reason: error,
                }),
            );
            self.eventbus.remove_session(session_id);
            let snapshot = started.then(|| entry.snapshot());
            (state, snapshot, Arc::clone(&entry.multiplexer))
        };

        self.perf.record_terminal_transition(state);
        tracing::info!(
            session_id = %session_id,
            state = state.as_str(),
            exit_code = ?exit_code,
            "session reached terminal state"
        );

        if let Some(snapshot) = snapshot {
            if self.persist_snapshot(snapshot).await {
                multiplexer.release();
                SessionRegistryPerfCounters::incr(&self.perf.scrollback_released_total);
            }
        }
        if let Some(entry) = self.table.read().await.get(session_id) {
            entry.exit_tx.send_replace(true);
        }
        true
    }

    /// Hands the snapshot to the sink. Returns `true` once the sink owns it.
    async fn persist_snapshot(&self, snapshot: SessionSnapshot) -> bool {
        let sink = self
            .snapshot_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sink) = sink else {
            return false;
        };
        let session_id = snapshot.session_id.clone();
        match sink.persist(snapshot).await {
            Ok(()) => true,
            Err(error) => {
                SessionRegistryPerfCounters::incr(&self.perf.snapshot_write_failures_total);
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to persist session snapshot"
                );
                false
            }
        }
    }

    /// Terminate, wait out the grace period, kill, and as a last resort mark
    /// the session killed without confirmation from the process.
    async fn stop_process(&self, session_id: &SessionId) {
        let (handle, mut exit_rx) = {
            let table = self.table.read().await;
            let Some(entry) = table.get(session_id) else {
                return;
            };
            if entry.record.state.is_terminal() {
                return;
            }
            let Some(handle) = entry.handle.clone() else {
                return;
            };
            (handle, entry.exit_tx.subscribe())
        };

        if let Err(error) = handle.terminate().await {
            tracing::warn!(session_id = %session_id, error = %error, "graceful terminate failed");
        }
        if timeout(
            self.config.destroy_grace_period,
            exit_rx.wait_for(|exited| *exited),
        )
        .await
        .is_ok()
        {
            return;
        }

        tracing::warn!(
            session_id = %session_id,
            grace_ms = self.config.destroy_grace_period.as_millis() as u64,
            "session ignored terminate; killing"
        );
        if let Err(error) = handle.kill().await {
            tracing::warn!(session_id = %session_id, error = %error, "forced kill failed");
        }
        if timeout(
            self.config.kill_confirm_timeout,
            exit_rx.wait_for(|exited| *exited),
        )
        .await
        .is_ok()
        {
            return;
        }

        if self.finalize_session(session_id, None, None).await {
            SessionRegistryPerfCounters::incr(&self.perf.forced_finalizations_total);
            if let Some(task) = self.stream_tasks.write().await.remove(session_id) {
                task.abort();
            }
        } else {
            let _ = exit_rx.wait_for(|exited| *exited).await;
        }
    }

    async fn control(&self, session_id: &SessionId) -> ConductorResult<SessionControl> {
        let table = self.table.read().await;
        table
            .get(session_id)
            .map(|entry| entry.control.clone())
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))
    }

    async fn multiplexer(&self, session_id: &SessionId) -> ConductorResult<Arc<OutputMultiplexer>> {
        let table = self.table.read().await;
        table
            .get(session_id)
            .map(|entry| Arc::clone(&entry.multiplexer))
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))
    }
}
