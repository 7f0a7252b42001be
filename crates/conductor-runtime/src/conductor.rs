use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use conductor_eventbus::{EventBus, EventSubscription};
use conductor_failover::{
    AutoSwitchController, RateLimitDetector, RateLimitMonitor, UsageFetcher, UsagePollReport,
    UsagePoller,
};
use conductor_persistence::{
    RestoreReport, SessionPersistence, SharedSnapshotStore, SqliteSnapshotStore,
};
use conductor_profiles::{AutoSwitchPolicy, NewProfile, ProfileRegistry, ProfileSnapshot};
use conductor_protocol::backend::SpawnBackend;
use conductor_protocol::error::ConductorResult;
use conductor_protocol::event::{RateLimitEvent, SwitchCycleReport};
use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
use conductor_protocol::session::{SessionCommand, SessionDate, SessionInfo, SessionSnapshot};
use conductor_pty::{PtyBackend, PtyOutputPolicy};
use conductor_sessions::{SessionHandle, SessionRegistry, SessionRegistryPerfSnapshot};
use time::OffsetDateTime;

use crate::autosave::{Autosave, save_live_partitions};
use crate::settings::{ConductorSettings, DatabaseLocation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub snapshots_saved: usize,
    pub sessions_destroyed: usize,
}

/// Single entry point for hosts. Constructed once; [`Conductor::shutdown`]
/// stops every background task, flushes snapshots and destroys all sessions.
#[derive(Clone)]
pub struct Conductor {
    eventbus: Arc<EventBus>,
    profiles: Arc<ProfileRegistry>,
    sessions: SessionRegistry,
    monitor: RateLimitMonitor,
    controller: AutoSwitchController,
    poller: Option<UsagePoller>,
    persistence: SessionPersistence,
    autosave: Autosave,
    shut_down: Arc<AtomicBool>,
}

impl Conductor {
    /// Starts a conductor spawning sessions in real pseudo-terminals.
    pub async fn start_with_pty(
        settings: ConductorSettings,
        fetcher: Option<Arc<dyn UsageFetcher>>,
    ) -> ConductorResult<Self> {
        let backend = Arc::new(PtyBackend::new(PtyOutputPolicy::default()));
        Self::start(settings, backend, fetcher).await
    }

    pub async fn start(
        settings: ConductorSettings,
        backend: Arc<dyn SpawnBackend>,
        fetcher: Option<Arc<dyn UsageFetcher>>,
    ) -> ConductorResult<Self> {
        let store = match &settings.database {
            DatabaseLocation::File(path) => SqliteSnapshotStore::open(path)?,
            DatabaseLocation::InMemory => SqliteSnapshotStore::in_memory()?,
        }
        .with_max_scrollback_bytes(settings.snapshot_max_scrollback_bytes);
        let store: SharedSnapshotStore = Arc::new(Mutex::new(store));

        let profiles = Arc::new(ProfileRegistry::new(settings.credential_env_var.as_str()));
        for profile in settings.profiles {
            profiles.register(profile)?;
        }

        let eventbus = Arc::new(EventBus::new());
        let sessions = SessionRegistry::new(
            backend,
            profiles.clone(),
            Arc::clone(&eventbus),
            settings.sessions,
        );
        let persistence = SessionPersistence::new(store, sessions.clone());
        persistence.attach();

        let (monitor, rate_limits) = RateLimitMonitor::new(
            RateLimitDetector::new()?,
            Arc::clone(&profiles),
            Arc::clone(&eventbus),
            settings.monitor,
        );
        let controller =
            AutoSwitchController::new(Arc::clone(&profiles), sessions.clone(), settings.policy);
        monitor.start().await;
        controller.start(rate_limits).await;

        let poller = fetcher.map(|fetcher| {
            UsagePoller::new(
                fetcher,
                Arc::clone(&profiles),
                monitor.clone(),
                settings.policy,
            )
        });
        if let Some(poller) = poller.as_ref() {
            poller.start().await;
        }

        let autosave = Autosave::new(sessions.clone(), persistence.clone());
        if let Some(period) = settings.autosave_interval {
            autosave.start(period).await;
        }

        tracing::info!(
            profiles = profiles.list()?.len(),
            usage_polling = poller.is_some(),
            autosave = settings.autosave_interval.is_some(),
            "conductor started"
        );

        Ok(Self {
            eventbus,
            profiles,
            sessions,
            monitor,
            controller,
            poller,
            persistence,
            autosave,
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    /// Every event of every session plus the global failover notices.
    pub fn subscribe_all(&self) -> EventSubscription {
        self.eventbus.subscribe_all()
    }

    // Sessions

    pub async fn create_session(
        &self,
        project_id: ProjectId,
        command: SessionCommand,
        profile_id: Option<ProfileId>,
    ) -> ConductorResult<SessionHandle> {
        self.sessions.create(project_id, command, profile_id).await
    }

    pub async fn send_input(&self, session_id: &SessionId, input: &[u8]) -> ConductorResult<()> {
        self.sessions.send_input(session_id, input).await
    }

    pub async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> ConductorResult<()> {
        self.sessions.resize(session_id, cols, rows).await
    }

    pub async fn destroy_session(&self, session_id: &SessionId) -> ConductorResult<()> {
        self.sessions.destroy(session_id).await
    }

    /// Retries under the active profile, serialized with switch cycles.
    pub async fn retry_session(&self, session_id: &SessionId) -> ConductorResult<SessionId> {
        self.controller.manual_retry(session_id).await
    }

    pub async fn session(&self, session_id: &SessionId) -> ConductorResult<SessionInfo> {
        self.sessions.session(session_id).await
    }

    pub async fn scrollback(&self, session_id: &SessionId) -> ConductorResult<Vec<u8>> {
        self.sessions.scrollback(session_id).await
    }

    pub async fn subscribe(&self, session_id: &SessionId) -> ConductorResult<EventSubscription> {
        self.sessions.subscribe(session_id).await
    }

    pub async fn subscribe_with_scrollback(
        &self,
        session_id: &SessionId,
    ) -> ConductorResult<(Vec<u8>, EventSubscription)> {
        self.sessions.subscribe_with_scrollback(session_id).await
    }

    pub async fn perf_snapshot(&self) -> SessionRegistryPerfSnapshot {
        self.sessions.perf_snapshot().await
    }

    // Profiles

    pub fn register_profile(&self, profile: NewProfile) -> ConductorResult<ProfileSnapshot> {
        self.profiles.register(profile)
    }

    /// Removes a profile. Removing the active one promotes a replacement and
    /// is refused while sessions still run under it with nowhere to go.
    pub async fn remove_profile(&self, profile_id: &ProfileId) -> ConductorResult<Option<ProfileId>> {
        let sessions_bound = self.sessions.list_running_for_profile(profile_id).await.len();
        self.profiles
            .remove(profile_id, &self.controller.policy(), sessions_bound)
    }

    pub fn list_profiles(&self) -> ConductorResult<Vec<ProfileSnapshot>> {
        self.profiles.list()
    }

    pub fn active_profile(&self) -> ConductorResult<Option<ProfileSnapshot>> {
        self.profiles.active()
    }

    /// Activates `profile_id` regardless of its usage. Running sessions keep
    /// their credential until they are retried.
    pub async fn switch_profile(&self, profile_id: &ProfileId) -> ConductorResult<SwitchCycleReport> {
        self.controller.manual_switch(profile_id).await
    }

    pub fn record_usage(
        &self,
        profile_id: &ProfileId,
        session_percent: f64,
        weekly_percent: f64,
    ) -> ConductorResult<()> {
        self.profiles.record_usage(
            profile_id,
            session_percent,
            weekly_percent,
            OffsetDateTime::now_utc(),
        )
    }

    /// Runs one usage poll right away. `None` without a usage fetcher.
    pub async fn poll_usage(&self) -> Option<UsagePollReport> {
        match self.poller.as_ref() {
            Some(poller) => Some(poller.poll_once().await),
            None => None,
        }
    }

    /// Feeds an externally observed rate limit into the failover path.
    pub fn report_rate_limit(&self, event: RateLimitEvent) -> bool {
        self.monitor.report(event)
    }

    pub fn policy(&self) -> AutoSwitchPolicy {
        self.controller.policy()
    }

    pub fn set_policy(&self, policy: AutoSwitchPolicy) {
        self.controller.set_policy(policy);
    }

    pub fn last_switch_report(&self) -> Option<SwitchCycleReport> {
        self.controller.last_report()
    }

    // Project and date partitions

    pub async fn list_by_date(&self, project_id: &ProjectId, date: SessionDate) -> Vec<SessionInfo> {
        self.sessions.list_by_date(project_id, date).await
    }

    pub async fn save_all(&self, project_id: &ProjectId, date: SessionDate) -> ConductorResult<usize> {
        self.persistence.save_all_for_date(project_id, date).await
    }

    pub async fn saved_dates(&self, project_id: &ProjectId) -> ConductorResult<Vec<SessionDate>> {
        self.persistence.list_dates(project_id).await
    }

    pub async fn saved_sessions(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<Vec<SessionSnapshot>> {
        self.persistence.list_by_date(project_id, date).await
    }

    pub async fn restore(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<RestoreReport> {
        self.persistence.restore_from_date(project_id, date).await
    }

    pub async fn clear_history(&self, project_id: &ProjectId) -> ConductorResult<usize> {
        self.persistence.clear(project_id).await
    }

    /// Stops autosave and failover, snapshots every live partition, then
    /// destroys all sessions. A second call does nothing.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        self.autosave.stop().await;
        if let Some(poller) = self.poller.as_ref() {
            poller.stop().await;
        }
        self.controller.stop().await;

        let snapshots_saved = save_live_partitions(&self.sessions, &self.persistence).await;
        let sessions_destroyed = self.sessions.destroy_all().await;
        self.monitor.stop().await;

        tracing::info!(snapshots_saved, sessions_destroyed, "conductor shut down");
        ShutdownReport {
            snapshots_saved,
            sessions_destroyed,
        }
    }
}
