use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use conductor_eventbus::EventBus;
use conductor_profiles::{AutoSwitchPolicy, ProfileRegistry};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::event::{
    ConductorEvent, FailedRetry, RateLimitEvent, RetriedSession, SwitchCycleReport, SwitchTrigger,
};
use conductor_protocol::ids::{ProfileId, SessionId};
use conductor_sessions::SessionRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ControllerTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ControllerInner {
    profiles: Arc<ProfileRegistry>,
    sessions: SessionRegistry,
    eventbus: Arc<EventBus>,
    policy: RwLock<AutoSwitchPolicy>,
    /// Serializes every switch, whether automatic or manual.
    switch_lock: tokio::sync::Mutex<()>,
    /// Profiles with a cycle in flight, with the number of events merged into it.
    in_flight: Mutex<HashMap<ProfileId, usize>>,
    last_report: Mutex<Option<SwitchCycleReport>>,
    task: tokio::sync::Mutex<Option<ControllerTask>>,
}

/// Consumes rate-limit events: marks the limited profile exhausted, activates
/// the best replacement and retries the sessions that ran under the limited
/// profile.
#[derive(Clone)]
pub struct AutoSwitchController {
    inner: Arc<ControllerInner>,
}

impl AutoSwitchController {
    pub fn new(
        profiles: Arc<ProfileRegistry>,
        sessions: SessionRegistry,
        policy: AutoSwitchPolicy,
    ) -> Self {
        let eventbus = Arc::clone(sessions.eventbus());
        Self {
            inner: Arc::new(ControllerInner {
                profiles,
                sessions,
                eventbus,
                policy: RwLock::new(policy.normalized()),
                switch_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashMap::new()),
                last_report: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn policy(&self) -> AutoSwitchPolicy {
        *self
            .inner
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: AutoSwitchPolicy) {
        *self
            .inner
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy.normalized();
    }

    pub fn last_report(&self) -> Option<SwitchCycleReport> {
        self.inner.lock_last_report().clone()
    }

    /// Consumes `events` until stopped or the sender side closes.
    pub async fn start(&self, mut events: mpsc::UnboundedReceiver<RateLimitEvent>) {
        let mut guard = self.inner.task.lock().await;
        if guard.is_some() {
            tracing::warn!("auto-switch controller already running");
            return;
        }
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let controller = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let controller = controller.clone();
                        // Cycles run on their own task so events for other
                        // profiles keep being merged while one is in flight.
                        tokio::spawn(async move {
                            controller.handle_event(event).await;
                        });
                    }
                }
            }
            tracing::debug!("auto-switch controller stopped");
        });
        *guard = Some(ControllerTask { cancel, task });
    }

    pub async fn stop(&self) {
        let running = self.inner.task.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(error) = running.task.await {
                tracing::warn!(error = %error, "auto-switch controller task join failed");
            }
        }
        // Waits out a cycle that is still retrying sessions.
        let _ = self.inner.switch_lock.lock().await;
    }

    /// Runs one switch cycle for `event`. Returns `None` when the event was
    /// merged into an in-flight cycle, was stale, or switching is disabled.
    /// A cycle that found no replacement reports `to_profile: None` and is
    /// announced as `NoProfileAvailable` instead of `ProfileSwitched`.
    pub async fn handle_event(&self, event: RateLimitEvent) -> Option<SwitchCycleReport> {
        let policy = self.policy();
        if !policy.switches_on_rate_limit() {
            tracing::debug!(profile_id = %event.profile_id, "auto-switch disabled; rate limit ignored");
            return None;
        }

        {
            let mut in_flight = self.inner.lock_in_flight();
            if let Some(merged) = in_flight.get_mut(&event.profile_id) {
                *merged += 1;
                tracing::debug!(
                    profile_id = %event.profile_id,
                    kind = ?event.kind,
                    "rate-limit event merged into in-flight switch"
                );
                return None;
            }
            in_flight.insert(event.profile_id.clone(), 0);
        }

        let report = {
            let _switch_guard = self.inner.switch_lock.lock().await;
            self.run_rate_limit_cycle(&event, &policy).await
        };
        let merged = self
            .inner
            .lock_in_flight()
            .remove(&event.profile_id)
            .unwrap_or(0);

        let mut report = report?;
        report.merged_events = merged;
        if report.to_profile.is_some() {
            self.inner.finish_cycle(&report);
        } else {
            *self.inner.lock_last_report() = Some(report.clone());
        }
        Some(report)
    }

    /// Activates `profile_id` regardless of thresholds. Running sessions keep
    /// their current credential until retried.
    pub async fn manual_switch(&self, profile_id: &ProfileId) -> ConductorResult<SwitchCycleReport> {
        let _switch_guard = self.inner.switch_lock.lock().await;
        let from_profile = self.inner.profiles.active_id()?;
        self.inner.profiles.set_active(profile_id)?;
        let report = SwitchCycleReport {
            trigger: SwitchTrigger::Manual,
            from_profile,
            to_profile: Some(profile_id.clone()),
            kind: None,
            retried: Vec::new(),
            failed: Vec::new(),
            merged_events: 0,
        };
        self.inner.finish_cycle(&report);
        Ok(report)
    }

    /// Retries one session under the active profile, serialized with switch
    /// cycles.
    pub async fn manual_retry(&self, session_id: &SessionId) -> ConductorResult<SessionId> {
        let _switch_guard = self.inner.switch_lock.lock().await;
        let replacement = self.inner.sessions.retry(session_id).await?;
        tracing::info!(
            session_id = %session_id,
            replacement = %replacement,
            "session manually retried"
        );
        Ok(replacement)
    }

    async fn run_rate_limit_cycle(
        &self,
        event: &RateLimitEvent,
        policy: &AutoSwitchPolicy,
    ) -> Option<SwitchCycleReport> {
        let limited = &event.profile_id;
        let active = match self.inner.profiles.active_id() {
            Ok(active) => active,
            Err(error) => {
                tracing::warn!(error = %error, "cannot read active profile; switch skipped");
                return None;
            }
        };
        let running = self.inner.sessions.list_running_for_profile(limited).await;
        let limited_is_active = active.as_ref() == Some(limited);
        if !limited_is_active && running.is_empty() {
            tracing::debug!(
                profile_id = %limited,
                "stale rate-limit event dropped; profile inactive and idle"
            );
            return None;
        }

        if let Err(error) = self.inner.profiles.mark_exhausted(limited, event.kind) {
            tracing::warn!(profile_id = %limited, error = %error, "failed to record exhaustion");
        }

        let to_profile = if limited_is_active {
            let replacement = match self.inner.profiles.best_available(policy) {
                Ok(replacement) => replacement,
                Err(error) => {
                    tracing::warn!(error = %error, "replacement lookup failed");
                    None
                }
            };
            let Some(replacement) = replacement else {
                tracing::warn!(
                    profile_id = %limited,
                    kind = ?event.kind,
                    "no eligible profile to switch to"
                );
                self.inner.eventbus.publish_global(ConductorEvent::NoProfileAvailable {
                    profile_id: limited.clone(),
                    kind: event.kind,
                });
                return Some(SwitchCycleReport {
                    trigger: SwitchTrigger::RateLimit,
                    from_profile: Some(limited.clone()),
                    to_profile: None,
                    kind: Some(event.kind),
                    retried: Vec::new(),
                    failed: Vec::new(),
                    merged_events: 0,
                });
            };
            if let Err(error) = self.inner.profiles.set_active(&replacement) {
                tracing::warn!(profile_id = %replacement, error = %error, "failed to activate replacement");
                return None;
            }
            Some(replacement)
        } else {
            active
        };

        let (retried, failed) = self.inner.retry_all(running).await;
        Some(SwitchCycleReport {
            trigger: SwitchTrigger::RateLimit,
            from_profile: Some(limited.clone()),
            to_profile,
            kind: Some(event.kind),
            retried,
            failed,
            merged_events: 0,
        })
    }
}

impl ControllerInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<ProfileId, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_report(&self) -> MutexGuard<'_, Option<SwitchCycleReport>> {
        self.last_report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn retry_all(&self, running: Vec<SessionId>) -> (Vec<RetriedSession>, Vec<FailedRetry>) {
        let mut retried = Vec::with_capacity(running.len());
        let mut failed = Vec::new();
        for session_id in running {
            match self.sessions.retry(&session_id).await {
                Ok(replacement) => retried.push(RetriedSession {
                    previous: session_id,
                    replacement,
                }),
                Err(error) => {
                    if !matches!(error, ConductorError::SessionDestroyed(_)) {
                        tracing::warn!(session_id = %session_id, error = %error, "retry after switch failed");
                    }
                    failed.push(FailedRetry {
                        session_id,
                        reason: error.to_string(),
                    });
                }
            }
        }
        (retried, failed)
    }

    fn finish_cycle(&self, report: &SwitchCycleReport) {
        tracing::info!(
            trigger = ?report.trigger,
            from_profile = ?report.from_profile,
            to_profile = ?report.to_profile,
            retried = report.retried.len(),
            failed = report.failed.len(),
            merged_events = report.merged_events,
            "profile switch cycle finished"
        );
        *self.lock_last_report() = Some(report.clone());
        self.eventbus
            .publish_global(ConductorEvent::ProfileSwitched(report.clone()));
    }
}
