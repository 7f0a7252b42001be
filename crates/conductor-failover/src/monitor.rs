use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use conductor_eventbus::{EventBus, EventEnvelope};
use conductor_profiles::ProfileRegistry;
use conductor_protocol::credential::CredentialMaterial;
use conductor_protocol::event::{ConductorEvent, RateLimitEvent, RateLimitKind, RateLimitSource};
use conductor_protocol::ids::{ProfileId, SessionId};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::detect::RateLimitDetector;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitMonitorConfig {
    /// Repeated events for one (profile, kind) inside this window are dropped.
    pub dedup_window: Duration,
    pub tail_bytes: usize,
}

impl Default for RateLimitMonitorConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    tails: HashMap<SessionId, String>,
    bindings: HashMap<SessionId, ProfileId>,
    last_emitted: HashMap<(ProfileId, RateLimitKind), Instant>,
}

struct MonitorInner {
    detector: RateLimitDetector,
    profiles: Arc<ProfileRegistry>,
    eventbus: Arc<EventBus>,
    config: RateLimitMonitorConfig,
    state: Mutex<MonitorState>,
    events_tx: mpsc::UnboundedSender<RateLimitEvent>,
}

struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches every session's output for rate-limit notices and funnels them,
/// together with explicit reports, into one deduplicated stream of
/// [`RateLimitEvent`]s.
#[derive(Clone)]
pub struct RateLimitMonitor {
    inner: Arc<MonitorInner>,
    task: Arc<tokio::sync::Mutex<Option<MonitorTask>>>,
}

impl RateLimitMonitor {
    /// Returns the monitor and the receiving end consumed by the switch
    /// controller.
    pub fn new(
        detector: RateLimitDetector,
        profiles: Arc<ProfileRegistry>,
        eventbus: Arc<EventBus>,
        config: RateLimitMonitorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RateLimitEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                detector,
                profiles,
                eventbus,
                config: RateLimitMonitorConfig {
                    tail_bytes: config.tail_bytes.max(256),
                    ..config
                },
                state: Mutex::new(MonitorState::default()),
                events_tx,
            }),
            task: Arc::new(tokio::sync::Mutex::new(None)),
        };
        (monitor, events_rx)
    }

    /// Subscribes to the bus and starts watching. Events published after this
    /// returns are observed. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let mut subscription = self.inner.eventbus.subscribe_all();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    envelope = subscription.next_event() => {
                        let Some(envelope) = envelope else {
                            break;
                        };
                        inner.observe(&envelope);
                    }
                }
            }
            tracing::debug!("rate-limit monitor stopped");
        });
        *guard = Some(MonitorTask { cancel, task });
    }

    pub async fn stop(&self) {
        let running = self.task.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(error) = running.task.await {
                tracing::warn!(error = %error, "rate-limit monitor task join failed");
            }
        }
    }

    /// Feeds an externally detected limit (usage poll, manual report) through
    /// deduplication. Returns whether the event was forwarded.
    pub fn report(&self, event: RateLimitEvent) -> bool {
        self.inner.emit(event)
    }

    pub fn bound_profile(&self, session_id: &SessionId) -> Option<ProfileId> {
        self.inner.lock_state().bindings.get(session_id).cloned()
    }
}

impl MonitorInner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, envelope: &EventEnvelope) {
        let Some(session_id) = envelope.session_id.as_ref() else {
            return;
        };
        match &envelope.event {
            ConductorEvent::Started(started) => {
                let mut state = self.lock_state();
                state.tails.remove(session_id);
                match started.profile_id.as_ref() {
                    Some(profile_id) => {
                        state.bindings.insert(session_id.clone(), profile_id.clone());
                    }
                    None => {
                        state.bindings.remove(session_id);
                    }
                }
            }
            ConductorEvent::Output(bytes) => self.observe_output(session_id, bytes),
            ConductorEvent::Ended(ended) => {
                let profile_id = {
                    let mut state = self.lock_state();
                    state.tails.remove(session_id);
                    state.bindings.remove(session_id)
                };
                let (Some(profile_id), Some(reason)) = (profile_id, ended.reason.as_deref()) else {
                    return;
                };
                if let Some(detection) = self.detector.detect(reason) {
                    self.emit(RateLimitEvent {
                        profile_id,
                        session_id: Some(session_id.clone()),
                        kind: detection.kind,
                        source: RateLimitSource::ExitSignal,
                        detected_at: OffsetDateTime::now_utc(),
                        reset_hint: detection.reset_hint,
                    });
                }
            }
            _ => {}
        }
    }

    fn observe_output(&self, session_id: &SessionId, bytes: &[u8]) {
        let text = self.detector.normalize(bytes);
        let (profile_id, detection, captured) = {
            let mut state = self.lock_state();
            let profile_id = state.bindings.get(session_id).cloned();
            let tail = state.tails.entry(session_id.clone()).or_default();
            tail.push_str(&text);

            let captured = self.detector.capture_token(tail);
            let detection = self.detector.detect(tail);
            let consumed = captured
                .as_ref()
                .map(|(_, end)| *end)
                .max(detection.as_ref().map(|detection| detection.consumed))
                .unwrap_or(0);
            tail.replace_range(..consumed, "");
            trim_to_tail(tail, self.config.tail_bytes);
            (profile_id, detection, captured.map(|(material, _)| material))
        };

        let Some(profile_id) = profile_id else {
            if detection.is_some() {
                tracing::debug!(session_id = %session_id, "rate-limit notice from a session without profile");
            }
            return;
        };

        if let Some(material) = captured {
            self.apply_captured_credential(session_id, &profile_id, material);
        }
        if let Some(detection) = detection {
            self.emit(RateLimitEvent {
                profile_id,
                session_id: Some(session_id.clone()),
                kind: detection.kind,
                source: RateLimitSource::Output,
                detected_at: OffsetDateTime::now_utc(),
                reset_hint: detection.reset_hint,
            });
        }
    }

    fn apply_captured_credential(
        &self,
        session_id: &SessionId,
        profile_id: &ProfileId,
        material: CredentialMaterial,
    ) {
        let unchanged = self
            .profiles
            .get(profile_id)
            .map(|profile| profile.credential == material)
            .unwrap_or(false);
        if unchanged {
            return;
        }
        let preview = material.preview();
        match self.profiles.update_credential(profile_id, material) {
            Ok(()) => {
                tracing::info!(
                    session_id = %session_id,
                    profile_id = %profile_id,
                    credential = %preview,
                    "captured credential from session output"
                );
                self.eventbus.publish(
                    session_id.clone(),
                    ConductorEvent::CredentialCaptured {
                        profile_id: profile_id.clone(),
                        preview,
                    },
                );
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    profile_id = %profile_id,
                    error = %error,
                    "failed to store captured credential"
                );
            }
        }
    }

    fn emit(&self, event: RateLimitEvent) -> bool {
        {
            let mut state = self.lock_state();
            let key = (event.profile_id.clone(), event.kind);
            let now = Instant::now();
            let recent = state
                .last_emitted
                .get(&key)
                .is_some_and(|last| now.duration_since(*last) < self.config.dedup_window);
            if recent {
                tracing::debug!(
                    profile_id = %event.profile_id,
                    kind = ?event.kind,
                    source = ?event.source,
                    "duplicate rate-limit event dropped"
                );
                return false;
            }
            state.last_emitted.insert(key, now);
        }

        tracing::info!(
            profile_id = %event.profile_id,
            session_id = ?event.session_id,
            kind = ?event.kind,
            source = ?event.source,
            reset_hint = ?event.reset_hint,
            "rate limit detected"
        );
        match event.session_id.clone() {
            Some(session_id) => {
                self.eventbus
                    .publish(session_id, ConductorEvent::RateLimited(event.clone()));
            }
            None => {
                self.eventbus
                    .publish_global(ConductorEvent::RateLimited(event.clone()));
            }
        }
        if self.events_tx.send(event).is_err() {
            tracing::debug!("rate-limit consumer is gone; event only published");
        }
        true
    }
}

fn trim_to_tail(tail: &mut String, max_bytes: usize) {
    if tail.len() <= max_bytes {
        return;
    }
    let mut cut = tail.len() - max_bytes;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    tail.replace_range(..cut, "");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use conductor_eventbus::EventBus;
    use conductor_profiles::{NewProfile, ProfileRegistry};
    use conductor_protocol::event::{
        ConductorEvent, RateLimitEvent, RateLimitKind, RateLimitSource, SessionEnded, SessionStarted,
    };
    use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
    use conductor_protocol::session::SessionState;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::{RateLimitMonitor, RateLimitMonitorConfig, trim_to_tail};
    use crate::detect::RateLimitDetector;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    struct Fixture {
        monitor: RateLimitMonitor,
        events: mpsc::UnboundedReceiver<RateLimitEvent>,
        bus: Arc<EventBus>,
        profiles: Arc<ProfileRegistry>,
    }

    async fn fixture() -> Fixture {
        let profiles = Arc::new(ProfileRegistry::default());
        profiles
            .register(NewProfile::new("work", "Work").credential("old-token-value"))
            .expect("register");
        let bus = Arc::new(EventBus::default());
        let (monitor, events) = RateLimitMonitor::new(
            RateLimitDetector::new().expect("detector"),
            Arc::clone(&profiles),
            Arc::clone(&bus),
            RateLimitMonitorConfig::default(),
        );
        monitor.start().await;
        Fixture {
            monitor,
            events,
            bus,
            profiles,
        }
    }

    fn started(bus: &EventBus, session: &str, profile: &str) {
        bus.publish(
            SessionId::new(session),
            ConductorEvent::Started(SessionStarted {
                project_id: ProjectId::new("proj"),
                profile_id: Some(ProfileId::new(profile)),
                retried_from: None,
                restored_from: None,
            }),
        );
    }

    fn output(bus: &EventBus, session: &str, text: &str) {
        bus.publish(
            SessionId::new(session),
            ConductorEvent::Output(text.as_bytes().to_vec()),
        );
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<RateLimitEvent>) -> RateLimitEvent {
        timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for rate-limit event")
            .expect("monitor channel closed")
    }

    #[tokio::test]
    async fn notice_split_across_chunks_is_detected_once() {
        let mut fixture = fixture().await;
        started(&fixture.bus, "sess-1", "work");

        output(&fixture.bus, "sess-1", "working...\nClaude usage li");
        output(&fixture.bus, "sess-1", "mit reached, resets 4pm\n");

        let event = next(&mut fixture.events).await;
        assert_eq!(event.profile_id, ProfileId::new("work"));
        assert_eq!(event.session_id, Some(SessionId::new("sess-1")));
        assert_eq!(event.kind, RateLimitKind::SessionWindow);
        assert_eq!(event.source, RateLimitSource::Output);
        assert_eq!(event.reset_hint.as_deref(), Some("resets 4pm"));

        output(&fixture.bus, "sess-1", "more output\n");
        fixture.monitor.stop().await;
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_notices_inside_the_window_are_deduplicated() {
        let mut fixture = fixture().await;
        started(&fixture.bus, "sess-1", "work");
        started(&fixture.bus, "sess-2", "work");

        output(&fixture.bus, "sess-1", "rate limit reached\n");
        output(&fixture.bus, "sess-2", "rate limit reached\n");
        let _ = next(&mut fixture.events).await;
        fixture.monitor.stop().await;

        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn different_kinds_are_not_deduplicated_together() {
        let fixture = fixture().await;
        let event = |kind| RateLimitEvent {
            profile_id: ProfileId::new("work"),
            session_id: None,
            kind,
            source: RateLimitSource::UsagePoll,
            detected_at: OffsetDateTime::now_utc(),
            reset_hint: None,
        };

        assert!(fixture.monitor.report(event(RateLimitKind::SessionWindow)));
        assert!(fixture.monitor.report(event(RateLimitKind::Weekly)));
        assert!(!fixture.monitor.report(event(RateLimitKind::Weekly)));
    }

    #[tokio::test]
    async fn exit_reason_with_a_signature_is_an_exit_signal() {
        let mut fixture = fixture().await;
        started(&fixture.bus, "sess-1", "work");

        fixture.bus.publish(
            SessionId::new("sess-1"),
            ConductorEvent::Ended(SessionEnded {
                state: SessionState::Errored,
                exit_code: Some(1),
                reason: Some("weekly limit reached · resets Monday 9am".to_owned()),
            }),
        );

        let event = next(&mut fixture.events).await;
        assert_eq!(event.kind, RateLimitKind::Weekly);
        assert_eq!(event.source, RateLimitSource::ExitSignal);
    }

    #[tokio::test]
    async fn printed_oauth_token_updates_the_session_profile() {
        let fixture = fixture().await;
        let mut global = fixture.bus.subscribe_all();
        started(&fixture.bus, "sess-1", "work");
        let token = "sk-ant-REDACTED";

        output(&fixture.bus, "sess-1", &format!("Your token: {token}\n"));

        let preview = timeout(TEST_TIMEOUT, async {
            loop {
                let envelope = global.next_event().await.expect("bus open");
                if let ConductorEvent::CredentialCaptured { preview, .. } = envelope.event {
                    return preview;
                }
            }
        })
        .await
        .expect("credential captured");
        assert_eq!(preview, "****WXYZ");
        let profile = fixture.profiles.get(&ProfileId::new("work")).expect("profile");
        assert_eq!(profile.credential.expose(), token);
        assert_eq!(fixture.monitor.bound_profile(&SessionId::new("sess-1")), Some(ProfileId::new("work")));
    }

    #[test]
    fn tail_trimming_respects_char_boundaries() {
        let mut tail = "ééééé".to_owned();

        trim_to_tail(&mut tail, 3);

        assert_eq!(tail, "é");
    }
}
