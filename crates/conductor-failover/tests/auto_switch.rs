use std::sync::Arc;
use std::time::Duration;

use conductor_eventbus::{EventBus, EventSubscription};
use conductor_failover::{
    AutoSwitchController, RateLimitDetector, RateLimitMonitor, RateLimitMonitorConfig,
};
use conductor_profiles::{
    AutoSwitchPolicy, DEFAULT_CREDENTIAL_ENV_VAR, NewProfile, ProfileRegistry,
};
use conductor_protocol::event::{
    ConductorEvent, RateLimitEvent, RateLimitKind, RateLimitSource, SwitchTrigger,
};
use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
use conductor_protocol::session::{SessionCommand, SessionState};
use conductor_sessions::{SessionRegistry, SessionRegistryConfig};
use conductor_test_support::FakeBackend;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

struct Harness {
    profiles: Arc<ProfileRegistry>,
    sessions: SessionRegistry,
    backend: FakeBackend,
    controller: AutoSwitchController,
    monitor: RateLimitMonitor,
    events: EventSubscription,
}

impl Harness {
    async fn new(profiles: &[(&str, &str)]) -> Self {
        let registry = Arc::new(ProfileRegistry::default());
        for (id, token) in profiles {
            registry
                .register(NewProfile::new(*id, *id).credential(*token))
                .expect("register profile");
        }
        let eventbus = Arc::new(EventBus::default());
        let events = eventbus.subscribe_all();
        let backend = FakeBackend::new();
        let sessions = SessionRegistry::new(
            Arc::new(backend.clone()),
            registry.clone(),
            Arc::clone(&eventbus),
            SessionRegistryConfig::default(),
        );
        let (monitor, rate_limits) = RateLimitMonitor::new(
            RateLimitDetector::new().expect("detector"),
            Arc::clone(&registry),
            Arc::clone(&eventbus),
            RateLimitMonitorConfig::default(),
        );
        let controller = AutoSwitchController::new(
            Arc::clone(&registry),
            sessions.clone(),
            AutoSwitchPolicy::default(),
        );
        monitor.start().await;
        controller.start(rate_limits).await;
        Self {
            profiles: registry,
            sessions,
            backend,
            controller,
            monitor,
            events,
        }
    }

    async fn create(&self) -> SessionId {
        self.sessions
            .create(ProjectId::new("proj"), SessionCommand::new("agent"), None)
            .await
            .expect("create session")
            .session_id
    }

    async fn next_global(&mut self, mut predicate: impl FnMut(&ConductorEvent) -> bool) -> ConductorEvent {
        timeout(TEST_TIMEOUT, async {
            loop {
                let envelope = self.events.next_event().await.expect("bus open");
                if predicate(&envelope.event) {
                    return envelope.event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn shutdown(&self) {
        self.controller.stop().await;
        self.monitor.stop().await;
        self.sessions.destroy_all().await;
    }
}

fn active(profiles: &ProfileRegistry) -> Option<ProfileId> {
    profiles.active_id().expect("active profile")
}

#[tokio::test]
async fn rate_limit_switches_profile_and_retries_bound_sessions() {
    let mut harness = Harness::new(&[("work", "token-work"), ("personal", "token-personal")]).await;
    let first = harness.create().await;
    let second = harness.create().await;

    harness
        .backend
        .process(&first)
        .expect("first process")
        .emit("Claude usage limit reached. Your limit resets 5pm\n");

    let event = harness
        .next_global(|event| matches!(event, ConductorEvent::ProfileSwitched(_)))
        .await;
    let ConductorEvent::ProfileSwitched(report) = event else {
        unreachable!("predicate only matches ProfileSwitched");
    };

    assert_eq!(report.trigger, SwitchTrigger::RateLimit);
    assert_eq!(report.from_profile, Some(ProfileId::new("work")));
    assert_eq!(report.to_profile, Some(ProfileId::new("personal")));
    assert_eq!(report.kind, Some(RateLimitKind::SessionWindow));
    assert!(report.failed.is_empty());
    let mut previous: Vec<_> = report.retried.iter().map(|pair| pair.previous.clone()).collect();
    previous.sort();
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort();
    assert_eq!(previous, expected);
    assert_eq!(active(&harness.profiles), Some(ProfileId::new("personal")));

    for pair in &report.retried {
        let replacement = harness.sessions.session(&pair.replacement).await.expect("replacement");
        assert_eq!(replacement.retried_from, Some(pair.previous.clone()));
        assert_eq!(replacement.profile_id, Some(ProfileId::new("personal")));
        assert_eq!(replacement.state, SessionState::Running);
        let process = harness.backend.process(&pair.replacement).expect("spawned");
        assert_eq!(
            process.env_value(DEFAULT_CREDENTIAL_ENV_VAR).as_deref(),
            Some("token-personal")
        );
        let old = harness.sessions.session(&pair.previous).await.expect("old");
        assert_eq!(old.state, SessionState::Killed);
    }
    let work = harness.profiles.get(&ProfileId::new("work")).expect("work");
    assert_eq!(work.usage.expect("usage").session_percent, 100.0);
    assert_eq!(harness.controller.last_report(), Some(report));

    harness.shutdown().await;
}

#[tokio::test]
async fn rate_limit_without_eligible_profile_announces_and_retries_nothing() {
    let mut harness = Harness::new(&[("work", "token-work"), ("personal", "token-personal")]).await;
    harness
        .profiles
        .record_usage(&ProfileId::new("personal"), 98.0, 20.0, OffsetDateTime::now_utc())
        .expect("usage");
    let session = harness.create().await;

    harness
        .backend
        .process(&session)
        .expect("process")
        .emit("Error: weekly limit reached · resets Monday 9am\n");

    let event = harness
        .next_global(|event| matches!(event, ConductorEvent::NoProfileAvailable { .. }))
        .await;

    assert_eq!(
        event,
        ConductorEvent::NoProfileAvailable {
            profile_id: ProfileId::new("work"),
            kind: RateLimitKind::Weekly,
        }
    );
    timeout(TEST_TIMEOUT, async {
        while harness.controller.last_report().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("report recorded");
    let report = harness.controller.last_report().expect("report");
    assert_eq!(report.to_profile, None);
    assert!(report.retried.is_empty());
    assert_eq!(active(&harness.profiles), Some(ProfileId::new("work")));
    assert_eq!(harness.backend.spawn_count(), 1);
    let info = harness.sessions.session(&session).await.expect("session");
    assert_eq!(info.state, SessionState::Running);

    harness.shutdown().await;
}

#[tokio::test]
async fn simultaneous_rate_limits_for_one_profile_run_a_single_cycle() {
    let harness = Harness::new(&[("work", "token-work"), ("personal", "token-personal")]).await;
    let first = harness.create().await;
    let second = harness.create().await;
    let event = |session_id: &SessionId| RateLimitEvent {
        profile_id: ProfileId::new("work"),
        session_id: Some(session_id.clone()),
        kind: RateLimitKind::SessionWindow,
        source: RateLimitSource::Output,
        detected_at: OffsetDateTime::now_utc(),
        reset_hint: None,
    };

    let (left, right) = tokio::join!(
        harness.controller.handle_event(event(&first)),
        harness.controller.handle_event(event(&second))
    );

    let reports: Vec<_> = [left, right].into_iter().flatten().collect();
    assert_eq!(reports.len(), 1, "exactly one cycle runs");
    assert_eq!(reports[0].retried.len(), 2);
    assert_eq!(reports[0].merged_events, 1);
    assert_eq!(harness.backend.spawn_count(), 4);

    let late = harness.controller.handle_event(event(&first)).await;
    assert!(late.is_none(), "stale event for an idle inactive profile is dropped");
    assert_eq!(harness.backend.spawn_count(), 4);

    harness.shutdown().await;
}

#[tokio::test]
async fn disabled_policy_ignores_rate_limits() {
    let harness = Harness::new(&[("work", "token-work"), ("personal", "token-personal")]).await;
    harness.controller.set_policy(AutoSwitchPolicy {
        auto_switch_on_rate_limit: false,
        ..AutoSwitchPolicy::default()
    });
    let session = harness.create().await;

    let report = harness
        .controller
        .handle_event(RateLimitEvent {
            profile_id: ProfileId::new("work"),
            session_id: Some(session),
            kind: RateLimitKind::SessionWindow,
            source: RateLimitSource::Manual,
            detected_at: OffsetDateTime::now_utc(),
            reset_hint: None,
        })
        .await;

    assert!(report.is_none());
    assert_eq!(active(&harness.profiles), Some(ProfileId::new("work")));
    assert_eq!(harness.backend.spawn_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn manual_switch_and_retry_bypass_thresholds() {
    let harness = Harness::new(&[("work", "token-work"), ("personal", "token-personal")]).await;
    harness
        .profiles
        .record_usage(&ProfileId::new("personal"), 100.0, 100.0, OffsetDateTime::now_utc())
        .expect("usage");
    let session = harness.create().await;

    let report = harness
        .controller
        .manual_switch(&ProfileId::new("personal"))
        .await
        .expect("manual switch");
    assert_eq!(report.trigger, SwitchTrigger::Manual);
    assert_eq!(report.to_profile, Some(ProfileId::new("personal")));
    assert_eq!(
        harness.sessions.session(&session).await.expect("session").state,
        SessionState::Running
    );

    let replacement = harness
        .controller
        .manual_retry(&session)
        .await
        .expect("manual retry");
    let info = harness.sessions.session(&replacement).await.expect("replacement");
    assert_eq!(info.profile_id, Some(ProfileId::new("personal")));
    assert!(harness
        .controller
        .manual_switch(&ProfileId::new("ghost"))
        .await
        .is_err());

    harness.shutdown().await;
}
