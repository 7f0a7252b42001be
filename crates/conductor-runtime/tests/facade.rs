use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor_eventbus::EventSubscription;
use conductor_failover::{UsageFetcher, UsageReading};
use conductor_profiles::{
    AutoSwitchPolicy, DEFAULT_CREDENTIAL_ENV_VAR, NewProfile, ProfileSnapshot,
};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::event::{ConductorEvent, RateLimitKind};
use conductor_protocol::ids::{ProfileId, ProjectId};
use conductor_protocol::session::{SessionCommand, SessionState};
use conductor_runtime::{Conductor, ConductorSettings, DatabaseLocation};
use conductor_test_support::FakeBackend;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct ScriptedFetcher {
    readings: Mutex<HashMap<ProfileId, (f64, f64)>>,
}

impl ScriptedFetcher {
    fn set(&self, profile: &str, session: f64, weekly: f64) {
        self.readings
            .lock()
            .expect("readings lock")
            .insert(ProfileId::new(profile), (session, weekly));
    }
}

#[async_trait]
impl UsageFetcher for ScriptedFetcher {
    async fn fetch_usage(&self, profile: &ProfileSnapshot) -> ConductorResult<UsageReading> {
        let reading = self.readings.lock().expect("readings lock").get(&profile.id).copied();
        let (session_percent, weekly_percent) = reading
            .ok_or_else(|| ConductorError::Process(format!("no usage for {}", profile.id)))?;
        Ok(UsageReading {
            session_percent,
            weekly_percent,
            reset_hint: None,
            fetched_at: OffsetDateTime::now_utc(),
        })
    }
}

fn project() -> ProjectId {
    ProjectId::new("proj")
}

fn settings(database: DatabaseLocation) -> ConductorSettings {
    ConductorSettings {
        database,
        policy: AutoSwitchPolicy {
            usage_poll_interval_secs: 0,
            ..AutoSwitchPolicy::default()
        },
        profiles: vec![
            NewProfile::new("work", "Work").credential("token-work"),
            NewProfile::new("personal", "Personal").credential("token-personal"),
        ],
        ..ConductorSettings::default()
    }
}

async fn next_matching(
    events: &mut EventSubscription,
    mut predicate: impl FnMut(&ConductorEvent) -> bool,
) -> ConductorEvent {
    timeout(TEST_TIMEOUT, async {
        loop {
            let envelope = events.next_event().await.expect("bus open");
            if predicate(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn sessions_survive_a_restart_through_the_snapshot_store() {
    let directory = tempfile::tempdir().expect("tempdir");
    let database = DatabaseLocation::File(directory.path().join("sessions.db"));

    let backend = FakeBackend::new();
    let conductor = Conductor::start(settings(database.clone()), Arc::new(backend.clone()), None)
        .await
        .expect("start");
    let handle = conductor
        .create_session(project(), SessionCommand::new("agent").arg("--resume"), None)
        .await
        .expect("create");
    backend
        .process(&handle.session_id)
        .expect("spawned")
        .emit("working on it\n");
    timeout(TEST_TIMEOUT, async {
        while conductor
            .scrollback(&handle.session_id)
            .await
            .expect("scrollback")
            .is_empty()
        {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("output ingested");

    let report = conductor.shutdown().await;
    assert_eq!(report.snapshots_saved, 1);
    assert_eq!(report.sessions_destroyed, 1);
    assert_eq!(
        conductor.session(&handle.session_id).await.expect("session").state,
        SessionState::Killed
    );
    assert_eq!(conductor.shutdown().await.sessions_destroyed, 0);

    let backend = FakeBackend::new();
    let restarted = Conductor::start(settings(database), Arc::new(backend.clone()), None)
        .await
        .expect("restart");
    assert_eq!(
        restarted.saved_dates(&project()).await.expect("dates"),
        vec![handle.date]
    );
    let saved = restarted
        .saved_sessions(&project(), handle.date)
        .await
        .expect("saved sessions");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].state, SessionState::Killed);

    let restore = restarted
        .restore(&project(), handle.date)
        .await
        .expect("restore");
    assert_eq!(restore.restored_count, 1);
    assert_eq!(restore.failed_count, 0);
    let restored = &restore.sessions[0];
    assert_eq!(restored.snapshot_id, handle.session_id);
    assert_eq!(
        restarted.scrollback(&restored.session_id).await.expect("scrollback"),
        b"working on it\n"
    );
    let process = backend.process(&restored.session_id).expect("respawned");
    assert_eq!(
        process.env_value(DEFAULT_CREDENTIAL_ENV_VAR).as_deref(),
        Some("token-work")
    );

    restarted.shutdown().await;
}

#[tokio::test]
async fn usage_poll_breach_switches_profile_and_retries_sessions() {
    let backend = FakeBackend::new();
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.set("work", 97.0, 40.0);
    fetcher.set("personal", 10.0, 10.0);
    let conductor = Conductor::start(
        settings(DatabaseLocation::InMemory),
        Arc::new(backend.clone()),
        Some(fetcher),
    )
    .await
    .expect("start");
    let mut events = conductor.subscribe_all();
    let handle = conductor
        .create_session(project(), SessionCommand::new("agent"), None)
        .await
        .expect("create");

    let poll = conductor.poll_usage().await.expect("poller configured");
    assert_eq!(poll.fetched, 2);
    assert_eq!(poll.reported, Some(RateLimitKind::SessionWindow));

    let ConductorEvent::ProfileSwitched(report) =
        next_matching(&mut events, |event| matches!(event, ConductorEvent::ProfileSwitched(_))).await
    else {
        unreachable!("predicate only matches ProfileSwitched");
    };
    assert_eq!(report.to_profile, Some(ProfileId::new("personal")));
    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.retried[0].previous, handle.session_id);
    let replacement = backend
        .process(&report.retried[0].replacement)
        .expect("replacement spawned");
    assert_eq!(
        replacement.env_value(DEFAULT_CREDENTIAL_ENV_VAR).as_deref(),
        Some("token-personal")
    );
    assert_eq!(
        conductor.active_profile().expect("active").map(|profile| profile.id),
        Some(ProfileId::new("personal"))
    );
    assert_eq!(conductor.last_switch_report(), Some(report));

    conductor.shutdown().await;
}

#[tokio::test]
async fn removing_the_only_profile_with_running_sessions_is_refused() {
    let backend = FakeBackend::new();
    let conductor = Conductor::start(
        ConductorSettings {
            profiles: vec![NewProfile::new("work", "Work").credential("token-work")],
            ..ConductorSettings::default()
        },
        Arc::new(backend.clone()),
        None,
    )
    .await
    .expect("start");
    let handle = conductor
        .create_session(project(), SessionCommand::new("agent"), None)
        .await
        .expect("create");

    let err = conductor
        .remove_profile(&ProfileId::new("work"))
        .await
        .expect_err("profile in use");
    assert!(matches!(err, ConductorError::ProfileInUse(_)));

    conductor
        .destroy_session(&handle.session_id)
        .await
        .expect("destroy");
    assert_eq!(
        conductor
            .remove_profile(&ProfileId::new("work"))
            .await
            .expect("remove idle profile"),
        None
    );
    assert!(conductor.list_profiles().expect("profiles").is_empty());

    conductor.shutdown().await;
}

#[tokio::test]
async fn autosave_snapshots_running_sessions_periodically() {
    let backend = FakeBackend::new();
    let conductor = Conductor::start(
        ConductorSettings {
            autosave_interval: Some(Duration::from_millis(20)),
            ..settings(DatabaseLocation::InMemory)
        },
        Arc::new(backend.clone()),
        None,
    )
    .await
    .expect("start");
    let handle = conductor
        .create_session(project(), SessionCommand::new("agent"), None)
        .await
        .expect("create");

    let saved = timeout(TEST_TIMEOUT, async {
        loop {
            let saved = conductor
                .saved_sessions(&project(), handle.date)
                .await
                .expect("saved sessions");
            if !saved.is_empty() {
                return saved;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("autosave ran");

    assert_eq!(saved[0].session_id, handle.session_id);
    assert_eq!(saved[0].state, SessionState::Running);

    conductor.shutdown().await;
}

#[tokio::test]
async fn manual_switch_and_retry_through_the_facade() {
    let backend = FakeBackend::new();
    let conductor = Conductor::start(
        settings(DatabaseLocation::InMemory),
        Arc::new(backend.clone()),
        None,
    )
    .await
    .expect("start");
    let handle = conductor
        .create_session(project(), SessionCommand::new("agent"), None)
        .await
        .expect("create");

    conductor
        .switch_profile(&ProfileId::new("personal"))
        .await
        .expect("switch");
    let replacement = conductor
        .retry_session(&handle.session_id)
        .await
        .expect("retry");

    let info = conductor.session(&replacement).await.expect("replacement");
    assert_eq!(info.retried_from, Some(handle.session_id.clone()));
    assert_eq!(info.profile_id, Some(ProfileId::new("personal")));
    let listed: Vec<_> = conductor
        .list_by_date(&project(), handle.date)
        .await
        .into_iter()
        .map(|info| info.session_id)
        .collect();
    assert_eq!(listed, vec![handle.session_id.clone(), replacement]);
    assert_eq!(conductor.perf_snapshot().await.retry_requests_total, 1);

    conductor.shutdown().await;
}
