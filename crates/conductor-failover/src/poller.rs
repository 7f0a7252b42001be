use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_profiles::{AutoSwitchPolicy, ProfileRegistry, ProfileSnapshot};
use conductor_protocol::error::ConductorResult;
use conductor_protocol::event::{RateLimitEvent, RateLimitKind, RateLimitSource};
use time::OffsetDateTime;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::monitor::RateLimitMonitor;

/// Usage percentages reported by the provider for one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReading {
    pub session_percent: f64,
    pub weekly_percent: f64,
    pub reset_hint: Option<String>,
    pub fetched_at: OffsetDateTime,
}

#[async_trait]
pub trait UsageFetcher: Send + Sync {
    async fn fetch_usage(&self, profile: &ProfileSnapshot) -> ConductorResult<UsageReading>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsagePollReport {
    pub fetched: usize,
    pub failed: usize,
    pub reported: Option<RateLimitKind>,
}

/// Which quota the active profile has breached, if any. When both are over
/// their thresholds the larger margin wins and a tie goes to the session
/// window.
pub fn breached_kind(policy: &AutoSwitchPolicy, reading: &UsageReading) -> Option<RateLimitKind> {
    let session_margin = reading.session_percent - f64::from(policy.session_threshold);
    let weekly_margin = reading.weekly_percent - f64::from(policy.weekly_threshold);
    match (session_margin >= 0.0, weekly_margin >= 0.0) {
        (false, false) => None,
        (true, false) => Some(RateLimitKind::SessionWindow),
        (false, true) => Some(RateLimitKind::Weekly),
        (true, true) if weekly_margin > session_margin => Some(RateLimitKind::Weekly),
        (true, true) => Some(RateLimitKind::SessionWindow),
    }
}

struct PollerTask {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Periodically refreshes every profile's usage and reports a breach of the
/// active profile's thresholds to the [`RateLimitMonitor`].
#[derive(Clone)]
pub struct UsagePoller {
    fetcher: Arc<dyn UsageFetcher>,
    profiles: Arc<ProfileRegistry>,
    monitor: RateLimitMonitor,
    policy: AutoSwitchPolicy,
    poller: Arc<Mutex<Option<PollerTask>>>,
}

impl UsagePoller {
    pub fn new(
        fetcher: Arc<dyn UsageFetcher>,
        profiles: Arc<ProfileRegistry>,
        monitor: RateLimitMonitor,
        policy: AutoSwitchPolicy,
    ) -> Self {
        Self {
            fetcher,
            profiles,
            monitor,
            policy: policy.normalized(),
            poller: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn poll_once(&self) -> UsagePollReport {
        let mut report = UsagePollReport::default();
        let profiles = match self.profiles.list() {
            Ok(profiles) => profiles,
            Err(error) => {
                tracing::warn!(error = %error, "usage poll could not list profiles");
                return report;
            }
        };

        for profile in profiles {
            let reading = match self.fetcher.fetch_usage(&profile).await {
                Ok(reading) => reading,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(profile_id = %profile.id, error = %error, "usage fetch failed");
                    continue;
                }
            };
            report.fetched += 1;
            if let Err(error) = self.profiles.record_usage(
                &profile.id,
                reading.session_percent,
                reading.weekly_percent,
                reading.fetched_at,
            ) {
                tracing::debug!(profile_id = %profile.id, error = %error, "profile vanished during usage poll");
                continue;
            }
            tracing::debug!(
                profile_id = %profile.id,
                session_percent = reading.session_percent,
                weekly_percent = reading.weekly_percent,
                "usage refreshed"
            );

            if !profile.active {
                continue;
            }
            if let Some(kind) = breached_kind(&self.policy, &reading) {
                let forwarded = self.monitor.report(RateLimitEvent {
                    profile_id: profile.id.clone(),
                    session_id: None,
                    kind,
                    source: RateLimitSource::UsagePoll,
                    detected_at: reading.fetched_at,
                    reset_hint: reading.reset_hint.clone(),
                });
                if forwarded {
                    report.reported = Some(kind);
                }
            }
        }
        report
    }

    /// Starts the periodic poll. Does nothing when polling is disabled by the
    /// policy or the poller already runs.
    pub async fn start(&self) {
        if !self.policy.polling_enabled() {
            tracing::info!("usage polling disabled");
            return;
        }
        let mut guard = self.poller.lock().await;
        if guard.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poller = self.clone();
        let period = Duration::from_secs(self.policy.usage_poll_interval_secs);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let report = poller.poll_once().await;
                        if report.failed > 0 {
                            tracing::warn!(failed = report.failed, fetched = report.fetched, "usage poll incomplete");
                        }
                    }
                }
            }
        });
        *guard = Some(PollerTask {
            stop_tx: Some(stop_tx),
            task,
        });
    }

    pub async fn stop(&self) {
        let state = self.poller.lock().await.take();
        if let Some(mut state) = state {
            if let Some(stop_tx) = state.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Err(error) = state.task.await {
                tracing::warn!(error = %error, "usage poller task join failed");
            }
        }
    }
}
