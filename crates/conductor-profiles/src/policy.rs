use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_THRESHOLD: u8 = 95;
pub const DEFAULT_WEEKLY_THRESHOLD: u8 = 99;
pub const DEFAULT_USAGE_POLL_INTERVAL_SECS: u64 = 300;

/// Thresholds and switches governing automatic profile failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSwitchPolicy {
    pub enabled: bool,
    /// Session-window usage percentage at or above which a profile is ineligible.
    pub session_threshold: u8,
    pub weekly_threshold: u8,
    pub auto_switch_on_rate_limit: bool,
    /// Zero disables usage polling.
    pub usage_poll_interval_secs: u64,
}

impl Default for AutoSwitchPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            session_threshold: DEFAULT_SESSION_THRESHOLD,
            weekly_threshold: DEFAULT_WEEKLY_THRESHOLD,
            auto_switch_on_rate_limit: true,
            usage_poll_interval_secs: DEFAULT_USAGE_POLL_INTERVAL_SECS,
        }
    }
}

impl AutoSwitchPolicy {
    pub fn normalized(self) -> Self {
        Self {
            session_threshold: self.session_threshold.min(100),
            weekly_threshold: self.weekly_threshold.min(100),
            ..self
        }
    }

    /// Whether rate-limit events should trigger a switch cycle.
    pub fn switches_on_rate_limit(&self) -> bool {
        self.enabled && self.auto_switch_on_rate_limit
    }

    pub fn polling_enabled(&self) -> bool {
        self.enabled && self.usage_poll_interval_secs > 0
    }

    pub fn is_eligible(&self, session_percent: f64, weekly_percent: f64) -> bool {
        session_percent < f64::from(self.session_threshold)
            && weekly_percent < f64::from(self.weekly_threshold)
    }
}
