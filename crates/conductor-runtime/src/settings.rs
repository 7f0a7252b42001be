use std::path::PathBuf;
use std::time::Duration;

use conductor_config::ConductorConfig;
use conductor_failover::RateLimitMonitorConfig;
use conductor_persistence::DEFAULT_MAX_SNAPSHOT_SCROLLBACK_BYTES;
use conductor_profiles::{AutoSwitchPolicy, DEFAULT_CREDENTIAL_ENV_VAR, NewProfile};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::session::TerminalSize;
use conductor_sessions::{ScrollbackLimits, SessionRegistryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    InMemory,
}

/// Everything a [`Conductor`](crate::Conductor) needs, resolved from the
/// configuration file or assembled directly by tests.
#[derive(Debug, Clone)]
pub struct ConductorSettings {
    pub sessions: SessionRegistryConfig,
    pub policy: AutoSwitchPolicy,
    pub monitor: RateLimitMonitorConfig,
    pub credential_env_var: String,
    pub database: DatabaseLocation,
    pub snapshot_max_scrollback_bytes: usize,
    /// `None` disables the periodic autosave.
    pub autosave_interval: Option<Duration>,
    pub profiles: Vec<NewProfile>,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            sessions: SessionRegistryConfig::default(),
            policy: AutoSwitchPolicy::default(),
            monitor: RateLimitMonitorConfig::default(),
            credential_env_var: DEFAULT_CREDENTIAL_ENV_VAR.to_owned(),
            database: DatabaseLocation::InMemory,
            snapshot_max_scrollback_bytes: DEFAULT_MAX_SNAPSHOT_SCROLLBACK_BYTES,
            autosave_interval: None,
            profiles: Vec::new(),
        }
    }
}

impl ConductorSettings {
    pub fn from_config(config: &ConductorConfig) -> ConductorResult<Self> {
        let utc_offset = config
            .sessions
            .resolve_utc_offset()
            .map_err(|err| ConductorError::Configuration(err.to_string()))?;
        let sessions = SessionRegistryConfig {
            scrollback: ScrollbackLimits {
                max_lines: config.sessions.scrollback_max_lines,
                max_bytes: config.sessions.scrollback_max_bytes,
            },
            destroy_grace_period: config.sessions.destroy_grace_period(),
            terminal_size: TerminalSize {
                cols: config.sessions.terminal_cols,
                rows: config.sessions.terminal_rows,
            },
            utc_offset,
            ..SessionRegistryConfig::default()
        };

        let failover = &config.failover;
        let policy = AutoSwitchPolicy {
            enabled: failover.enabled,
            session_threshold: failover.session_threshold,
            weekly_threshold: failover.weekly_threshold,
            auto_switch_on_rate_limit: failover.auto_switch_on_rate_limit,
            usage_poll_interval_secs: failover.usage_poll_interval_secs,
        };
        let monitor = RateLimitMonitorConfig {
            dedup_window: failover.dedup_window(),
            ..RateLimitMonitorConfig::default()
        };

        let profiles = config
            .profiles
            .iter()
            .map(|entry| {
                let mut profile = NewProfile::new(entry.id.as_str(), entry.name.as_str());
                match entry.resolve_token() {
                    Some(token) => profile = profile.credential(token),
                    None => tracing::warn!(
                        profile_id = %entry.id,
                        token_env = ?entry.token_env,
                        "profile has no credential; sessions will use the ambient login"
                    ),
                }
                if let Some(config_dir) = entry.config_dir() {
                    profile = profile.config_dir(config_dir);
                }
                profile
            })
            .collect();

        Ok(Self {
            sessions,
            policy: policy.normalized(),
            monitor,
            credential_env_var: failover.credential_env_var.clone(),
            database: DatabaseLocation::File(config.persistence.database_path()),
            snapshot_max_scrollback_bytes: config.persistence.snapshot_max_scrollback_bytes,
            autosave_interval: config.persistence.autosave_interval(),
            profiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use conductor_config::{ConductorConfig, ProfileConfigToml};
    use conductor_test_support::with_env_vars;

    use super::{ConductorSettings, DatabaseLocation};

    #[test]
    fn config_maps_onto_runtime_settings() {
        let mut config = ConductorConfig::default();
        config.sessions.utc_offset = "+01:00".to_owned();
        config.sessions.destroy_grace_secs = 9;
        config.persistence.database_path = "/var/tmp/conductor/sessions.db".to_owned();
        config.persistence.autosave_interval_secs = 0;
        config.failover.session_threshold = 80;
        config.failover.dedup_window_ms = 500;
        config.profiles.push(ProfileConfigToml {
            id: "work".to_owned(),
            name: "Work".to_owned(),
            token_env: Some("CONDUCTOR_SETTINGS_TEST_TOKEN".to_owned()),
            config_dir: Some("/home/me/.claude-work".to_owned()),
        });

        let settings = with_env_vars(&[("CONDUCTOR_SETTINGS_TEST_TOKEN", Some("tok"))], || {
            ConductorSettings::from_config(&config).expect("settings")
        });

        assert_eq!(settings.sessions.utc_offset.whole_hours(), 1);
        assert_eq!(settings.sessions.destroy_grace_period.as_secs(), 9);
        assert_eq!(settings.policy.session_threshold, 80);
        assert_eq!(settings.monitor.dedup_window.as_millis(), 500);
        assert_eq!(settings.autosave_interval, None);
        assert_eq!(
            settings.database,
            DatabaseLocation::File("/var/tmp/conductor/sessions.db".into())
        );
        assert_eq!(settings.profiles.len(), 1);
    }

    #[test]
    fn invalid_offset_is_a_configuration_error() {
        let mut config = ConductorConfig::default();
        config.sessions.utc_offset = "tomorrow".to_owned();

        assert!(ConductorSettings::from_config(&config).is_err());
    }
}
