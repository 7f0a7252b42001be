use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::UtcOffset;
use time::macros::format_description;

pub const ENV_CONDUCTOR_CONFIG: &str = "CONDUCTOR_CONFIG";

const DEFAULT_DATABASE_FILE_NAME: &str = "sessions.db";
const DEFAULT_LOG_FILE_NAME: &str = "conductor.log";
const DEFAULT_SCROLLBACK_MAX_LINES: usize = 10_000;
const DEFAULT_SCROLLBACK_MAX_BYTES: usize = 1024 * 1024;
const DEFAULT_DESTROY_GRACE_SECS: u64 = 5;
const DEFAULT_TERMINAL_COLS: u16 = 120;
const DEFAULT_TERMINAL_ROWS: u16 = 40;
const DEFAULT_UTC_OFFSET: &str = "local";
const DEFAULT_SNAPSHOT_MAX_SCROLLBACK_BYTES: usize = 256 * 1024;
const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 60;
const DEFAULT_SESSION_THRESHOLD: u8 = 95;
const DEFAULT_WEEKLY_THRESHOLD: u8 = 99;
const DEFAULT_USAGE_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_DEDUP_WINDOW_MS: u64 = 2_000;
const DEFAULT_CREDENTIAL_ENV_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConductorConfig {
    #[serde(default)]
    pub sessions: SessionsConfigToml,
    #[serde(default)]
    pub persistence: PersistenceConfigToml,
    #[serde(default)]
    pub failover: FailoverConfigToml,
    #[serde(default)]
    pub profiles: Vec<ProfileConfigToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionsConfigToml {
    #[serde(default = "default_scrollback_max_lines")]
    pub scrollback_max_lines: usize,
    #[serde(default = "default_scrollback_max_bytes")]
    pub scrollback_max_bytes: usize,
    #[serde(default = "default_destroy_grace_secs")]
    pub destroy_grace_secs: u64,
    #[serde(default = "default_terminal_cols")]
    pub terminal_cols: u16,
    #[serde(default = "default_terminal_rows")]
    pub terminal_rows: u16,
    /// `local`, `utc` or a fixed offset such as `+02:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for SessionsConfigToml {
    fn default() -> Self {
        Self {
            scrollback_max_lines: default_scrollback_max_lines(),
            scrollback_max_bytes: default_scrollback_max_bytes(),
            destroy_grace_secs: default_destroy_grace_secs(),
            terminal_cols: default_terminal_cols(),
            terminal_rows: default_terminal_rows(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl SessionsConfigToml {
    pub fn destroy_grace_period(&self) -> Duration {
        Duration::from_secs(self.destroy_grace_secs)
    }

    /// Offset used to derive session dates. `local` falls back to UTC when the
    /// platform cannot report its offset.
    pub fn resolve_utc_offset(&self) -> Result<UtcOffset, ConfigError> {
        match parse_utc_offset(&self.utc_offset) {
            Some(OffsetSetting::Local) => Ok(UtcOffset::current_local_offset().unwrap_or_else(
                |err| {
                    tracing::warn!(error = %err, "local utc offset unavailable; using UTC");
                    UtcOffset::UTC
                },
            )),
            Some(OffsetSetting::Fixed(offset)) => Ok(offset),
            None => Err(ConfigError::configuration(format!(
                "sessions.utc_offset must be 'local', 'utc' or '+HH:MM', got '{}'",
                self.utc_offset
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistenceConfigToml {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_snapshot_max_scrollback_bytes")]
    pub snapshot_max_scrollback_bytes: usize,
    /// Zero disables the periodic autosave.
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,
}

impl Default for PersistenceConfigToml {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            snapshot_max_scrollback_bytes: default_snapshot_max_scrollback_bytes(),
            autosave_interval_secs: default_autosave_interval_secs(),
        }
    }
}

impl PersistenceConfigToml {
    pub fn database_path(&self) -> PathBuf {
        absolutize_path(PathBuf::from(self.database_path.trim()))
    }

    /// Log file living next to the database.
    pub fn log_path(&self) -> PathBuf {
        let database = self.database_path();
        match database.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(DEFAULT_LOG_FILE_NAME),
            _ => default_conductor_data_dir().join(DEFAULT_LOG_FILE_NAME),
        }
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_secs > 0).then(|| Duration::from_secs(self.autosave_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverConfigToml {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_switch_on_rate_limit: bool,
    #[serde(default = "default_session_threshold")]
    pub session_threshold: u8,
    #[serde(default = "default_weekly_threshold")]
    pub weekly_threshold: u8,
    /// Zero disables usage polling.
    #[serde(default = "default_usage_poll_interval_secs")]
    pub usage_poll_interval_secs: u64,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Environment variable carrying the credential into spawned sessions.
    #[serde(default = "default_credential_env_var")]
    pub credential_env_var: String,
}

impl Default for FailoverConfigToml {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_switch_on_rate_limit: true,
            session_threshold: default_session_threshold(),
            weekly_threshold: default_weekly_threshold(),
            usage_poll_interval_secs: default_usage_poll_interval_secs(),
            dedup_window_ms: default_dedup_window_ms(),
            credential_env_var: default_credential_env_var(),
        }
    }
}

impl FailoverConfigToml {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// A credential profile registered at startup. The token itself is never
/// written to the file, only the name of the variable holding it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfigToml {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,
}

impl ProfileConfigToml {
    pub fn resolve_token(&self) -> Option<String> {
        let name = self.token_env.as_deref()?;
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    pub fn config_dir(&self) -> Option<PathBuf> {
        self.config_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| absolutize_path(PathBuf::from(value)))
    }
}

pub fn load_from_env() -> Result<ConductorConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConductorConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("conductor").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_CONDUCTOR_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "CONDUCTOR_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_conductor_data_dir() -> PathBuf {
    resolve_data_local_dir().join("conductor")
}

fn resolve_data_local_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("LOCALAPPDATA") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join("AppData").join("Local");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = resolve_home_dir() {
            return home.join("Library").join("Application Support");
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        if let Ok(path) = std::env::var("XDG_DATA_HOME") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join(".local").join("share");
        }
    }

    std::env::temp_dir()
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    std::env::temp_dir().join(path)
}

enum OffsetSetting {
    Local,
    Fixed(UtcOffset),
}

fn parse_utc_offset(raw: &str) -> Option<OffsetSetting> {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("local") {
        return Some(OffsetSetting::Local);
    }
    if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("z") {
        return Some(OffsetSetting::Fixed(UtcOffset::UTC));
    }
    let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(value, format)
        .ok()
        .map(OffsetSetting::Fixed)
}

fn default_true() -> bool {
    true
}

fn default_scrollback_max_lines() -> usize {
    DEFAULT_SCROLLBACK_MAX_LINES
}

fn default_scrollback_max_bytes() -> usize {
    DEFAULT_SCROLLBACK_MAX_BYTES
}

fn default_destroy_grace_secs() -> u64 {
    DEFAULT_DESTROY_GRACE_SECS
}

fn default_terminal_cols() -> u16 {
    DEFAULT_TERMINAL_COLS
}

fn default_terminal_rows() -> u16 {
    DEFAULT_TERMINAL_ROWS
}

fn default_utc_offset() -> String {
    DEFAULT_UTC_OFFSET.to_owned()
}

fn default_database_path() -> String {
    default_conductor_data_dir()
        .join(DEFAULT_DATABASE_FILE_NAME)
        .to_string_lossy()
        .to_string()
}

fn default_snapshot_max_scrollback_bytes() -> usize {
    DEFAULT_SNAPSHOT_MAX_SCROLLBACK_BYTES
}

fn default_autosave_interval_secs() -> u64 {
    DEFAULT_AUTOSAVE_INTERVAL_SECS
}

fn default_session_threshold() -> u8 {
    DEFAULT_SESSION_THRESHOLD
}

fn default_weekly_threshold() -> u8 {
    DEFAULT_WEEKLY_THRESHOLD
}

fn default_usage_poll_interval_secs() -> u64 {
    DEFAULT_USAGE_POLL_INTERVAL_SECS
}

fn default_dedup_window_ms() -> u64 {
    DEFAULT_DEDUP_WINDOW_MS
}

fn default_credential_env_var() -> String {
    DEFAULT_CREDENTIAL_ENV_VAR.to_owned()
}

fn persist_config(path: &Path, config: &ConductorConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize CONDUCTOR_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write CONDUCTOR_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<ConductorConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for CONDUCTOR_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = ConductorConfig::default();
            persist_config(path, &default_config)?;
            tracing::info!(path = %path.display(), "wrote default configuration");

            toml::to_string_pretty(&default_config).map_err(|err| {
                ConfigError::configuration(format!(
                    "Failed to serialize default CONDUCTOR_CONFIG: {err}"
                ))
            })?
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read CONDUCTOR_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: ConductorConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse CONDUCTOR_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    let changed = normalize_config(&mut config);
    if changed {
        persist_config(path, &config)?;
    }

    Ok(config)
}

/// Repairs empty paths, zero caps, out-of-range thresholds and malformed
/// profile entries. Returns whether anything changed.
pub fn normalize_config(config: &mut ConductorConfig) -> bool {
    let mut changed = false;

    changed |= normalize_sessions_config(&mut config.sessions);
    changed |= normalize_persistence_config(&mut config.persistence);
    changed |= normalize_failover_config(&mut config.failover);
    changed |= normalize_profiles(&mut config.profiles);

    changed
}

pub fn normalize_sessions_config(config: &mut SessionsConfigToml) -> bool {
    let mut changed = false;

    if config.scrollback_max_lines == 0 {
        config.scrollback_max_lines = default_scrollback_max_lines();
        changed = true;
    }
    if config.scrollback_max_bytes == 0 {
        config.scrollback_max_bytes = default_scrollback_max_bytes();
        changed = true;
    }
    let normalized_grace_secs = config.destroy_grace_secs.clamp(1, 120);
    if normalized_grace_secs != config.destroy_grace_secs {
        config.destroy_grace_secs = normalized_grace_secs;
        changed = true;
    }
    if config.terminal_cols == 0 {
        config.terminal_cols = default_terminal_cols();
        changed = true;
    }
    if config.terminal_rows == 0 {
        config.terminal_rows = default_terminal_rows();
        changed = true;
    }

    let trimmed = config.utc_offset.trim();
    if parse_utc_offset(trimmed).is_none() {
        tracing::warn!(value = %config.utc_offset, "invalid sessions.utc_offset; using local");
        config.utc_offset = default_utc_offset();
        changed = true;
    } else if trimmed != config.utc_offset {
        config.utc_offset = trimmed.to_owned();
        changed = true;
    }

    changed
}

pub fn normalize_persistence_config(config: &mut PersistenceConfigToml) -> bool {
    let mut changed = normalize_non_empty_string(&mut config.database_path, default_database_path());

    if config.snapshot_max_scrollback_bytes == 0 {
        config.snapshot_max_scrollback_bytes = default_snapshot_max_scrollback_bytes();
        changed = true;
    }

    changed
}

pub fn normalize_failover_config(config: &mut FailoverConfigToml) -> bool {
    let mut changed = false;

    let normalized_session_threshold = if config.session_threshold == 0 {
        default_session_threshold()
    } else {
        config.session_threshold.min(100)
    };
    if normalized_session_threshold != config.session_threshold {
        config.session_threshold = normalized_session_threshold;
        changed = true;
    }

    let normalized_weekly_threshold = if config.weekly_threshold == 0 {
        default_weekly_threshold()
    } else {
        config.weekly_threshold.min(100)
    };
    if normalized_weekly_threshold != config.weekly_threshold {
        config.weekly_threshold = normalized_weekly_threshold;
        changed = true;
    }

    if config.dedup_window_ms == 0 {
        config.dedup_window_ms = default_dedup_window_ms();
        changed = true;
    }
    changed |=
        normalize_non_empty_string(&mut config.credential_env_var, default_credential_env_var());

    changed
}

/// Trims ids, drops entries without one and keeps the first of any duplicate.
pub fn normalize_profiles(profiles: &mut Vec<ProfileConfigToml>) -> bool {
    let mut changed = false;
    let mut seen = Vec::<String>::with_capacity(profiles.len());
    let before = profiles.len();

    profiles.retain_mut(|profile| {
        changed |= normalize_non_empty_string(&mut profile.id, String::new());
        if profile.id.is_empty() || seen.contains(&profile.id) {
            return false;
        }
        seen.push(profile.id.clone());
        changed |= normalize_non_empty_string(&mut profile.name, profile.id.clone());
        changed |= normalize_optional_string(&mut profile.token_env);
        changed |= normalize_optional_string(&mut profile.config_dir);
        true
    });

    changed || profiles.len() != before
}

fn normalize_non_empty_string(value: &mut String, fallback: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != fallback {
            *value = fallback;
            return true;
        }
        return false;
    }
    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    let Some(current) = value.as_mut() else {
        return false;
    };
    let trimmed = current.trim();
    if trimmed.is_empty() {
        *value = None;
        return true;
    }
    if trimmed != current {
        *current = trimmed.to_owned();
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_test_support::with_env_vars;

    fn write_config_file(path: &Path, raw: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create fixture config parent");
        }
        std::fs::write(path, raw.as_bytes()).expect("write fixture config");
    }

    #[test]
    fn load_from_env_creates_default_config_when_missing() {
        let home = tempfile::tempdir().expect("home dir");
        let expected = home
            .path()
            .join(".config")
            .join("conductor")
            .join("config.toml");

        with_env_vars(
            &[
                ("HOME", Some(home.path().to_str().expect("home path"))),
                ("USERPROFILE", None),
                (ENV_CONDUCTOR_CONFIG, None),
                ("XDG_DATA_HOME", None),
            ],
            || {
                let config = load_from_env().expect("load defaults");
                assert_eq!(config.sessions.utc_offset, "local");
                assert_eq!(config.failover.session_threshold, 95);
                assert_eq!(config.failover.weekly_threshold, 99);
                assert_eq!(config.failover.credential_env_var, "CLAUDE_CODE_OAUTH_TOKEN");
                assert!(config.profiles.is_empty());
                assert!(expected.exists());
            },
        );
    }

    #[test]
    fn load_from_env_honors_explicit_config_path() {
        let home = tempfile::tempdir().expect("home dir");
        let root = tempfile::tempdir().expect("explicit root");
        let explicit = root.path().join("nested").join("custom.toml");
        let default = home
            .path()
            .join(".config")
            .join("conductor")
            .join("config.toml");

        with_env_vars(
            &[
                ("HOME", Some(home.path().to_str().expect("home path"))),
                ("USERPROFILE", None),
                (
                    ENV_CONDUCTOR_CONFIG,
                    Some(explicit.to_str().expect("config path")),
                ),
            ],
            || {
                load_from_env().expect("load explicit path config");
                assert!(explicit.exists());
                assert!(!default.exists());
            },
        );
    }

    #[test]
    fn blank_config_env_falls_back_to_default_path() {
        let home = tempfile::tempdir().expect("home dir");

        with_env_vars(
            &[
                ("HOME", Some(home.path().to_str().expect("home path"))),
                ("USERPROFILE", None),
                (ENV_CONDUCTOR_CONFIG, Some("   ")),
            ],
            || {
                let path = config_path_from_env().expect("resolve path");
                assert_eq!(
                    path,
                    home.path().join(".config").join("conductor").join("config.toml")
                );
            },
        );
    }

    #[test]
    fn default_database_path_follows_xdg_data_home() {
        let data = tempfile::tempdir().expect("data dir");

        with_env_vars(
            &[("XDG_DATA_HOME", Some(data.path().to_str().expect("data path")))],
            || {
                let config = PersistenceConfigToml::default();
                if cfg!(all(not(target_os = "windows"), not(target_os = "macos"))) {
                    assert_eq!(
                        config.database_path(),
                        data.path().join("conductor").join("sessions.db")
                    );
                    assert_eq!(
                        config.log_path(),
                        data.path().join("conductor").join("conductor.log")
                    );
                }
            },
        );
    }

    #[test]
    fn partial_file_is_completed_and_repaired_on_load() {
        let root = tempfile::tempdir().expect("root");
        let path = root.path().join("config.toml");
        write_config_file(
            &path,
            r#"
[sessions]
scrollback_max_lines = 0
utc_offset = "somewhere"

[persistence]
database_path = "   "
autosave_interval_secs = 0

[failover]
session_threshold = 180
weekly_threshold = 0
credential_env_var = ""

[[profiles]]
id = " work "
token_env = "WORK_TOKEN"

[[profiles]]
id = ""

[[profiles]]
id = "work"
name = "duplicate"
"#,
        );

        let config = load_from_path(&path).expect("load config");

        assert_eq!(config.sessions.scrollback_max_lines, 10_000);
        assert_eq!(config.sessions.utc_offset, "local");
        assert!(!config.persistence.database_path.trim().is_empty());
        assert_eq!(config.persistence.autosave_interval(), None);
        assert_eq!(config.failover.session_threshold, 100);
        assert_eq!(config.failover.weekly_threshold, 99);
        assert_eq!(config.failover.credential_env_var, "CLAUDE_CODE_OAUTH_TOKEN");
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].id, "work");
        assert_eq!(config.profiles[0].name, "work");

        let persisted = std::fs::read_to_string(&path).expect("read persisted config");
        let reparsed: ConductorConfig = toml::from_str(&persisted).expect("parse persisted");
        assert_eq!(reparsed, config);
    }

    #[test]
    fn normalized_config_is_left_untouched() {
        let root = tempfile::tempdir().expect("root");
        let path = root.path().join("config.toml");
        let mut config = ConductorConfig::default();
        config.profiles.push(ProfileConfigToml {
            id: "work".to_owned(),
            name: "Work".to_owned(),
            token_env: Some("WORK_TOKEN".to_owned()),
            config_dir: None,
        });
        persist_config(&path, &config).expect("persist");
        let before = std::fs::read_to_string(&path).expect("read");

        let loaded = load_from_path(&path).expect("load");

        assert_eq!(loaded, config);
        assert_eq!(std::fs::read_to_string(&path).expect("read again"), before);
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        let root = tempfile::tempdir().expect("root");
        let path = root.path().join("config.toml");
        write_config_file(&path, "[sessions\nscrollback_max_lines = ");

        let err = load_from_path(&path).expect_err("parse should fail");

        assert!(matches!(err, ConfigError::Message(message) if message.contains("Failed to parse")));
    }

    #[test]
    fn utc_offset_settings_resolve() {
        let mut sessions = SessionsConfigToml {
            utc_offset: "+02:30".to_owned(),
            ..SessionsConfigToml::default()
        };
        let offset = sessions.resolve_utc_offset().expect("fixed offset");
        assert_eq!(offset.whole_minutes(), 150);

        sessions.utc_offset = "UTC".to_owned();
        assert_eq!(sessions.resolve_utc_offset().expect("utc"), UtcOffset::UTC);

        sessions.utc_offset = "-05:00".to_owned();
        assert_eq!(sessions.resolve_utc_offset().expect("negative").whole_hours(), -5);

        sessions.utc_offset = "noon".to_owned();
        assert!(sessions.resolve_utc_offset().is_err());
    }

    #[test]
    fn profile_token_is_read_from_the_named_variable() {
        let profile = ProfileConfigToml {
            id: "work".to_owned(),
            name: "work".to_owned(),
            token_env: Some("CONDUCTOR_TEST_WORK_TOKEN".to_owned()),
            config_dir: Some("  ".to_owned()),
        };

        with_env_vars(&[("CONDUCTOR_TEST_WORK_TOKEN", Some(" token-1 "))], || {
            assert_eq!(profile.resolve_token().as_deref(), Some("token-1"));
        });
        with_env_vars(&[("CONDUCTOR_TEST_WORK_TOKEN", None)], || {
            assert_eq!(profile.resolve_token(), None);
        });
        assert_eq!(profile.config_dir(), None);
    }
}
