use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::error::ConductorError;
use crate::ids::{ProfileId, ProjectId, SessionId};

pub const DEFAULT_TERMINAL_COLS: u16 = 120;
pub const DEFAULT_TERMINAL_ROWS: u16 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Exited,
    Killed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Errored => "errored",
        }
    }
}

impl FromStr for SessionState {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "exited" => Ok(Self::Exited),
            "killed" => Ok(Self::Killed),
            "errored" => Ok(Self::Errored),
            other => Err(ConductorError::Persistence(format!(
                "unrecognized session state '{other}'"
            ))),
        }
    }
}

/// The program a session runs. Restore and retry re-run exactly this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl SessionCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_TERMINAL_COLS,
            rows: DEFAULT_TERMINAL_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: SessionId,
    pub command: SessionCommand,
    pub size: TerminalSize,
    /// Credential variables for the bound profile. Applied after `command.env`.
    pub environment: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn merged_environment(&self) -> Vec<(String, String)> {
        let mut merged = self.command.env.clone();
        for (key, value) in &self.environment {
            merged.retain(|(existing, _)| existing != key);
            merged.push((key.clone(), value.clone()));
        }
        merged
    }
}

/// Calendar day a session belongs to; the persistence partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionDate(Date);

impl SessionDate {
    pub fn new(date: Date) -> Self {
        Self(date)
    }

    pub fn from_timestamp(timestamp: OffsetDateTime, offset: UtcOffset) -> Self {
        Self(timestamp.to_offset(offset).date())
    }

    pub fn date(self) -> Date {
        self.0
    }
}

impl fmt::Display for SessionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.0.year(),
            u8::from(self.0.month()),
            self.0.day()
        )
    }
}

impl FromStr for SessionDate {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConductorError::Configuration(format!("invalid date '{value}', expected YYYY-MM-DD"));
        let mut parts = value.trim().splitn(3, '-');
        let year = parts
            .next()
            .and_then(|part| part.parse::<i32>().ok())
            .ok_or_else(invalid)?;
        let month = parts
            .next()
            .and_then(|part| part.parse::<u8>().ok())
            .and_then(|month| Month::try_from(month).ok())
            .ok_or_else(invalid)?;
        let day = parts
            .next()
            .and_then(|part| part.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        Date::from_calendar_date(year, month, day)
            .map(Self)
            .map_err(|_| invalid())
    }
}

impl Serialize for SessionDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub date: SessionDate,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    pub command: SessionCommand,
    pub state: SessionState,
    pub title: Option<String>,
    pub profile_id: Option<ProfileId>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub retried_from: Option<SessionId>,
    pub restored_from: Option<SessionId>,
}

/// Immutable record of a session, written when it reaches a terminal state or
/// when a whole date partition is saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub date: SessionDate,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub title: Option<String>,
    pub command: SessionCommand,
    pub profile_id: Option<ProfileId>,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub scrollback: Vec<u8>,
    pub retried_from: Option<SessionId>,
}
