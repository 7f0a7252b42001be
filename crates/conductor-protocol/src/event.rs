use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{ProfileId, ProjectId, SessionId};
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateLimitKind {
    SessionWindow,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitSource {
    Output,
    ExitSignal,
    UsagePoll,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub profile_id: ProfileId,
    pub session_id: Option<SessionId>,
    pub kind: RateLimitKind,
    pub source: RateLimitSource,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    pub reset_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchTrigger {
    RateLimit,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriedSession {
    pub previous: SessionId,
    pub replacement: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRetry {
    pub session_id: SessionId,
    pub reason: String,
}

/// Outcome of one switch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCycleReport {
    pub trigger: SwitchTrigger,
    pub from_profile: Option<ProfileId>,
    pub to_profile: Option<ProfileId>,
    pub kind: Option<RateLimitKind>,
    pub retried: Vec<RetriedSession>,
    pub failed: Vec<FailedRetry>,
    pub merged_events: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub project_id: ProjectId,
    pub profile_id: Option<ProfileId>,
    pub retried_from: Option<SessionId>,
    pub restored_from: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConductorEvent {
    Started(SessionStarted),
    Output(Vec<u8>),
    TitleChanged(String),
    Ended(SessionEnded),
    Retried { replacement: SessionId },
    RateLimited(RateLimitEvent),
    CredentialCaptured { profile_id: ProfileId, preview: String },
    ProfileSwitched(SwitchCycleReport),
    NoProfileAvailable { profile_id: ProfileId, kind: RateLimitKind },
}

impl ConductorEvent {
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }
}
