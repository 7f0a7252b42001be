use std::path::PathBuf;

use conductor_protocol::credential::CredentialMaterial;
use conductor_protocol::event::RateLimitKind;
use conductor_protocol::ids::ProfileId;
use time::OffsetDateTime;

/// Most recent usage reading for a profile, in percent of each quota.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSnapshot {
    pub session_percent: f64,
    pub weekly_percent: f64,
    pub fetched_at: OffsetDateTime,
}

impl UsageSnapshot {
    pub fn new(session_percent: f64, weekly_percent: f64, fetched_at: OffsetDateTime) -> Self {
        Self {
            session_percent: clamp_percent(session_percent),
            weekly_percent: clamp_percent(weekly_percent),
            fetched_at,
        }
    }

    pub fn percent(&self, kind: RateLimitKind) -> f64 {
        match kind {
            RateLimitKind::SessionWindow => self.session_percent,
            RateLimitKind::Weekly => self.weekly_percent,
        }
    }

    pub fn combined(&self) -> f64 {
        self.session_percent + self.weekly_percent
    }
}

pub(crate) fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Registration input.
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub id: ProfileId,
    pub name: String,
    pub credential: CredentialMaterial,
    pub config_dir: Option<PathBuf>,
}

impl NewProfile {
    pub fn new(id: impl Into<ProfileId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            credential: CredentialMaterial::new(String::new()),
            config_dir: None,
        }
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = CredentialMaterial::new(credential);
        self
    }

    pub fn config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(config_dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProfileEntry {
    pub(crate) id: ProfileId,
    pub(crate) name: String,
    pub(crate) credential: CredentialMaterial,
    pub(crate) config_dir: Option<PathBuf>,
    pub(crate) usage: Option<UsageSnapshot>,
    pub(crate) last_activated_at: Option<OffsetDateTime>,
}

impl ProfileEntry {
    pub(crate) fn from_new(profile: NewProfile) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            credential: profile.credential,
            config_dir: profile.config_dir,
            usage: None,
            last_activated_at: None,
        }
    }

    pub(crate) fn snapshot(&self, active: bool) -> ProfileSnapshot {
        ProfileSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            credential: self.credential.clone(),
            config_dir: self.config_dir.clone(),
            active,
            usage: self.usage,
            last_activated_at: self.last_activated_at,
        }
    }

    /// Unknown usage counts as zero.
    pub(crate) fn usage_or_zero(&self) -> (f64, f64) {
        self.usage
            .map(|usage| (usage.session_percent, usage.weekly_percent))
            .unwrap_or((0.0, 0.0))
    }
}

/// Point-in-time copy of a registered profile. The credential stays redacted
/// in `Debug` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSnapshot {
    pub id: ProfileId,
    pub name: String,
    pub credential: CredentialMaterial,
    pub config_dir: Option<PathBuf>,
    pub active: bool,
    pub usage: Option<UsageSnapshot>,
    pub last_activated_at: Option<OffsetDateTime>,
}
