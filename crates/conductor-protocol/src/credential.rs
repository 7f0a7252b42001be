use std::fmt;

use crate::error::ConductorResult;
use crate::ids::ProfileId;

/// Secret token material. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialMaterial(String);

impl CredentialMaterial {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn preview(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_owned();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialMaterial({})", self.preview())
    }
}

impl fmt::Display for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

/// Read side of the profile registry as seen by the session registry.
pub trait CredentialSource: Send + Sync {
    fn active_profile(&self) -> Option<ProfileId>;
    fn spawn_environment(&self, profile_id: &ProfileId) -> ConductorResult<Vec<(String, String)>>;
}

/// Source for hosts that run sessions without any profile.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn active_profile(&self) -> Option<ProfileId> {
        None
    }

    fn spawn_environment(&self, profile_id: &ProfileId) -> ConductorResult<Vec<(String, String)>> {
        Err(crate::error::ConductorError::UnknownProfile(profile_id.clone()))
    }
}
