use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use conductor_protocol::credential::CredentialSource;
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::ids::ProfileId;

pub const FAKE_TOKEN_ENV: &str = "CONDUCTOR_FAKE_TOKEN";

#[derive(Default)]
struct FakeCredentialState {
    active: Option<ProfileId>,
    tokens: HashMap<ProfileId, String>,
}

/// In-memory [`CredentialSource`] exposing each profile's token as
/// `CONDUCTOR_FAKE_TOKEN`.
#[derive(Default)]
pub struct FakeCredentials {
    state: Mutex<FakeCredentialState>,
}

impl FakeCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, profile_id: &str, token: &str) -> Self {
        {
            let mut state = self.lock();
            let profile_id = ProfileId::new(profile_id);
            if state.active.is_none() {
                state.active = Some(profile_id.clone());
            }
            state.tokens.insert(profile_id, token.to_owned());
        }
        self
    }

    pub fn set_active(&self, profile_id: Option<&str>) {
        self.lock().active = profile_id.map(ProfileId::new);
    }

    fn lock(&self) -> MutexGuard<'_, FakeCredentialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialSource for FakeCredentials {
    fn active_profile(&self) -> Option<ProfileId> {
        self.lock().active.clone()
    }

    fn spawn_environment(&self, profile_id: &ProfileId) -> ConductorResult<Vec<(String, String)>> {
        let state = self.lock();
        let token = state
            .tokens
            .get(profile_id)
            .ok_or_else(|| ConductorError::UnknownProfile(profile_id.clone()))?;
        Ok(vec![(FAKE_TOKEN_ENV.to_owned(), token.clone())])
    }
}
