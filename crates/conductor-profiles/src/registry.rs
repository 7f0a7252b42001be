use std::cmp::Ordering;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use conductor_protocol::credential::{CredentialMaterial, CredentialSource};
use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::event::RateLimitKind;
use conductor_protocol::ids::ProfileId;
use time::OffsetDateTime;

use crate::policy::AutoSwitchPolicy;
use crate::profile::{NewProfile, ProfileEntry, ProfileSnapshot, UsageSnapshot};

pub const DEFAULT_CREDENTIAL_ENV_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";
pub const CONFIG_DIR_ENV_VAR: &str = "CLAUDE_CONFIG_DIR";

#[derive(Debug, Default)]
struct ProfileTable {
    /// Registration order.
    profiles: Vec<ProfileEntry>,
    active: Option<ProfileId>,
}

impl ProfileTable {
    fn position(&self, profile_id: &ProfileId) -> Option<usize> {
        self.profiles
            .iter()
            .position(|profile| &profile.id == profile_id)
    }

    fn entry(&self, profile_id: &ProfileId) -> ConductorResult<&ProfileEntry> {
        self.profiles
            .iter()
            .find(|profile| &profile.id == profile_id)
            .ok_or_else(|| ConductorError::UnknownProfile(profile_id.clone()))
    }

    fn entry_mut(&mut self, profile_id: &ProfileId) -> ConductorResult<&mut ProfileEntry> {
        self.profiles
            .iter_mut()
            .find(|profile| &profile.id == profile_id)
            .ok_or_else(|| ConductorError::UnknownProfile(profile_id.clone()))
    }

    fn is_active(&self, profile_id: &ProfileId) -> bool {
        self.active.as_ref() == Some(profile_id)
    }

    fn activate(&mut self, profile_id: &ProfileId, at: OffsetDateTime) -> ConductorResult<()> {
        self.entry_mut(profile_id)?.last_activated_at = Some(at);
        self.active = Some(profile_id.clone());
        Ok(())
    }

    fn best_available(&self, policy: &AutoSwitchPolicy) -> Option<ProfileId> {
        self.profiles
            .iter()
            .filter(|profile| !self.is_active(&profile.id))
            .filter(|profile| {
                let (session, weekly) = profile.usage_or_zero();
                policy.is_eligible(session, weekly)
            })
            .min_by(|left, right| compare_candidates(left, right))
            .map(|profile| profile.id.clone())
    }
}

/// Lowest combined usage first, then least recently activated. Never-activated
/// profiles sort before any activated one.
fn compare_candidates(left: &ProfileEntry, right: &ProfileEntry) -> Ordering {
    let (left_session, left_weekly) = left.usage_or_zero();
    let (right_session, right_weekly) = right.usage_or_zero();
    (left_session + left_weekly)
        .total_cmp(&(right_session + right_weekly))
        .then_with(|| left.last_activated_at.cmp(&right.last_activated_at))
}

/// The set of credential profiles and the single active one.
#[derive(Debug)]
pub struct ProfileRegistry {
    table: RwLock<ProfileTable>,
    credential_env_var: String,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL_ENV_VAR)
    }
}

impl ProfileRegistry {
    pub fn new(credential_env_var: impl Into<String>) -> Self {
        let credential_env_var = credential_env_var.into();
        let credential_env_var = if credential_env_var.trim().is_empty() {
            DEFAULT_CREDENTIAL_ENV_VAR.to_owned()
        } else {
            credential_env_var
        };
        Self {
            table: RwLock::new(ProfileTable::default()),
            credential_env_var,
        }
    }

    pub fn credential_env_var(&self) -> &str {
        &self.credential_env_var
    }

    /// Adds a profile. The first registered profile becomes active.
    pub fn register(&self, profile: NewProfile) -> ConductorResult<ProfileSnapshot> {
        if profile.id.as_str().trim().is_empty() {
            return Err(ConductorError::Configuration(
                "profile id must not be empty".to_owned(),
            ));
        }
        let mut table = self.write()?;
        if table.position(&profile.id).is_some() {
            return Err(ConductorError::Configuration(format!(
                "profile '{}' is already registered",
                profile.id
            )));
        }
        let profile_id = profile.id.clone();
        table.profiles.push(ProfileEntry::from_new(profile));
        if table.active.is_none() {
            table.activate(&profile_id, OffsetDateTime::now_utc())?;
        }
        let active = table.is_active(&profile_id);
        tracing::info!(profile_id = %profile_id, active, "profile registered");
        Ok(table.entry(&profile_id)?.snapshot(active))
    }

    /// Removes a profile and returns the active profile afterwards.
    ///
    /// Removing the active profile promotes the best eligible replacement.
    /// When none is eligible and sessions still run under the profile the
    /// removal is refused with [`ConductorError::ProfileInUse`]; with no
    /// bound sessions any remaining profile is promoted.
    pub fn remove(
        &self,
        profile_id: &ProfileId,
        policy: &AutoSwitchPolicy,
        sessions_bound: usize,
    ) -> ConductorResult<Option<ProfileId>> {
        let mut table = self.write()?;
        let position = table
            .position(profile_id)
            .ok_or_else(|| ConductorError::UnknownProfile(profile_id.clone()))?;

        if table.is_active(profile_id) {
            let replacement = match table.best_available(policy) {
                Some(replacement) => Some(replacement),
                None if sessions_bound > 0 => {
                    return Err(ConductorError::ProfileInUse(profile_id.clone()));
                }
                None => table
                    .profiles
                    .iter()
                    .find(|profile| &profile.id != profile_id)
                    .map(|profile| profile.id.clone()),
            };
            table.profiles.remove(position);
            table.active = None;
            if let Some(replacement) = replacement.as_ref() {
                table.activate(replacement, OffsetDateTime::now_utc())?;
            }
        } else {
            table.profiles.remove(position);
        }

        tracing::info!(
            profile_id = %profile_id,
            active = ?table.active,
            "profile removed"
        );
        Ok(table.active.clone())
    }

    /// Makes `profile_id` the single active profile. The change is visible
    /// to every reader once this returns.
    pub fn set_active(&self, profile_id: &ProfileId) -> ConductorResult<()> {
        let mut table = self.write()?;
        let previous = table.active.clone();
        table.activate(profile_id, OffsetDateTime::now_utc())?;
        tracing::info!(
            profile_id = %profile_id,
            previous = ?previous,
            "active profile changed"
        );
        Ok(())
    }

    pub fn active_id(&self) -> ConductorResult<Option<ProfileId>> {
        Ok(self.read()?.active.clone())
    }

    pub fn active(&self) -> ConductorResult<Option<ProfileSnapshot>> {
        let table = self.read()?;
        let Some(active) = table.active.as_ref() else {
            return Ok(None);
        };
        Ok(Some(table.entry(active)?.snapshot(true)))
    }

    pub fn list(&self) -> ConductorResult<Vec<ProfileSnapshot>> {
        let table = self.read()?;
        Ok(table
            .profiles
            .iter()
            .map(|profile| profile.snapshot(table.is_active(&profile.id)))
            .collect())
    }

    pub fn get(&self, profile_id: &ProfileId) -> ConductorResult<ProfileSnapshot> {
        let table = self.read()?;
        Ok(table
            .entry(profile_id)?
            .snapshot(table.is_active(profile_id)))
    }

    /// Best non-active profile under both thresholds, if any.
    pub fn best_available(&self, policy: &AutoSwitchPolicy) -> ConductorResult<Option<ProfileId>> {
        Ok(self.read()?.best_available(policy))
    }

    pub fn record_usage(
        &self,
        profile_id: &ProfileId,
        session_percent: f64,
        weekly_percent: f64,
        fetched_at: OffsetDateTime,
    ) -> ConductorResult<()> {
        let mut table = self.write()?;
        table.entry_mut(profile_id)?.usage = Some(UsageSnapshot::new(
            session_percent,
            weekly_percent,
            fetched_at,
        ));
        Ok(())
    }

    /// Records that the profile hit its quota of `kind`.
    pub fn mark_exhausted(&self, profile_id: &ProfileId, kind: RateLimitKind) -> ConductorResult<()> {
        let mut table = self.write()?;
        let entry = table.entry_mut(profile_id)?;
        let (session, weekly) = entry.usage_or_zero();
        let (session, weekly) = match kind {
            RateLimitKind::SessionWindow => (100.0, weekly),
            RateLimitKind::Weekly => (session, 100.0),
        };
        entry.usage = Some(UsageSnapshot::new(session, weekly, OffsetDateTime::now_utc()));
        tracing::info!(profile_id = %profile_id, kind = ?kind, "profile marked exhausted");
        Ok(())
    }

    pub fn update_credential(
        &self,
        profile_id: &ProfileId,
        credential: CredentialMaterial,
    ) -> ConductorResult<()> {
        if credential.is_empty() {
            return Err(ConductorError::Configuration(
                "credential must not be empty".to_owned(),
            ));
        }
        let mut table = self.write()?;
        let entry = table.entry_mut(profile_id)?;
        tracing::info!(
            profile_id = %profile_id,
            credential = %credential,
            "profile credential updated"
        );
        entry.credential = credential;
        Ok(())
    }

    /// Environment a process needs to run under `profile_id`.
    pub fn spawn_environment(&self, profile_id: &ProfileId) -> ConductorResult<Vec<(String, String)>> {
        let table = self.read()?;
        let entry = table.entry(profile_id)?;
        let mut environment = Vec::with_capacity(2);
        if !entry.credential.is_empty() {
            environment.push((
                self.credential_env_var.clone(),
                entry.credential.expose().to_owned(),
            ));
        }
        if let Some(config_dir) = entry.config_dir.as_ref() {
            environment.push((
                CONFIG_DIR_ENV_VAR.to_owned(),
                config_dir.to_string_lossy().into_owned(),
            ));
        }
        Ok(environment)
    }

    fn read(&self) -> ConductorResult<RwLockReadGuard<'_, ProfileTable>> {
        self.table
            .read()
            .map_err(|_| ConductorError::Internal("profile registry lock poisoned".to_owned()))
    }

    fn write(&self) -> ConductorResult<RwLockWriteGuard<'_, ProfileTable>> {
        self.table
            .write()
            .map_err(|_| ConductorError::Internal("profile registry lock poisoned".to_owned()))
    }
}

impl CredentialSource for ProfileRegistry {
    fn active_profile(&self) -> Option<ProfileId> {
        self.active_id().ok().flatten()
    }

    fn spawn_environment(&self, profile_id: &ProfileId) -> ConductorResult<Vec<(String, String)>> {
        ProfileRegistry::spawn_environment(self, profile_id)
    }
}

#[cfg(test)]
mod tests {
    use conductor_protocol::credential::{CredentialMaterial, CredentialSource};
    use conductor_protocol::error::ConductorError;
    use conductor_protocol::event::RateLimitKind;
    use conductor_protocol::ids::ProfileId;
    use time::OffsetDateTime;

    use super::{CONFIG_DIR_ENV_VAR, DEFAULT_CREDENTIAL_ENV_VAR, ProfileRegistry};
    use crate::policy::AutoSwitchPolicy;
    use crate::profile::NewProfile;

    fn registry_with(ids: &[&str]) -> ProfileRegistry {
        let registry = ProfileRegistry::default();
        for id in ids {
            registry
                .register(NewProfile::new(*id, id.to_uppercase()).credential(format!("token-{id}")))
                .expect("register profile");
        }
        registry
    }

    fn id(value: &str) -> ProfileId {
        ProfileId::new(value)
    }

    #[test]
    fn first_registered_profile_becomes_active() {
        let registry = registry_with(&["work", "personal"]);

        assert_eq!(registry.active_id().expect("active"), Some(id("work")));
        let listed = registry.list().expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed[0].active);
        assert!(!listed[1].active);
        assert!(listed[0].last_activated_at.is_some());
        assert!(listed[1].last_activated_at.is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry_with(&["work"]);

        let error = registry
            .register(NewProfile::new("work", "Again"))
            .expect_err("duplicate id");

        assert!(matches!(error, ConductorError::Configuration(_)));
        assert_eq!(registry.list().expect("list").len(), 1);
    }

    #[test]
    fn set_active_unknown_profile_keeps_the_current_one() {
        let registry = registry_with(&["work"]);

        assert_eq!(
            registry.set_active(&id("ghost")),
            Err(ConductorError::UnknownProfile(id("ghost")))
        );
        assert_eq!(registry.active_id().expect("active"), Some(id("work")));
    }

    #[test]
    fn best_available_prefers_lowest_combined_usage_under_thresholds() {
        let registry = registry_with(&["work", "a", "b", "c"]);
        let now = OffsetDateTime::now_utc();
        registry.record_usage(&id("a"), 40.0, 30.0, now).expect("usage");
        registry.record_usage(&id("b"), 10.0, 20.0, now).expect("usage");
        registry.record_usage(&id("c"), 96.0, 0.0, now).expect("usage");

        let best = registry
            .best_available(&AutoSwitchPolicy::default())
            .expect("best");

        assert_eq!(best, Some(id("b")));
    }

    #[test]
    fn best_available_breaks_ties_by_least_recent_activation() {
        let registry = registry_with(&["work", "a", "b"]);
        registry.set_active(&id("a")).expect("activate a");
        registry.set_active(&id("work")).expect("back to work");

        let best = registry
            .best_available(&AutoSwitchPolicy::default())
            .expect("best");

        assert_eq!(best, Some(id("b")), "never-activated profile wins the tie");
    }

    #[test]
    fn best_available_never_returns_the_active_profile() {
        let registry = registry_with(&["work"]);
        assert_eq!(
            registry.best_available(&AutoSwitchPolicy::default()).expect("best"),
            None
        );

        let registry = registry_with(&["work", "personal"]);
        registry
            .record_usage(&id("personal"), 99.0, 99.0, OffsetDateTime::now_utc())
            .expect("usage");
        assert_eq!(
            registry.best_available(&AutoSwitchPolicy::default()).expect("best"),
            None
        );
    }

    #[test]
    fn mark_exhausted_saturates_only_the_matching_quota() {
        let registry = registry_with(&["work"]);
        registry
            .record_usage(&id("work"), 12.0, 34.0, OffsetDateTime::now_utc())
            .expect("usage");

        registry
            .mark_exhausted(&id("work"), RateLimitKind::Weekly)
            .expect("mark");

        let usage = registry.get(&id("work")).expect("get").usage.expect("usage");
        assert_eq!(usage.session_percent, 12.0);
        assert_eq!(usage.weekly_percent, 100.0);
    }

    #[test]
    fn removing_the_active_profile_promotes_the_best_replacement() {
        let registry = registry_with(&["work", "a", "b"]);
        registry
            .record_usage(&id("a"), 50.0, 50.0, OffsetDateTime::now_utc())
            .expect("usage");

        let active = registry
            .remove(&id("work"), &AutoSwitchPolicy::default(), 2)
            .expect("remove");

        assert_eq!(active, Some(id("b")));
        assert!(registry.get(&id("work")).is_err());
    }

    #[test]
    fn removing_the_active_profile_without_replacement_while_in_use_fails() {
        let registry = registry_with(&["work", "a"]);
        registry
            .record_usage(&id("a"), 100.0, 0.0, OffsetDateTime::now_utc())
            .expect("usage");

        assert_eq!(
            registry.remove(&id("work"), &AutoSwitchPolicy::default(), 1),
            Err(ConductorError::ProfileInUse(id("work")))
        );
        assert_eq!(registry.active_id().expect("active"), Some(id("work")));

        let active = registry
            .remove(&id("work"), &AutoSwitchPolicy::default(), 0)
            .expect("remove idle profile");
        assert_eq!(active, Some(id("a")));
    }

    #[test]
    fn removing_the_last_profile_leaves_none_active() {
        let registry = registry_with(&["work"]);

        let active = registry
            .remove(&id("work"), &AutoSwitchPolicy::default(), 0)
            .expect("remove");

        assert_eq!(active, None);
        assert_eq!(registry.active_profile(), None);
    }

    #[test]
    fn spawn_environment_injects_token_and_config_dir() {
        let registry = ProfileRegistry::new("CUSTOM_TOKEN");
        registry
            .register(
                NewProfile::new("work", "Work")
                    .credential("secret-work")
                    .config_dir("/tmp/work-config"),
            )
            .expect("register");

        let environment = registry.spawn_environment(&id("work")).expect("env");

        assert_eq!(
            environment,
            vec![
                ("CUSTOM_TOKEN".to_owned(), "secret-work".to_owned()),
                (CONFIG_DIR_ENV_VAR.to_owned(), "/tmp/work-config".to_owned()),
            ]
        );
        assert_eq!(ProfileRegistry::new("  ").credential_env_var(), DEFAULT_CREDENTIAL_ENV_VAR);
    }

    #[test]
    fn update_credential_replaces_the_spawn_token() {
        let registry = registry_with(&["work"]);

        registry
            .update_credential(&id("work"), CredentialMaterial::new("fresh-token-1234"))
            .expect("update");
        assert!(registry
            .update_credential(&id("work"), CredentialMaterial::new(" "))
            .is_err());

        let environment = registry.spawn_environment(&id("work")).expect("env");
        assert_eq!(
            environment[0],
            (
                DEFAULT_CREDENTIAL_ENV_VAR.to_owned(),
                "fresh-token-1234".to_owned()
            )
        );
    }
}
