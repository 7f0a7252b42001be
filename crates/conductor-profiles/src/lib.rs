//! Credential profiles: registration, the single active profile, usage
//! snapshots and replacement selection under an [`AutoSwitchPolicy`].

pub mod policy;
pub mod profile;
pub mod registry;

pub use policy::AutoSwitchPolicy;
pub use profile::{NewProfile, ProfileSnapshot, UsageSnapshot};
pub use registry::{CONFIG_DIR_ENV_VAR, DEFAULT_CREDENTIAL_ENV_VAR, ProfileRegistry};
