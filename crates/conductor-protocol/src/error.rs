use thiserror::Error;

use crate::ids::{ProfileId, SessionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConductorError {
    #[error("session process could not be started: {0}")]
    Spawn(String),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("unknown profile: {0}")]
    UnknownProfile(ProfileId),
    #[error("profile {0} is active and still bound to running sessions")]
    ProfileInUse(ProfileId),
    #[error("session {0} was destroyed")]
    SessionDestroyed(SessionId),
    #[error("no eligible profile is available")]
    NoProfileAvailable,
    #[error("session snapshot could not be written: {0}")]
    PersistenceWrite(String),
    #[error("session persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ConductorResult<T> = Result<T, ConductorError>;
