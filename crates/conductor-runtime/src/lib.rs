//! Composition root: wires the process backend, profiles, sessions, failover
//! and persistence into one [`Conductor`].

mod autosave;
pub mod conductor;
pub mod settings;

pub use conductor::{Conductor, ShutdownReport};
pub use settings::{ConductorSettings, DatabaseLocation};
