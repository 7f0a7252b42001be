//! Shared types for the conductor crates.
//!
//! Everything that crosses a crate boundary lives here: identifiers, the error
//! enum, session and event payloads, and the traits that the registry uses to
//! reach a process backend or a credential source.

pub mod backend;
pub mod credential;
pub mod error;
pub mod event;
pub mod ids;
pub mod session;
