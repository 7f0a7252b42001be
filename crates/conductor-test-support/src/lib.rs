//! Test doubles shared by the conductor crates.

mod credentials;
mod env;
mod fake_backend;

pub use credentials::{FAKE_TOKEN_ENV, FakeCredentials};
pub use env::{with_env_var, with_env_vars};
pub use fake_backend::{FakeBackend, FakeProcess, KILLED_EXIT_CODE, TERMINATED_EXIT_CODE};
