//! PTY-backed [`SpawnBackend`](conductor_protocol::backend::SpawnBackend).

mod backend;
mod coalescer;
mod policy;
mod process;

pub use backend::PtyBackend;
pub use policy::PtyOutputPolicy;
