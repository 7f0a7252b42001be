//! Live session management: the session registry, per-session output
//! multiplexing and bounded scrollback.

pub mod multiplexer;
pub mod perf;
pub mod registry;
pub mod scrollback;
pub mod sink;
mod table;
pub mod title;

pub use multiplexer::OutputMultiplexer;
pub use perf::SessionRegistryPerfSnapshot;
pub use registry::{
    CreateOptions, DEFAULT_DESTROY_GRACE_PERIOD, DEFAULT_KILL_CONFIRM_TIMEOUT, SessionHandle,
    SessionRegistry, SessionRegistryConfig,
};
pub use scrollback::{Scrollback, ScrollbackLimits};
pub use sink::SessionSnapshotSink;
