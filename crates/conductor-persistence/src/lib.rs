//! Date-partitioned session snapshots in SQLite and the restore path that
//! turns them back into live sessions.

mod codec;
pub mod persistence;
pub mod store;

pub use persistence::{
    RestoreFailure, RestoreReport, RestoredSession, SessionPersistence, SharedSnapshotStore,
    StoreSnapshotSink,
};
pub use store::{DEFAULT_MAX_SNAPSHOT_SCROLLBACK_BYTES, SnapshotStore, SqliteSnapshotStore};
