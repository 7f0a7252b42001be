//! Rate-limit detection and credential failover.
//!
//! Two producers feed rate-limit events into the [`RateLimitMonitor`]: the
//! session output it watches on the event bus and the [`UsagePoller`]. The
//! monitor deduplicates them and hands each surviving event to the
//! [`AutoSwitchController`], which switches the active profile and retries the
//! affected sessions.

pub mod controller;
pub mod detect;
pub mod monitor;
pub mod poller;

pub use controller::AutoSwitchController;
pub use detect::{Detection, RateLimitDetector};
pub use monitor::{DEFAULT_DEDUP_WINDOW, RateLimitMonitor, RateLimitMonitorConfig};
pub use poller::{UsageFetcher, UsagePollReport, UsagePoller, UsageReading, breached_kind};
