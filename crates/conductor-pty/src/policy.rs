use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_OUTPUT_COALESCE_WINDOW_MS: u64 = 16;
pub(crate) const DEFAULT_OUTPUT_COALESCE_MAX_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_EXIT_DRAIN_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyOutputPolicy {
    /// Zero forwards every read as its own chunk.
    pub output_coalesce_window_ms: u64,
    pub output_coalesce_max_bytes: usize,
    /// How long output is still collected after the child has exited.
    pub exit_drain_ms: u64,
}

impl Default for PtyOutputPolicy {
    fn default() -> Self {
        Self {
            output_coalesce_window_ms: DEFAULT_OUTPUT_COALESCE_WINDOW_MS,
            output_coalesce_max_bytes: DEFAULT_OUTPUT_COALESCE_MAX_BYTES,
            exit_drain_ms: DEFAULT_EXIT_DRAIN_MS,
        }
    }
}

impl PtyOutputPolicy {
    pub(crate) fn normalized(self) -> Self {
        Self {
            output_coalesce_window_ms: self.output_coalesce_window_ms,
            output_coalesce_max_bytes: self.output_coalesce_max_bytes.max(1),
            exit_drain_ms: self.exit_drain_ms,
        }
    }

    pub(crate) fn output_coalesce_window(self) -> Option<Duration> {
        if self.output_coalesce_window_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.output_coalesce_window_ms))
        }
    }

    pub(crate) fn exit_drain(self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::PtyOutputPolicy;

    #[test]
    fn normalized_policy_keeps_a_positive_byte_cap() {
        let policy = PtyOutputPolicy {
            output_coalesce_window_ms: 0,
            output_coalesce_max_bytes: 0,
            exit_drain_ms: 0,
        }
        .normalized();

        assert_eq!(policy.output_coalesce_max_bytes, 1);
        assert!(policy.output_coalesce_window().is_none());
    }
}
