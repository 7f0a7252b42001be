use std::sync::atomic::{AtomicU64, Ordering};

use conductor_protocol::session::SessionState;

use crate::table::SessionStateSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionRegistryPerfSnapshot {
    pub session_count: usize,
    pub created_sessions: usize,
    pub running_sessions: usize,
    pub exited_sessions: usize,
    pub killed_sessions: usize,
    pub errored_sessions: usize,
    pub active_stream_ingestion_tasks: usize,
    pub create_requests_total: u64,
    pub create_success_total: u64,
    pub create_failures_total: u64,
    pub destroy_requests_total: u64,
    pub forced_finalizations_total: u64,
    pub retry_requests_total: u64,
    pub retry_collapsed_total: u64,
    pub send_input_requests_total: u64,
    pub resize_requests_total: u64,
    pub output_chunks_total: u64,
    pub stream_errors_total: u64,
    pub snapshot_write_failures_total: u64,
    pub scrollback_released_total: u64,
    pub terminal_transitions_exited_total: u64,
    pub terminal_transitions_killed_total: u64,
    pub terminal_transitions_errored_total: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SessionRegistryPerfCounters {
    pub(crate) create_requests_total: AtomicU64,
    pub(crate) create_success_total: AtomicU64,
    pub(crate) create_failures_total: AtomicU64,
    pub(crate) destroy_requests_total: AtomicU64,
    pub(crate) forced_finalizations_total: AtomicU64,
    pub(crate) retry_requests_total: AtomicU64,
    pub(crate) retry_collapsed_total: AtomicU64,
    pub(crate) send_input_requests_total: AtomicU64,
    pub(crate) resize_requests_total: AtomicU64,
    pub(crate) output_chunks_total: AtomicU64,
    pub(crate) stream_errors_total: AtomicU64,
    pub(crate) snapshot_write_failures_total: AtomicU64,
    pub(crate) scrollback_released_total: AtomicU64,
    terminal_transitions_exited_total: AtomicU64,
    terminal_transitions_killed_total: AtomicU64,
    terminal_transitions_errored_total: AtomicU64,
}

impl SessionRegistryPerfCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_terminal_transition(&self, state: SessionState) {
        match state {
            SessionState::Exited => Self::incr(&self.terminal_transitions_exited_total),
            SessionState::Killed => Self::incr(&self.terminal_transitions_killed_total),
            SessionState::Errored => Self::incr(&self.terminal_transitions_errored_total),
            SessionState::Created | SessionState::Running => {}
        }
    }

    pub(crate) fn snapshot(
        &self,
        state: SessionStateSummary,
        active_stream_ingestion_tasks: usize,
    ) -> SessionRegistryPerfSnapshot {
        SessionRegistryPerfSnapshot {
            session_count: state.session_count,
            created_sessions: state.created_sessions,
            running_sessions: state.running_sessions,
            exited_sessions: state.exited_sessions,
            killed_sessions: state.killed_sessions,
            errored_sessions: state.errored_sessions,
            active_stream_ingestion_tasks,
            create_requests_total: self.create_requests_total.load(Ordering::Relaxed),
            create_success_total: self.create_success_total.load(Ordering::Relaxed),
            create_failures_total: self.create_failures_total.load(Ordering::Relaxed),
            destroy_requests_total: self.destroy_requests_total.load(Ordering::Relaxed),
            forced_finalizations_total: self.forced_finalizations_total.load(Ordering::Relaxed),
            retry_requests_total: self.retry_requests_total.load(Ordering::Relaxed),
            retry_collapsed_total: self.retry_collapsed_total.load(Ordering::Relaxed),
            send_input_requests_total: self.send_input_requests_total.load(Ordering::Relaxed),
            resize_requests_total: self.resize_requests_total.load(Ordering::Relaxed),
            output_chunks_total: self.output_chunks_total.load(Ordering::Relaxed),
            stream_errors_total: self.stream_errors_total.load(Ordering::Relaxed),
            snapshot_write_failures_total: self
                .snapshot_write_failures_total
                .load(Ordering::Relaxed),
            scrollback_released_total: self.scrollback_released_total.load(Ordering::Relaxed),
            terminal_transitions_exited_total: self
                .terminal_transitions_exited_total
                .load(Ordering::Relaxed),
            terminal_transitions_killed_total: self
                .terminal_transitions_killed_total
                .load(Ordering::Relaxed),
            terminal_transitions_errored_total: self
                .terminal_transitions_errored_total
                .load(Ordering::Relaxed),
        }
    }
}
