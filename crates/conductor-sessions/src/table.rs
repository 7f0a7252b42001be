use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use conductor_protocol::backend::ProcessHandle;
use conductor_protocol::ids::{ProfileId, ProjectId, SessionId};
use conductor_protocol::session::{
    SessionCommand, SessionDate, SessionInfo, SessionSnapshot, SessionState,
};
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};

use crate::multiplexer::OutputMultiplexer;

#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) session_id: SessionId,
    pub(crate) project_id: ProjectId,
    pub(crate) date: SessionDate,
    pub(crate) created_at: OffsetDateTime,
    pub(crate) command: SessionCommand,
    pub(crate) state: SessionState,
    pub(crate) profile_id: Option<ProfileId>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) error: Option<String>,
    pub(crate) retried_from: Option<SessionId>,
    pub(crate) restored_from: Option<SessionId>,
}

/// Per-session coordination shared by destroy and retry.
#[derive(Clone, Default)]
pub(crate) struct SessionControl {
    pub(crate) op_lock: Arc<Mutex<()>>,
    /// Set by destroy and retry; the next terminal state is `Killed`.
    pub(crate) terminate_requested: Arc<AtomicBool>,
    pub(crate) destroyed: Arc<AtomicBool>,
}

pub(crate) struct SessionEntry {
    pub(crate) record: SessionRecord,
    pub(crate) handle: Option<Arc<dyn ProcessHandle>>,
    pub(crate) multiplexer: Arc<OutputMultiplexer>,
    pub(crate) control: SessionControl,
    pub(crate) exit_tx: watch::Sender<bool>,
    pub(crate) retried_into: Option<SessionId>,
}

impl SessionEntry {
    pub(crate) fn new(
        record: SessionRecord,
        multiplexer: Arc<OutputMultiplexer>,
        control: SessionControl,
    ) -> Self {
        let (exit_tx, _exit_rx) = watch::channel(false);
        Self {
            record,
            handle: None,
            multiplexer,
            control,
            exit_tx,
            retried_into: None,
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        let record = &self.record;
        SessionInfo {
            session_id: record.session_id.clone(),
            project_id: record.project_id.clone(),
            date: record.date,
            created_at: record.created_at,
            last_activity_at: self.multiplexer.last_activity_at(),
            command: record.command.clone(),
            state: record.state,
            title: self.multiplexer.title(),
            profile_id: record.profile_id.clone(),
            exit_code: record.exit_code,
            error: record.error.clone(),
            retried_from: record.retried_from.clone(),
            restored_from: record.restored_from.clone(),
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let record = &self.record;
        SessionSnapshot {
            session_id: record.session_id.clone(),
            project_id: record.project_id.clone(),
            date: record.date,
            created_at: record.created_at,
            title: self.multiplexer.title(),
            command: record.command.clone(),
            profile_id: record.profile_id.clone(),
            state: record.state,
            exit_code: record.exit_code,
            scrollback: self.multiplexer.scrollback(),
            retried_from: record.retried_from.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SessionStateSummary {
    pub(crate) session_count: usize,
    pub(crate) created_sessions: usize,
    pub(crate) running_sessions: usize,
    pub(crate) exited_sessions: usize,
    pub(crate) killed_sessions: usize,
    pub(crate) errored_sessions: usize,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: HashMap<SessionId, SessionEntry>,
    partitions: HashMap<(ProjectId, SessionDate), Vec<SessionId>>,
}

impl SessionTable {
    pub(crate) fn insert(&mut self, entry: SessionEntry) -> bool {
        let session_id = entry.record.session_id.clone();
        let partition = (entry.record.project_id.clone(), entry.record.date);
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                self.partitions.entry(partition).or_default().push(session_id);
                true
            }
        }
    }

    pub(crate) fn get(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub(crate) fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    /// Entries of one project and date in creation order.
    pub(crate) fn partition(&self, project_id: &ProjectId, date: SessionDate) -> Vec<&SessionEntry> {
        let Some(ids) = self.partitions.get(&(project_id.clone(), date)) else {
            return Vec::new();
        };
        let mut entries: Vec<&SessionEntry> =
            ids.iter().filter_map(|id| self.sessions.get(id)).collect();
        entries.sort_by_key(|entry| entry.record.created_at);
        entries
    }

    pub(crate) fn all(&self) -> Vec<&SessionEntry> {
        let mut entries: Vec<&SessionEntry> = self.sessions.values().collect();
        entries.sort_by(|left, right| {
            left.record
                .created_at
                .cmp(&right.record.created_at)
                .then_with(|| left.record.session_id.cmp(&right.record.session_id))
        });
        entries
    }

    pub(crate) fn running_for_profile(&self, profile_id: &ProfileId) -> Vec<SessionId> {
        self.all()
            .into_iter()
            .filter(|entry| {
                entry.record.state == SessionState::Running
                    && entry.record.profile_id.as_ref() == Some(profile_id)
            })
            .map(|entry| entry.record.session_id.clone())
            .collect()
    }

    pub(crate) fn running_ids(&self) -> Vec<SessionId> {
        self.all()
            .into_iter()
            .filter(|entry| !entry.record.state.is_terminal())
            .map(|entry| entry.record.session_id.clone())
            .collect()
    }

    pub(crate) fn summary(&self) -> SessionStateSummary {
        let mut summary = SessionStateSummary {
            session_count: self.sessions.len(),
            ..SessionStateSummary::default()
        };
        for entry in self.sessions.values() {
            match entry.record.state {
                SessionState::Created => summary.created_sessions += 1,
                SessionState::Running => summary.running_sessions += 1,
                SessionState::Exited => summary.exited_sessions += 1,
                SessionState::Killed => summary.killed_sessions += 1,
                SessionState::Errored => summary.errored_sessions += 1,
            }
        }
        summary
    }
}
