use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conductor_eventbus::{EventBus, EventSubscription};
use conductor_protocol::event::ConductorEvent;
use conductor_protocol::ids::SessionId;
use time::OffsetDateTime;

use crate::scrollback::{Scrollback, ScrollbackLimits};
use crate::title::TitleDetector;

#[derive(Debug)]
struct MultiplexState {
    scrollback: Scrollback,
    titles: TitleDetector,
    title: Option<String>,
    last_activity_at: OffsetDateTime,
}

/// Scrollback and fan-out for one session's output.
///
/// Appending to scrollback and publishing happen under the same lock, so a
/// subscriber taken together with a scrollback copy sees every later chunk
/// exactly once.
#[derive(Debug)]
pub struct OutputMultiplexer {
    session_id: SessionId,
    eventbus: Arc<EventBus>,
    state: Mutex<MultiplexState>,
}

impl OutputMultiplexer {
    pub fn new(
        session_id: SessionId,
        eventbus: Arc<EventBus>,
        limits: ScrollbackLimits,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            session_id,
            eventbus,
            state: Mutex::new(MultiplexState {
                scrollback: Scrollback::new(limits),
                titles: TitleDetector::default(),
                title: None,
                last_activity_at: created_at,
            }),
        }
    }

    /// Prefills history, e.g. from a restored snapshot. Nothing is published.
    pub fn seed(&self, bytes: &[u8]) {
        self.lock_state().scrollback.append(bytes);
    }

    pub fn ingest(&self, chunk: Vec<u8>) {
        let mut state = self.lock_state();
        state.scrollback.append(&chunk);
        state.last_activity_at = OffsetDateTime::now_utc();
        let detected_title = state.titles.feed(&chunk);
        self.eventbus
            .publish(self.session_id.clone(), ConductorEvent::Output(chunk));

        if let Some(title) = detected_title {
            if state.title.as_deref() != Some(title.as_str()) {
                state.title = Some(title.clone());
                self.eventbus
                    .publish(self.session_id.clone(), ConductorEvent::TitleChanged(title));
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let _state = self.lock_state();
        self.eventbus.subscribe_session(self.session_id.clone())
    }

    pub fn subscribe_with_scrollback(&self) -> (Vec<u8>, EventSubscription) {
        let state = self.lock_state();
        let scrollback = state.scrollback.to_vec();
        let subscription = self.eventbus.subscribe_session(self.session_id.clone());
        (scrollback, subscription)
    }

    pub fn scrollback(&self) -> Vec<u8> {
        self.lock_state().scrollback.to_vec()
    }

    pub fn title(&self) -> Option<String> {
        self.lock_state().title.clone()
    }

    pub fn last_activity_at(&self) -> OffsetDateTime {
        self.lock_state().last_activity_at
    }

    pub fn touch(&self) {
        self.lock_state().last_activity_at = OffsetDateTime::now_utc();
    }

    /// Frees the scrollback once the persistence store owns it. The title
    /// and activity timestamp are kept.
    pub fn release(&self) {
        let mut state = self.lock_state();
        state.scrollback.clear();
        state.titles = TitleDetector::default();
    }

    fn lock_state(&self) -> MutexGuard<'_, MultiplexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
