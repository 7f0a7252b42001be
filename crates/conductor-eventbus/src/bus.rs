use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use conductor_protocol::event::ConductorEvent;
use conductor_protocol::ids::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::EventEnvelope;
use crate::subscription::EventSubscription;

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::UnboundedSender<EventEnvelope>,
    token: CancellationToken,
}

impl Subscriber {
    fn deliver(&self, envelope: &EventEnvelope) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.sender.send(envelope.clone()).is_ok()
    }
}

#[derive(Debug, Default)]
struct BusState {
    next_sequence: u64,
    session_subscribers: HashMap<SessionId, Vec<Subscriber>>,
    global_subscribers: Vec<Subscriber>,
}

/// Ordered fan-out of conductor events.
///
/// Sequence numbers are allocated and delivered under one lock, so every
/// subscriber observes events in the same relative order. Each subscriber owns
/// an unbounded queue: a slow reader never loses output, it only lags.
#[derive(Debug)]
pub struct EventBus {
    boot_instant: Instant,
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            boot_instant: Instant::now(),
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn subscribe_session(&self, session_id: SessionId) -> EventSubscription {
        let (subscriber, subscription) = new_subscriber();
        self.lock_state()
            .session_subscribers
            .entry(session_id)
            .or_default()
            .push(subscriber);
        subscription
    }

    pub fn subscribe_all(&self) -> EventSubscription {
        let (subscriber, subscription) = new_subscriber();
        self.lock_state().global_subscribers.push(subscriber);
        subscription
    }

    /// Drops every subscriber of `session_id`. Their streams end after the
    /// events already queued.
    pub fn remove_session(&self, session_id: &SessionId) -> bool {
        self.lock_state()
            .session_subscribers
            .remove(session_id)
            .is_some()
    }

    pub fn publish(&self, session_id: SessionId, event: ConductorEvent) -> EventEnvelope {
        self.publish_envelope(Some(session_id), event)
    }

    /// Events that are not tied to one session reach only global subscribers.
    pub fn publish_global(&self, event: ConductorEvent) -> EventEnvelope {
        self.publish_envelope(None, event)
    }

    pub fn session_subscriber_count(&self, session_id: &SessionId) -> usize {
        let mut state = self.lock_state();
        let Some(subscribers) = state.session_subscribers.get_mut(session_id) else {
            return 0;
        };
        subscribers.retain(|subscriber| !subscriber.token.is_cancelled());
        subscribers.len()
    }

    pub fn global_subscriber_count(&self) -> usize {
        let mut state = self.lock_state();
        state
            .global_subscribers
            .retain(|subscriber| !subscriber.token.is_cancelled());
        state.global_subscribers.len()
    }

    fn publish_envelope(&self, session_id: Option<SessionId>, event: ConductorEvent) -> EventEnvelope {
        let mut state = self.lock_state();
        state.next_sequence = state.next_sequence.saturating_add(1);
        let envelope = EventEnvelope {
            session_id,
            sequence: state.next_sequence,
            received_at_monotonic_nanos: self.monotonic_nanos_since_bus_bootstrap(),
            event,
        };

        if let Some(session_id) = envelope.session_id.as_ref() {
            let mut emptied = false;
            if let Some(subscribers) = state.session_subscribers.get_mut(session_id) {
                subscribers.retain(|subscriber| subscriber.deliver(&envelope));
                emptied = subscribers.is_empty();
            }
            if emptied {
                state.session_subscribers.remove(session_id);
            }
        }
        let before = state.global_subscribers.len();
        state
            .global_subscribers
            .retain(|subscriber| subscriber.deliver(&envelope));
        let dropped = before - state.global_subscribers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned closed global event subscribers");
        }

        envelope
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monotonic_nanos_since_bus_bootstrap(&self) -> u64 {
        let nanos = self.boot_instant.elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

fn new_subscriber() -> (Subscriber, EventSubscription) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    (
        Subscriber {
            sender,
            token: token.clone(),
        },
        EventSubscription::new(receiver, token),
    )
}
