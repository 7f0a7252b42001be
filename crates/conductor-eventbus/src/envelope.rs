use conductor_protocol::event::ConductorEvent;
use conductor_protocol::ids::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// `None` for events that are not about a single session.
    pub session_id: Option<SessionId>,
    pub sequence: u64,
    pub received_at_monotonic_nanos: u64,
    pub event: ConductorEvent,
}
