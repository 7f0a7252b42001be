pub mod bus;
pub mod envelope;
pub mod subscription;

pub use bus::EventBus;
pub use envelope::EventEnvelope;
pub use subscription::{EventSubscription, SubscriptionCancel};
