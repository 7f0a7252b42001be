use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::EventEnvelope;

/// Detached cancel handle. Cancelling more than once is a no-op.
#[derive(Debug, Clone)]
pub struct SubscriptionCancel {
    token: CancellationToken,
}

impl SubscriptionCancel {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    token: CancellationToken,
}

impl EventSubscription {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<EventEnvelope>,
        token: CancellationToken,
    ) -> Self {
        Self { receiver, token }
    }

    /// Next event in publication order, or `None` once cancelled or closed.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            envelope = self.receiver.recv() => envelope,
        }
    }

    pub fn try_next_event(&mut self) -> Option<EventEnvelope> {
        if self.token.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_handle(&self) -> SubscriptionCancel {
        SubscriptionCancel::new(self.token.clone())
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
