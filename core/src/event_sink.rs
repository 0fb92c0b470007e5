use tracing::debug;

use crate::protocol::Event;

/// Receives turn events. `send` must never block the turn.
pub trait EventSink: Send + Sync {
    fn send(&self, event: Event);
}

/// Drops the event when the channel is full or closed.
impl EventSink for async_channel::Sender<Event> {
    fn send(&self, event: Event) {
        if let Err(e) = self.try_send(event) {
            debug!("dropping event: {e}");
        }
    }
}
