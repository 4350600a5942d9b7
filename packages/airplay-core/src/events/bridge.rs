//! Fan-out of engine events to broadcast subscribers.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{BridgeEvent, BroadcastEvent, PairingEvent, SessionEvent, SpeakerEvent};

/// [`EventEmitter`] that republishes every event on a tokio broadcast channel.
///
/// A secondary emitter can be attached later (bootstrap attaches the logging
/// one); it sees each event before broadcast subscribers do.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
    tap: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// A zero capacity is bumped to one; broadcast channels reject zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            tap: Arc::new(RwLock::new(None)),
        }
    }

    /// Replaces the secondary emitter.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.tap.write() = Some(emitter);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    fn tap(&self) -> Option<Arc<dyn EventEmitter>> {
        self.tap.read().clone()
    }

    fn publish(&self, event: BroadcastEvent) {
        // Lagging or absent subscribers are not an engine concern.
        if self.tx.send(event).is_err() {
            log::trace!("[EventBridge] Event dropped, nobody subscribed");
        }
    }
}

/// One [`EventEmitter`] method: hand a copy to the tap, then broadcast.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(tap) = self.tap() {
                tap.$method(event.clone());
            }
            self.publish(BroadcastEvent::$variant(event));
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_speaker, SpeakerEvent, Speaker);
    impl_emit!(emit_session, SessionEvent, Session);
    impl_emit!(emit_pairing, PairingEvent, Pairing);
    impl_emit!(emit_bridge, BridgeEvent, Bridge);
}
