//! Wallet event bus.
//!
//! Hosts subscribe to observe the pipeline; events are best-effort (a full
//! or absent subscriber never blocks the emitting path).

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{MemoryId, UserAddress};

/// Events emitted by the memory plane.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// A memory completed ingestion.
    MemoryCreated {
        user: UserAddress,
        memory_id: MemoryId,
    },
    /// A memory's content was replaced.
    MemoryUpdated {
        user: UserAddress,
        memory_id: MemoryId,
    },
    /// A memory and its side state were removed.
    MemoryDeleted {
        user: UserAddress,
        memory_id: MemoryId,
    },
    /// A batch item failed processing (one event per item).
    BatchItemFailed {
        kind: String,
        item_id: Uuid,
        error: String,
    },
    /// The user's backup key was rotated.
    KeysRotated { user: UserAddress, version: u32 },
}

/// Cloneable sender with subscription access.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    /// Emit, ignoring the no-subscriber case.
    pub fn emit(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
