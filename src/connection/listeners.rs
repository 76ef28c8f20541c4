//! Listener registry for named inbound channels.
//!
//! Each subscription gets its own unbounded queue, covering one or more
//! channels. Events on a shared queue keep the order they were dispatched in.
//! Queues whose receiver was dropped are cleaned up on the next dispatch.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::types::{EventChannel, InboundEvent};

pub type ListenerId = u64;

struct Listener {
    channels: Vec<EventChannel>,
    sender: mpsc::UnboundedSender<InboundEvent>,
}

pub(crate) struct ListenerRegistry {
    listeners: DashMap<ListenerId, Listener>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self, channels: &[EventChannel]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.insert(
            id,
            Listener {
                channels: channels.to_vec(),
                sender,
            },
        );
        Subscription {
            id,
            channels: channels.to_vec(),
            receiver,
        }
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub(crate) fn unsubscribe_all(&self) -> usize {
        let count = self.listeners.len();
        self.listeners.clear();
        count
    }

    /// Hands `event` to every listener of its channel and returns how many received it.
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        let channel = event.channel();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.listeners.iter() {
            if !entry.channels.contains(&channel) {
                continue;
            }
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        // Removing while iterating would deadlock the shard
        for id in closed {
            self.listeners.remove(&id);
        }

        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// Receiving end of one listener registration.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    channels: Vec<EventChannel>,
    receiver: mpsc::UnboundedReceiver<InboundEvent>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn channels(&self) -> &[EventChannel] {
        &self.channels
    }

    /// Next event, or `None` once the listener has been unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.receiver.try_recv().ok()
    }
}
