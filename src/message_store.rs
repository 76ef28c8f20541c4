//! Slot-indexed, ordered message log for one conversation.
//!
//! Messages live in a map from a monotonically increasing slot to a
//! [`Message`], so entries can be removed or superseded without shifting the
//! rest of the log. The order observed by the view is slot-ascending, and
//! slots are never reused.

use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::types::{Message, MessageId};

/// Internal ordering key of the log, unrelated to any server id.
pub type Slot = u64;

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: BTreeMap<Slot, Message>,
    next_slot: Slot,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `message` at the next slot and returns that slot.
    pub fn append(&mut self, message: Message) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.insert(slot, message);
        slot
    }

    /// Removes every entry matching `predicate`, then stores `message` at a
    /// fresh slot that sorts after all surviving entries.
    ///
    /// Returns the new slot and the number of removed entries.
    pub fn replace_matching<P>(&mut self, predicate: P, message: Message) -> (Slot, usize)
    where
        P: FnMut(&Message) -> bool,
    {
        let removed = self.remove_matching(predicate);
        (self.append(message), removed)
    }

    /// Removes every entry matching `predicate` and returns how many were removed.
    pub fn remove_matching<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&Message) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, message| !predicate(message));
        before - self.entries.len()
    }

    /// Replaces the whole log with `messages`, in the given order.
    ///
    /// Slots keep increasing across the replacement.
    pub fn bulk_replace<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        self.entries.clear();
        for message in messages {
            self.append(message);
        }
    }

    /// Ordered, read-only view of the log. Cloning the returned snapshot
    /// restarts the iteration from the first entry.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            inner: self.entries.values(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: Slot) -> Option<&Message> {
        self.entries.get(&slot)
    }

    pub fn contains_confirmed(&self, id: &MessageId) -> bool {
        self.entries.values().any(|message| message.id() == Some(id))
    }

    pub fn provisional_count(&self) -> usize {
        self.entries
            .values()
            .filter(|message| message.is_provisional())
            .count()
    }

    /// First slot whose message matches `predicate`, in log order.
    pub fn find_slot<P>(&self, mut predicate: P) -> Option<Slot>
    where
        P: FnMut(&Message) -> bool,
    {
        self.entries
            .iter()
            .find(|(_, message)| predicate(message))
            .map(|(slot, _)| *slot)
    }
}

/// Lazy, finite iterator over the log in slot order.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    inner: btree_map::Values<'a, Slot, Message>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for Snapshot<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for Snapshot<'_> {}
