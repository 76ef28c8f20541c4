//! Folding server-confirmed messages into the local log.
//!
//! Every confirmed message takes a fresh slot after all surviving entries, so
//! it never lands before a message that was visible when the send began.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::message_store::{MessageStore, Slot};
use crate::types::{CorrelationId, Message, UserId, WireMessage};

/// Which provisional entries a confirmation supersedes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationPolicy {
    /// Match each confirmation to the provisional message it answers: by the
    /// echoed correlation id, else by local sender and identical content.
    #[default]
    Correlated,

    /// Any inbound message supersedes every provisional entry. Only correct
    /// while at most one send is in flight.
    DropAllProvisional,
}

impl FromStr for ReconciliationPolicy {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correlated" => Ok(Self::Correlated),
            "drop_all_provisional" | "drop-all-provisional" => Ok(Self::DropAllProvisional),
            other => Err(ChatError::Configuration(format!(
                "unknown reconciliation policy: {other}"
            ))),
        }
    }
}

/// What a single inbound message did to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stored at `slot`, superseding `replaced` provisional entries.
    Applied { slot: Slot, replaced: usize },
    /// The server id is already in the log.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    peer_id: UserId,
    local_user_id: Option<UserId>,
    policy: ReconciliationPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        peer_id: UserId,
        local_user_id: Option<UserId>,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            peer_id,
            local_user_id,
            policy,
        }
    }

    pub fn policy(&self) -> ReconciliationPolicy {
        self.policy
    }

    /// Applies one inbound `receive_message` payload to `store`.
    pub fn reconcile(&self, store: &mut MessageStore, incoming: WireMessage) -> ReconcileOutcome {
        let correlation_id = incoming.correlation_id();
        let confirmed = incoming.into_confirmed(&self.peer_id);

        if let Some(id) = confirmed.id()
            && store.contains_confirmed(id)
        {
            tracing::debug!(
                target: "rentchat::reconciliation::reconcile",
                "Ignoring duplicate message {}",
                id
            );
            return ReconcileOutcome::Duplicate;
        }

        let (slot, replaced) = match self.policy {
            ReconciliationPolicy::DropAllProvisional => {
                store.replace_matching(Message::has_provisional_sender, confirmed)
            }
            ReconciliationPolicy::Correlated => {
                match self.superseded(store, correlation_id.as_ref(), &confirmed) {
                    Some(target) => store.replace_matching(
                        |message| message.correlation_id() == Some(&target),
                        confirmed,
                    ),
                    None => (store.append(confirmed), 0),
                }
            }
        };

        tracing::debug!(
            target: "rentchat::reconciliation::reconcile",
            "Stored confirmed message at slot {} ({} provisional superseded, policy {:?})",
            slot,
            replaced,
            self.policy
        );

        ReconcileOutcome::Applied { slot, replaced }
    }

    /// Correlation id of the provisional message `confirmed` answers, if any.
    fn superseded(
        &self,
        store: &MessageStore,
        correlation_id: Option<&CorrelationId>,
        confirmed: &Message,
    ) -> Option<CorrelationId> {
        if let Some(correlation_id) = correlation_id
            && store
                .find_slot(|message| message.correlation_id() == Some(correlation_id))
                .is_some()
        {
            return Some(correlation_id.clone());
        }

        // Servers that do not echo the correlation id: fall back to the oldest
        // provisional message with the same body, for our own messages only.
        if self.is_from_local_user(confirmed) {
            let slot = store.find_slot(|message| {
                message.is_provisional() && message.content == confirmed.content
            })?;
            return store
                .get(slot)
                .and_then(|message| message.correlation_id().cloned());
        }

        None
    }

    fn is_from_local_user(&self, message: &Message) -> bool {
        match &self.local_user_id {
            Some(local) => &message.sender_id == local,
            // Without a known local id anything not sent by the peer is ours.
            None => message.sender_id != self.peer_id,
        }
    }
}
