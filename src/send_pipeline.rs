use crate::connection::Emitter;
use crate::error::Result;
use crate::message_store::{MessageStore, Slot};
use crate::types::{CorrelationId, Message, OutboundEvent, SendMessagePayload, UserId};

/// A provisional message that is waiting for its server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub slot: Slot,
    pub correlation_id: CorrelationId,
}

/// Shows outgoing messages immediately and hands them to the socket.
#[derive(Debug, Clone)]
pub struct OptimisticSendPipeline {
    peer_id: UserId,
    emitter: Emitter,
}

impl OptimisticSendPipeline {
    pub fn new(peer_id: UserId, emitter: Emitter) -> Self {
        Self { peer_id, emitter }
    }

    /// Appends a provisional message for `content` and emits `send_message`.
    ///
    /// Blank content is ignored and yields `Ok(None)`. The local append always
    /// happens before the emit. If the emit fails the provisional message stays
    /// in the store and the error is returned; confirmation only ever comes
    /// from a later broadcast.
    pub fn send_message(
        &self,
        store: &mut MessageStore,
        content: &str,
    ) -> Result<Option<PendingSend>> {
        if content.trim().is_empty() {
            return Ok(None);
        }

        let correlation_id = CorrelationId::generate();
        let slot = store.append(Message::provisional_with(
            self.peer_id.clone(),
            content,
            correlation_id.clone(),
        ));

        let payload = SendMessagePayload {
            receiver_id: self.peer_id.to_string(),
            content: content.to_string(),
            file_url: None,
            file_type: None,
            client_id: Some(correlation_id.to_string()),
        };

        if let Err(e) = self.emitter.emit(OutboundEvent::SendMessage(payload)) {
            tracing::warn!(
                target: "rentchat::send_pipeline::send_message",
                "Message {} shown locally but could not be queued: {}",
                correlation_id,
                e
            );
            return Err(e);
        }

        tracing::debug!(
            target: "rentchat::send_pipeline::send_message",
            "Queued message {} for {} at slot {}",
            correlation_id,
            self.peer_id,
            slot
        );

        Ok(Some(PendingSend {
            slot,
            correlation_id,
        }))
    }
}
