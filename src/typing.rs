use std::time::Duration;

use tokio::task::JoinHandle;

use crate::connection::Emitter;
use crate::error::Result;
use crate::types::{InboundTyping, OutboundEvent, TypingPayload, UserId};

/// Typing presence of the remote peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypingState {
    pub is_typing: bool,
}

/// Sends our typing signal with an auto-off debounce and tracks the peer's.
///
/// A `true` signal arms a timer that emits `false` after the debounce window
/// unless another signal arrives first. Only one timer is ever armed.
#[derive(Debug)]
pub struct TypingSignalController {
    peer_id: UserId,
    emitter: Emitter,
    debounce: Duration,
    timer: Option<JoinHandle<()>>,
    remote: TypingState,
}

impl TypingSignalController {
    pub fn new(peer_id: UserId, emitter: Emitter, debounce: Duration) -> Self {
        Self {
            peer_id,
            emitter,
            debounce,
            timer: None,
            remote: TypingState::default(),
        }
    }

    /// Must be called from within a tokio runtime when `is_typing` is true.
    ///
    /// When the emit fails the previously armed auto-off stays in place, so a
    /// `true` that already reached the queue is always followed by a `false`.
    pub fn send_typing_indicator(&mut self, is_typing: bool) -> Result<()> {
        self.emitter.emit(self.event(is_typing))?;

        self.cancel_timer();
        if is_typing {
            let emitter = self.emitter.clone();
            let event = self.event(false);
            let debounce = self.debounce;
            let peer_id = self.peer_id.clone();
            self.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                // Waits out a full queue, e.g. while the socket is in backoff
                if let Err(e) = emitter.emit_async(event).await {
                    tracing::debug!(
                        target: "rentchat::typing::auto_off",
                        "Could not send typing auto-off to {}: {}",
                        peer_id,
                        e
                    );
                }
            }));
        }

        Ok(())
    }

    /// Applies an inbound typing event. Returns true when the remote state changed.
    ///
    /// Events from anyone other than the conversation peer are ignored.
    pub fn handle_inbound(&mut self, typing: &InboundTyping) -> bool {
        if typing.sender_id != self.peer_id.as_str() {
            tracing::trace!(
                target: "rentchat::typing::handle_inbound",
                "Ignoring typing event from {}",
                typing.sender_id
            );
            return false;
        }

        let changed = self.remote.is_typing != typing.is_typing;
        self.remote.is_typing = typing.is_typing;
        changed
    }

    pub fn remote_state(&self) -> TypingState {
        self.remote
    }

    pub fn remote_is_typing(&self) -> bool {
        self.remote.is_typing
    }

    /// Clears the pending auto-off timer without emitting anything.
    pub fn shutdown(&mut self) {
        self.cancel_timer();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn event(&self, is_typing: bool) -> OutboundEvent {
        OutboundEvent::Typing(TypingPayload {
            receiver_id: self.peer_id.to_string(),
            is_typing,
        })
    }
}

impl Drop for TypingSignalController {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
