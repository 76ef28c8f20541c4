use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Sender id carried by every message that the server has not confirmed yet.
pub const PROVISIONAL_SENDER_ID: &str = "temp";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a marketplace user (guest or host).
    UserId
);
string_id!(
    /// Server-assigned message identifier.
    MessageId
);
string_id!(
    /// Client-generated tag tying a provisional message to its confirmation.
    CorrelationId
);

impl UserId {
    pub fn provisional() -> Self {
        Self(PROVISIONAL_SENDER_ID.to_string())
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Whether a message is still waiting for the server or has been confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    Provisional { correlation_id: CorrelationId },
    Confirmed { id: Option<MessageId> },
}

/// One chat line as rendered by the conversation view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub delivery: Delivery,

    /// The other participant of the conversation this message belongs to
    pub conversation_peer_id: UserId,

    /// Local user, peer, or [`PROVISIONAL_SENDER_ID`] while unconfirmed
    pub sender_id: UserId,

    /// Text body, empty when the server sent none
    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// Server-authoritative read flag
    pub read: bool,
}

impl Message {
    /// Builds an unconfirmed local message stamped with the current time.
    pub fn provisional(conversation_peer_id: UserId, content: impl Into<String>) -> Self {
        Self::provisional_with(conversation_peer_id, content, CorrelationId::generate())
    }

    /// Same as [`Message::provisional`] with a caller-chosen correlation id.
    pub fn provisional_with(
        conversation_peer_id: UserId,
        content: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            delivery: Delivery::Provisional { correlation_id },
            conversation_peer_id,
            sender_id: UserId::provisional(),
            content: content.into(),
            timestamp: Utc::now(),
            read: false,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.delivery {
            Delivery::Confirmed { id } => id.as_ref(),
            Delivery::Provisional { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match &self.delivery {
            Delivery::Provisional { correlation_id } => Some(correlation_id),
            Delivery::Confirmed { .. } => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.delivery, Delivery::Provisional { .. })
    }

    /// True when the sender is the `"temp"` sentinel.
    pub fn has_provisional_sender(&self) -> bool {
        self.sender_id.as_str() == PROVISIONAL_SENDER_ID
    }
}

/// Message object as it travels over the socket and the history endpoint.
///
/// Every field is optional so that a malformed payload degrades to an empty
/// message instead of failing the whole conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl WireMessage {
    /// Converts into a confirmed [`Message`] of the conversation with `peer_id`.
    pub fn into_confirmed(self, peer_id: &UserId) -> Message {
        let timestamp = match self.timestamp.as_deref() {
            Some(raw) => parse_timestamp(raw).unwrap_or_else(|| {
                tracing::warn!(
                    target: "rentchat::types::into_confirmed",
                    "Unparseable timestamp {:?}, using receive time",
                    raw
                );
                Utc::now()
            }),
            None => Utc::now(),
        };

        if self.sender_id.is_none() {
            tracing::warn!(
                target: "rentchat::types::into_confirmed",
                "Message {:?} arrived without a sender",
                self.id
            );
        }

        Message {
            delivery: Delivery::Confirmed {
                id: self.id.map(MessageId::new),
            },
            conversation_peer_id: peer_id.clone(),
            sender_id: UserId::new(self.sender_id.unwrap_or_default()),
            content: self.content.unwrap_or_default(),
            timestamp,
            read: self.read.unwrap_or(false),
        }
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(CorrelationId::new)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

/// Payload of the outbound `send_message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: String,
    pub content: String,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Payload of the outbound `typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub receiver_id: String,
    pub is_typing: bool,
}

/// Payload of the inbound `typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundTyping {
    pub sender_id: String,
    #[serde(default)]
    pub is_typing: bool,
}

/// Events this client writes to the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage(_) => "send_message",
            OutboundEvent::Typing(_) => "typing",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Named inbound channels a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventChannel {
    ReceiveMessage,
    Typing,
}

impl EventChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventChannel::ReceiveMessage => "receive_message",
            EventChannel::Typing => "typing",
        }
    }
}

/// Events the server broadcasts to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ReceiveMessage(WireMessage),
    Typing(InboundTyping),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl InboundEvent {
    pub fn channel(&self) -> EventChannel {
        match self {
            InboundEvent::ReceiveMessage(_) => EventChannel::ReceiveMessage,
            InboundEvent::Typing(_) => EventChannel::Typing,
        }
    }

    /// Decodes one text frame. Returns `Ok(None)` for events this client does not handle.
    pub fn decode(frame: &str) -> Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        let event = match envelope.event.as_str() {
            "receive_message" => {
                InboundEvent::ReceiveMessage(serde_json::from_value(envelope.data)?)
            }
            "typing" => InboundEvent::Typing(serde_json::from_value(envelope.data)?),
            other => {
                tracing::debug!(
                    target: "rentchat::types::decode",
                    "Skipping unhandled event {}",
                    other
                );
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    /// Encodes in the same envelope the server uses.
    pub fn encode(&self) -> Result<String> {
        let (event, data) = match self {
            InboundEvent::ReceiveMessage(message) => {
                ("receive_message", serde_json::to_value(message)?)
            }
            InboundEvent::Typing(typing) => ("typing", serde_json::to_value(typing)?),
        };
        Ok(serde_json::json!({ "event": event, "data": data }).to_string())
    }
}

/// Profile fields shown in the conversation header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub user_type: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Exponential backoff schedule for reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    /// Number of retries already made
    pub attempt: u32,
    /// Maximum number of retry attempts allowed
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl RetryInfo {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }

    pub fn with_limits(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn next_attempt(&self) -> Option<Self> {
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(Self {
                attempt: self.attempt + 1,
                ..self.clone()
            })
        }
    }

    /// Delay before this attempt: `base * 2^(attempt - 1)`, capped.
    pub fn delay(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1).min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn reset(&self) -> Self {
        Self {
            attempt: 0,
            ..self.clone()
        }
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self::new()
    }
}
