//! REST calls made by a chat session: conversation history and peer profile.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::types::{UserId, UserProfile, WireMessage};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Full message history of the conversation with `peer_id`, oldest first.
    async fn fetch_messages(&self, peer_id: &UserId) -> Result<Vec<WireMessage>>;

    async fn fetch_user_profile(&self, user_id: &UserId) -> Result<UserProfile>;
}

/// The history endpoint has returned all of these shapes over time.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    List(Vec<WireMessage>),
    Wrapped { messages: Vec<WireMessage> },
    Keyed(HashMap<String, WireMessage>),
}

impl HistoryResponse {
    fn into_messages(self) -> Vec<WireMessage> {
        match self {
            HistoryResponse::List(messages) => messages,
            HistoryResponse::Wrapped { messages } => messages,
            HistoryResponse::Keyed(map) => {
                let mut entries: Vec<_> = map.into_iter().collect();
                entries.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(a), Ok(b)) => a.cmp(&b),
                    _ => a.cmp(b),
                });
                entries.into_iter().map(|(_, message)| message).collect()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileResponse {
    Wrapped { user: UserProfile },
    Plain(UserProfile),
}

/// [`ChatApi`] over HTTP with bearer authentication.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    config: ChatConfig,
    token: String,
}

impl std::fmt::Debug for HttpChatApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatApi")
            .field("api_base_url", &self.config.api_base_url.as_str())
            .field("token", &"<REDACTED>")
            .finish()
    }
}

impl HttpChatApi {
    pub fn new(config: &ChatConfig, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ChatError::MissingToken);
        }
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            config: config.clone(),
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        tracing::debug!(target: "rentchat::api::get_json", "GET {}", url);

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(
                target: "rentchat::api::get_json",
                "Request to {} failed with status {}",
                url,
                status
            );
            return Err(ChatError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_messages(&self, peer_id: &UserId) -> Result<Vec<WireMessage>> {
        let url = self.config.endpoint(&["chat", "messages", peer_id.as_str()])?;
        let response: HistoryResponse = self.get_json(url).await?;
        let messages = response.into_messages();
        tracing::info!(
            target: "rentchat::api::fetch_messages",
            "Fetched {} messages for conversation with {}",
            messages.len(),
            peer_id
        );
        Ok(messages)
    }

    async fn fetch_user_profile(&self, user_id: &UserId) -> Result<UserProfile> {
        let url = self.config.endpoint(&["users", user_id.as_str()])?;
        let profile = match self.get_json::<ProfileResponse>(url).await? {
            ProfileResponse::Wrapped { user } => user,
            ProfileResponse::Plain(profile) => profile,
        };
        Ok(profile)
    }
}
