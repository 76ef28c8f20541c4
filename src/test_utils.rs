//! Test configuration and in-memory transport helpers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::connection::{Connector, Link};
use crate::error::{ChatError, Result};
use crate::types::{OutboundEvent, RetryInfo};

pub(crate) fn create_test_config() -> ChatConfig {
    ChatConfig::new(
        "http://127.0.0.1:1",
        "ws://127.0.0.1:1/socket",
        Path::new("/tmp/rentchat-test/data"),
        Path::new("/tmp/rentchat-test/logs"),
    )
    .expect("test config is valid")
    .with_reconnect(RetryInfo::with_limits(5, 10, 100))
}

pub(crate) fn create_test_config_for(api_base_url: &str) -> ChatConfig {
    let mut config = create_test_config();
    config.api_base_url = api_base_url.parse().expect("valid api url");
    config
}

/// Server side of one in-memory socket.
pub(crate) struct ServerEnd {
    pub token: String,
    from_client: frames::UnboundedReceiver<String>,
    to_client: frames::UnboundedSender<String>,
}

impl ServerEnd {
    /// Next frame the client wrote, or `None` once the client closed its side.
    pub(crate) async fn next_frame(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    pub(crate) async fn next_event(&mut self) -> Option<OutboundEvent> {
        let frame = self.next_frame().await?;
        Some(serde_json::from_str(&frame).expect("client writes valid events"))
    }

    pub(crate) fn push(&self, frame: &str) {
        self.to_client
            .unbounded_send(frame.to_string())
            .expect("client side still open");
    }
}

/// Connector that hands the server side of every link to the test.
pub(crate) struct MemoryConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    attempts: AtomicUsize,
    fail: bool,
}

impl MemoryConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, receiver) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                attempts: AtomicUsize::new(0),
                fail: false,
            },
            receiver,
        )
    }

    /// A connector whose every attempt is refused.
    pub(crate) fn failing() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (mut connector, receiver) = Self::new();
        connector.fail = true;
        (connector, receiver)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str, token: &str) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ChatError::ConnectionClosed);
        }

        let (client_tx, from_client) = frames::unbounded();
        let (to_client, client_rx) = frames::unbounded();

        self.servers
            .send(ServerEnd {
                token: token.to_string(),
                from_client,
                to_client,
            })
            .map_err(|_| ChatError::ConnectionClosed)?;

        Ok(Link {
            sink: Box::pin(client_tx.sink_map_err(|_| ChatError::ConnectionClosed)),
            stream: Box::pin(client_rx.map(Ok)),
        })
    }
}
