//! Socket connection owned by one chat session.
//!
//! A [`ConnectionManager`] spawns a single driver task that holds the socket,
//! decodes inbound frames into [`InboundEvent`]s for the registered listeners
//! and writes queued [`OutboundEvent`]s. When the socket drops, the driver
//! walks the reconnect state machine
//! `Connecting -> Connected -> Backoff -> Connecting ... -> Disconnected`
//! and publishes every transition on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

mod listeners;
pub mod transport;

pub use listeners::{ListenerId, Subscription};
pub use transport::{Connector, FrameSink, FrameStream, Link, WebSocketConnector};

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::types::{EventChannel, InboundEvent, OutboundEvent, RetryInfo};
use listeners::ListenerRegistry;

/// Connection state, independent of message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before reconnect attempt number `attempt`.
    Backoff { attempt: u32, delay: Duration },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Cloneable handle for queueing outbound events. Emitting never waits on the network.
#[derive(Debug, Clone)]
pub struct Emitter {
    sender: mpsc::Sender<OutboundEvent>,
}

impl Emitter {
    pub(crate) fn new(sender: mpsc::Sender<OutboundEvent>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        let name = event.name();
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChatError::OutboundQueueFull,
            mpsc::error::TrySendError::Closed(_) => ChatError::ConnectionClosed,
        })?;
        tracing::trace!(
            target: "rentchat::connection::emit",
            "Queued outbound {} event",
            name
        );
        Ok(())
    }

    /// Like [`Emitter::emit`] but waits for queue space instead of failing when full.
    pub async fn emit_async(&self, event: OutboundEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| ChatError::ConnectionClosed)
    }
}

pub struct ConnectionManager {
    emitter: Emitter,
    listeners: Arc<ListenerRegistry>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &*self.status.borrow())
            .field("listeners", &self.listeners.len())
            .field("token", &"<REDACTED>")
            .finish()
    }
}

impl ConnectionManager {
    /// Starts the connection for one session.
    ///
    /// Fails with [`ChatError::MissingToken`] without touching the network when
    /// `token` is absent or blank. Otherwise returns immediately; progress is
    /// reported through [`ConnectionManager::status`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        config: &ChatConfig,
        token: Option<&str>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let token = match token.map(str::trim) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                tracing::warn!(
                    target: "rentchat::connection::connect",
                    "Refusing to open a socket without an auth token"
                );
                return Err(ChatError::MissingToken);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listeners = Arc::new(ListenerRegistry::new());

        let driver = Driver {
            connector,
            url: config.socket_url.to_string(),
            token,
            retry: config.reconnect.reset(),
            outbound: outbound_rx,
            listeners: listeners.clone(),
            status: status_tx,
            shutdown: shutdown_rx,
        };

        tracing::debug!(
            target: "rentchat::connection::connect",
            "Starting connection driver for {}",
            config.socket_url
        );

        Ok(Self {
            emitter: Emitter::new(outbound_tx),
            listeners,
            status: status_rx,
            shutdown: Some(shutdown_tx),
            driver: Some(tokio::spawn(driver.run())),
        })
    }

    pub fn subscribe(&self, channel: EventChannel) -> Subscription {
        tracing::debug!(
            target: "rentchat::connection::subscribe",
            "Subscribing to {}",
            channel.as_str()
        );
        self.listeners.subscribe(&[channel])
    }

    /// One queue for several channels. Events arrive in the order the socket
    /// delivered them, whichever channel they belong to.
    pub fn subscribe_many(&self, channels: &[EventChannel]) -> Subscription {
        tracing::debug!(
            target: "rentchat::connection::subscribe",
            "Subscribing to {:?}",
            channels
        );
        self.listeners.subscribe(channels)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Drops every listener registered through this handle.
    pub fn unsubscribe_all(&self) -> usize {
        self.listeners.unsubscribe_all()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.emitter.emit(event)
    }

    /// Handle that stays valid for the lifetime of the connection.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Unsubscribes all listeners and stops the driver task. Idempotent.
    pub fn close(&mut self) {
        let removed = self.listeners.unsubscribe_all();
        if let Some(shutdown) = self.shutdown.take() {
            // Err means the driver already exited
            let _ = shutdown.send(());
            tracing::debug!(
                target: "rentchat::connection::close",
                "Connection closed, {} listeners removed",
                removed
            );
        }
    }

    /// Closes the connection and waits for the driver to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            tracing::warn!(
                target: "rentchat::connection::shutdown",
                "Connection driver ended abnormally: {}",
                e
            );
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

enum LinkEnd {
    Shutdown,
    Dropped(String),
}

struct Driver {
    connector: Arc<dyn Connector>,
    url: String,
    token: String,
    retry: RetryInfo,
    outbound: mpsc::Receiver<OutboundEvent>,
    listeners: Arc<ListenerRegistry>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.status.send_replace(ConnectionStatus::Connecting);

            let attempt = tokio::select! {
                _ = &mut self.shutdown => break,
                result = self.connector.connect(&self.url, &self.token) => result,
            };

            match attempt {
                Ok(link) => {
                    tracing::info!(
                        target: "rentchat::connection::driver",
                        "Connected to {}",
                        self.url
                    );
                    self.retry = self.retry.reset();
                    self.status.send_replace(ConnectionStatus::Connected);

                    match self.pump(link).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Dropped(reason) => {
                            tracing::warn!(
                                target: "rentchat::connection::driver",
                                "Connection dropped: {}",
                                reason
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "rentchat::connection::driver",
                        "Connect attempt failed: {}",
                        e
                    );
                }
            }

            let Some(next) = self.retry.next_attempt() else {
                tracing::error!(
                    target: "rentchat::connection::driver",
                    "Giving up after {} reconnect attempts",
                    self.retry.attempt
                );
                break;
            };
            self.retry = next;
            let delay = self.retry.delay();
            self.status.send_replace(ConnectionStatus::Backoff {
                attempt: self.retry.attempt,
                delay,
            });

            tokio::select! {
                _ = &mut self.shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(ConnectionStatus::Disconnected);
        // Nothing will be delivered any more; let subscribers see the end of their queues
        let removed = self.listeners.unsubscribe_all();
        tracing::debug!(
            target: "rentchat::connection::driver",
            "Connection driver stopped, {} listeners released",
            removed
        );
    }

    /// Moves frames in both directions until the link fails or shutdown is requested.
    async fn pump(&mut self, link: Link) -> LinkEnd {
        let Link {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(
                            target: "rentchat::connection::driver",
                            "Error closing socket: {}",
                            e
                        );
                    }
                    return LinkEnd::Shutdown;
                }
                outbound = self.outbound.recv() => {
                    let Some(event) = outbound else {
                        // Every emitter is gone, nobody can use this socket any more
                        let _ = sink.close().await;
                        return LinkEnd::Shutdown;
                    };
                    let frame = match event.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!(
                                target: "rentchat::connection::driver",
                                "Failed to encode {} event: {}",
                                event.name(),
                                e
                            );
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(frame).await {
                        return LinkEnd::Dropped(format!("write failed: {e}"));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.deliver(&text),
                    Some(Err(e)) => return LinkEnd::Dropped(format!("read failed: {e}")),
                    None => return LinkEnd::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    fn deliver(&self, frame: &str) {
        match InboundEvent::decode(frame) {
            Ok(Some(event)) => {
                let delivered = self.listeners.dispatch(&event);
                tracing::trace!(
                    target: "rentchat::connection::driver",
                    "Delivered {} event to {} listeners",
                    event.channel().as_str(),
                    delivered
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    target: "rentchat::connection::driver",
                    "Dropping malformed frame: {}",
                    e
                );
            }
        }
    }
}
