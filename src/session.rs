//! One open conversation screen.
//!
//! [`ChatSession`] owns the socket, the message log, the send pipeline, the
//! reconciliation engine and the typing controller for a single peer. Inputs
//! (history result, inbound messages, typing events, connection status) are
//! consumed one at a time by [`ChatSession::next_update`], so the log is only
//! ever mutated from the task that owns the session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};

use crate::api::ChatApi;
use crate::config::ChatConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Connector, Subscription};
use crate::error::{ChatError, Result};
use crate::message_store::{MessageStore, Snapshot};
use crate::reconciliation::{ReconcileOutcome, ReconciliationEngine};
use crate::send_pipeline::{OptimisticSendPipeline, PendingSend};
use crate::typing::TypingSignalController;
use crate::types::{
    CorrelationId, EventChannel, InboundEvent, Message, MessageId, UserId, UserProfile,
    WireMessage,
};

/// Who is talking to whom, and with which token.
#[derive(Clone)]
pub struct SessionCredentials {
    pub token: Option<String>,
    pub peer_id: UserId,
    /// Used to recognise our own confirmations when the server does not echo
    /// the correlation id. Optional.
    pub local_user_id: Option<UserId>,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .field("peer_id", &self.peer_id)
            .field("local_user_id", &self.local_user_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    Loading,
    Loaded,
    Failed(String),
}

/// What a processed input changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// History arrived and the log now holds `count` entries.
    HistoryLoaded { count: usize },

    /// The history fetch failed. Live messages keep flowing.
    HistoryFailed { reason: String },

    /// An inbound message was folded into the log.
    MessageReceived(ReconcileOutcome),

    /// The peer started or stopped typing.
    RemoteTyping(bool),

    ConnectionChanged(ConnectionStatus),
}

type HistoryResult = Result<Vec<WireMessage>>;

enum Input {
    History(HistoryResult),
    Inbound(InboundEvent),
    Status(ConnectionStatus),
    Exhausted,
}

pub struct ChatSession {
    peer_id: UserId,
    api: Arc<dyn ChatApi>,
    store: MessageStore,
    connection: ConnectionManager,
    pipeline: OptimisticSendPipeline,
    reconciler: ReconciliationEngine,
    typing: TypingSignalController,
    inbound: Subscription,
    status: watch::Receiver<ConnectionStatus>,
    status_open: bool,
    history: Option<oneshot::Receiver<HistoryResult>>,
    history_state: HistoryState,
    closed: bool,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("peer_id", &self.peer_id)
            .field("messages", &self.store.len())
            .field("history_state", &self.history_state)
            .field("connection", &self.connection)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChatSession {
    /// Opens a conversation with `credentials.peer_id`.
    ///
    /// Fails with [`ChatError::MissingToken`] or [`ChatError::MissingPeer`]
    /// before any network activity. Otherwise the socket is started, both
    /// inbound channels are subscribed and the history fetch is spawned; the
    /// session is usable immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: &ChatConfig,
        credentials: SessionCredentials,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let SessionCredentials {
            token,
            peer_id,
            local_user_id,
        } = credentials;

        let token = token.filter(|token| !token.trim().is_empty());
        if token.is_none() {
            tracing::warn!(
                target: "rentchat::session::open",
                "Cannot open chat without an auth token"
            );
            return Err(ChatError::MissingToken);
        }
        if peer_id.is_blank() {
            tracing::warn!(
                target: "rentchat::session::open",
                "Cannot open chat without a peer id"
            );
            return Err(ChatError::MissingPeer);
        }

        let connection = ConnectionManager::connect(config, token.as_deref(), connector)?;
        let inbound =
            connection.subscribe_many(&[EventChannel::ReceiveMessage, EventChannel::Typing]);
        let status = connection.status_receiver();
        let emitter = connection.emitter();

        let history = spawn_history_fetch(api.clone(), peer_id.clone());

        tracing::info!(
            target: "rentchat::session::open",
            "Opened chat with {}",
            peer_id
        );

        Ok(Self {
            pipeline: OptimisticSendPipeline::new(peer_id.clone(), emitter.clone()),
            reconciler: ReconciliationEngine::new(
                peer_id.clone(),
                local_user_id,
                config.reconciliation_policy,
            ),
            typing: TypingSignalController::new(peer_id.clone(), emitter, config.typing_debounce),
            peer_id,
            api,
            store: MessageStore::new(),
            connection,
            inbound,
            status,
            status_open: true,
            history: Some(history),
            history_state: HistoryState::Loading,
            closed: false,
        })
    }

    /// Waits for the next input and applies it.
    ///
    /// Messages and typing events come off one queue in the order the socket
    /// delivered them. Inputs that change nothing visible (typing from other
    /// users, a repeated typing state) are consumed silently. Returns `None`
    /// once the session is closed or every input source has ended, which
    /// includes the connection giving up after its retry budget.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.closed {
                return None;
            }

            let input = tokio::select! {
                result = recv_history(&mut self.history), if self.history.is_some() => {
                    Input::History(result)
                }
                Some(event) = self.inbound.recv() => Input::Inbound(event),
                changed = self.status.changed(), if self.status_open => match changed {
                    Ok(()) => Input::Status(self.status.borrow_and_update().clone()),
                    Err(_) => {
                        self.status_open = false;
                        continue;
                    }
                },
                else => Input::Exhausted,
            };

            let update = match input {
                Input::History(result) => Some(self.apply_history(result)),
                Input::Inbound(InboundEvent::ReceiveMessage(message)) => self.apply_message(message),
                Input::Inbound(InboundEvent::Typing(typing)) => self
                    .typing
                    .handle_inbound(&typing)
                    .then(|| SessionUpdate::RemoteTyping(typing.is_typing)),
                Input::Status(status) => Some(SessionUpdate::ConnectionChanged(status)),
                Input::Exhausted => return None,
            };

            if let Some(update) = update {
                return Some(update);
            }
        }
    }

    /// Shows `content` immediately and queues it for the server. Blank
    /// content is ignored.
    pub fn send_message(&mut self, content: &str) -> Result<Option<PendingSend>> {
        if self.closed {
            return Err(ChatError::ConnectionClosed);
        }
        self.pipeline.send_message(&mut self.store, content)
    }

    pub fn send_typing_indicator(&mut self, is_typing: bool) -> Result<()> {
        if self.closed {
            return Err(ChatError::ConnectionClosed);
        }
        self.typing.send_typing_indicator(is_typing)
    }

    /// Current log, oldest first.
    pub fn snapshot(&self) -> Snapshot<'_> {
        self.store.snapshot()
    }

    pub fn peer_id(&self) -> &UserId {
        &self.peer_id
    }

    pub fn remote_is_typing(&self) -> bool {
        self.typing.remote_is_typing()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn history_state(&self) -> &HistoryState {
        &self.history_state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fetches the peer's profile for the conversation header.
    pub async fn load_peer_profile(&self) -> Result<UserProfile> {
        self.api.fetch_user_profile(&self.peer_id).await
    }

    /// Tears the session down: listeners are removed, the typing timer is
    /// cleared and a pending history result will be discarded. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.typing.shutdown();
        self.connection.close();
        self.history = None;
        tracing::info!(
            target: "rentchat::session::close",
            "Closed chat with {}",
            self.peer_id
        );
    }

    fn apply_history(&mut self, result: HistoryResult) -> SessionUpdate {
        match result {
            Ok(history) => {
                self.merge_history(history);
                self.history_state = HistoryState::Loaded;
                tracing::debug!(
                    target: "rentchat::session::apply_history",
                    "History applied, {} messages in the log",
                    self.store.len()
                );
                SessionUpdate::HistoryLoaded {
                    count: self.store.len(),
                }
            }
            Err(e) => {
                tracing::error!(
                    target: "rentchat::session::apply_history",
                    "Failed to load history with {}: {}",
                    self.peer_id,
                    e
                );
                let reason = e.to_string();
                self.history_state = HistoryState::Failed(reason.clone());
                SessionUpdate::HistoryFailed { reason }
            }
        }
    }

    /// Seeds the log with `history`, keeping entries the history does not know
    /// about (unconfirmed sends and live messages that raced the fetch).
    ///
    /// Live messages without a server id are matched on sender, content and
    /// timestamp.
    fn merge_history(&mut self, history: Vec<WireMessage>) {
        let echoed: HashSet<CorrelationId> =
            history.iter().filter_map(WireMessage::correlation_id).collect();
        let confirmed: Vec<Message> = history
            .into_iter()
            .map(|message| message.into_confirmed(&self.peer_id))
            .collect();
        let known: HashSet<&MessageId> = confirmed.iter().filter_map(Message::id).collect();
        let known_unkeyed: HashSet<(&UserId, &str, DateTime<Utc>)> =
            confirmed.iter().map(content_key).collect();

        let carried: Vec<Message> = self
            .store
            .snapshot()
            .filter(|message| match (message.id(), message.correlation_id()) {
                (Some(id), _) => !known.contains(id),
                (None, Some(correlation_id)) => !echoed.contains(correlation_id),
                (None, None) => !known_unkeyed.contains(&content_key(message)),
            })
            .cloned()
            .collect();

        self.store.bulk_replace(confirmed.into_iter().chain(carried));
    }

    fn apply_message(&mut self, message: WireMessage) -> Option<SessionUpdate> {
        if !self.belongs_to_conversation(&message) {
            tracing::debug!(
                target: "rentchat::session::apply_message",
                "Ignoring message {:?} from another conversation",
                message.id
            );
            return None;
        }

        let outcome = self.reconciler.reconcile(&mut self.store, message);
        Some(SessionUpdate::MessageReceived(outcome))
    }

    /// A broadcast that names both ends and leaves the peer out belongs to a
    /// different conversation.
    fn belongs_to_conversation(&self, message: &WireMessage) -> bool {
        match (message.sender_id.as_deref(), message.receiver_id.as_deref()) {
            (Some(sender), Some(receiver)) => {
                sender == self.peer_id.as_str() || receiver == self.peer_id.as_str()
            }
            _ => true,
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn content_key(message: &Message) -> (&UserId, &str, DateTime<Utc>) {
    (&message.sender_id, message.content.as_str(), message.timestamp)
}

fn spawn_history_fetch(
    api: Arc<dyn ChatApi>,
    peer_id: UserId,
) -> oneshot::Receiver<HistoryResult> {
    let (sender, receiver) = oneshot::channel();
    tokio::spawn(async move {
        let result = api.fetch_messages(&peer_id).await;
        if sender.send(result).is_err() {
            tracing::debug!(
                target: "rentchat::session::history",
                "Discarding history for {}, session already closed",
                peer_id
            );
        }
    });
    receiver
}

/// Resolves once with the history result, then never again.
async fn recv_history(history: &mut Option<oneshot::Receiver<HistoryResult>>) -> HistoryResult {
    let Some(receiver) = history.as_mut() else {
        return std::future::pending().await;
    };
    let result = match receiver.await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Other(anyhow::anyhow!(
            "history task ended without a result"
        ))),
    };
    *history = None;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::ReconciliationPolicy;
    use crate::test_utils::*;
    use crate::types::{OutboundEvent, RetryInfo};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// History endpoint that answers only when the test releases it.
    struct MockApi {
        history: Mutex<Option<oneshot::Receiver<HistoryResult>>>,
    }

    impl MockApi {
        fn new() -> (Arc<Self>, oneshot::Sender<HistoryResult>) {
            let (sender, receiver) = oneshot::channel();
            (
                Arc::new(Self {
                    history: Mutex::new(Some(receiver)),
                }),
                sender,
            )
        }

        fn with_history(history: Vec<WireMessage>) -> Arc<Self> {
            let (api, sender) = Self::new();
            sender.send(Ok(history)).ok();
            api
        }
    }

    #[async_trait]
    impl ChatApi for MockApi {
        async fn fetch_messages(&self, _peer_id: &UserId) -> Result<Vec<WireMessage>> {
            let receiver = self.history.lock().unwrap().take();
            match receiver {
                Some(receiver) => receiver.await.unwrap_or(Ok(Vec::new())),
                None => Ok(Vec::new()),
            }
        }

        async fn fetch_user_profile(&self, user_id: &UserId) -> Result<UserProfile> {
            Ok(UserProfile {
                first_name: format!("User {}", user_id),
                last_name: "Test".to_string(),
                user_type: None,
            })
        }
    }

    fn credentials() -> SessionCredentials {
        SessionCredentials {
            token: Some("token".to_string()),
            peer_id: UserId::new("u2"),
            local_user_id: Some(UserId::new("u1")),
        }
    }

    fn wire(id: &str, sender: &str, content: &str) -> WireMessage {
        WireMessage {
            id: Some(id.to_string()),
            sender_id: Some(sender.to_string()),
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    fn receive_frame(message: &WireMessage) -> String {
        InboundEvent::ReceiveMessage(message.clone()).encode().unwrap()
    }

    fn contents(session: &ChatSession) -> Vec<String> {
        session.snapshot().map(|m| m.content.clone()).collect()
    }

    /// Skips connection status updates.
    async fn next_content_update(session: &mut ChatSession) -> SessionUpdate {
        loop {
            match session.next_update().await.expect("session still open") {
                SessionUpdate::ConnectionChanged(_) => continue,
                update => return update,
            }
        }
    }

    async fn open_with_history(
        history: Vec<WireMessage>,
    ) -> (ChatSession, ServerEnd) {
        let (connector, mut servers) = MemoryConnector::new();
        let mut session = ChatSession::open(
            &create_test_config(),
            credentials(),
            MockApi::with_history(history),
            Arc::new(connector),
        )
        .unwrap();
        let server = servers.recv().await.unwrap();
        assert!(matches!(
            next_content_update(&mut session).await,
            SessionUpdate::HistoryLoaded { .. }
        ));
        (session, server)
    }

    #[tokio::test]
    async fn test_open_requires_token() {
        let (connector, _servers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (api, _release) = MockApi::new();

        let result = ChatSession::open(
            &create_test_config(),
            SessionCredentials {
                token: None,
                ..credentials()
            },
            api,
            connector.clone(),
        );

        assert!(matches!(result, Err(ChatError::MissingToken)));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_open_requires_peer() {
        let (connector, _servers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (api, _release) = MockApi::new();

        let result = ChatSession::open(
            &create_test_config(),
            SessionCredentials {
                peer_id: UserId::new(" "),
                ..credentials()
            },
            api,
            connector.clone(),
        );

        assert!(matches!(result, Err(ChatError::MissingPeer)));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_history_seeds_the_log() {
        let (session, _server) = open_with_history(vec![
            wire("m1", "u2", "hello"),
            wire("m2", "u1", "hi"),
        ])
        .await;

        assert_eq!(session.history_state(), &HistoryState::Loaded);
        assert_eq!(contents(&session), vec!["hello", "hi"]);
        assert!(session.snapshot().all(|m| !m.is_provisional()));
    }

    #[tokio::test]
    async fn test_send_then_confirm_scenario() {
        let (mut session, mut server) = open_with_history(Vec::new()).await;

        session.send_message("Hi").unwrap();

        assert_eq!(session.snapshot().len(), 1);
        let provisional = session.snapshot().next().unwrap().clone();
        assert_eq!(provisional.sender_id.as_str(), "temp");
        assert_eq!(provisional.content, "Hi");

        match server.next_event().await {
            Some(OutboundEvent::SendMessage(payload)) => {
                assert_eq!(payload.receiver_id, "u2");
                assert_eq!(payload.content, "Hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Server does not echo the client id
        server.push(&receive_frame(&wire("m1", "u1", "Hi")));

        assert!(matches!(
            next_content_update(&mut session).await,
            SessionUpdate::MessageReceived(ReconcileOutcome::Applied { replaced: 1, .. })
        ));
        let log: Vec<_> = session.snapshot().cloned().collect();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id().map(MessageId::as_str), Some("m1"));
        assert_eq!(log[0].sender_id.as_str(), "u1");
        assert!(session.snapshot().all(|m| !m.has_provisional_sender()));
    }

    #[tokio::test]
    async fn test_overlapping_sends_reconcile_one_to_one() {
        let (mut session, mut server) = open_with_history(Vec::new()).await;

        let first = session.send_message("one").unwrap().unwrap();
        let second = session.send_message("two").unwrap().unwrap();
        server.next_event().await.unwrap();
        server.next_event().await.unwrap();

        let mut confirmation = wire("m2", "u1", "two");
        confirmation.client_id = Some(second.correlation_id.to_string());
        server.push(&receive_frame(&confirmation));
        next_content_update(&mut session).await;

        let log: Vec<_> = session.snapshot().cloned().collect();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].correlation_id(), Some(&first.correlation_id));
        assert_eq!(log[1].id().map(MessageId::as_str), Some("m2"));
    }

    #[tokio::test]
    async fn test_legacy_policy_drops_all_provisional() {
        let (connector, mut servers) = MemoryConnector::new();
        let config = create_test_config()
            .with_reconciliation_policy(ReconciliationPolicy::DropAllProvisional);
        let mut session = ChatSession::open(
            &config,
            credentials(),
            MockApi::with_history(Vec::new()),
            Arc::new(connector),
        )
        .unwrap();
        let server = servers.recv().await.unwrap();
        next_content_update(&mut session).await;

        session.send_message("one").unwrap();
        session.send_message("two").unwrap();
        server.push(&receive_frame(&wire("m9", "u2", "unrelated")));
        next_content_update(&mut session).await;

        assert_eq!(contents(&session), vec!["unrelated"]);
    }

    #[tokio::test]
    async fn test_peer_message_keeps_pending_send() {
        let (mut session, server) = open_with_history(Vec::new()).await;

        session.send_message("pending").unwrap();
        server.push(&receive_frame(&wire("m5", "u2", "from peer")));
        next_content_update(&mut session).await;

        assert_eq!(contents(&session), vec!["pending", "from peer"]);
        assert_eq!(session.snapshot().filter(|m| m.is_provisional()).count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_broadcast_is_ignored() {
        let (mut session, server) = open_with_history(vec![wire("m1", "u2", "hello")]).await;

        server.push(&receive_frame(&wire("m1", "u2", "hello")));

        assert_eq!(
            next_content_update(&mut session).await,
            SessionUpdate::MessageReceived(ReconcileOutcome::Duplicate)
        );
        assert_eq!(session.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_message_for_other_conversation_is_ignored() {
        let (mut session, server) = open_with_history(Vec::new()).await;

        let mut elsewhere = wire("m7", "u3", "not for this chat");
        elsewhere.receiver_id = Some("u1".to_string());
        server.push(&receive_frame(&elsewhere));
        server.push(&receive_frame(&wire("m8", "u2", "for this chat")));

        next_content_update(&mut session).await;
        assert_eq!(contents(&session), vec!["for this chat"]);
    }

    #[tokio::test]
    async fn test_send_before_history_survives_merge() {
        let (connector, mut servers) = MemoryConnector::new();
        let (api, release) = MockApi::new();
        let mut session =
            ChatSession::open(&create_test_config(), credentials(), api, Arc::new(connector))
                .unwrap();
        let server = servers.recv().await.unwrap();

        session.send_message("early").unwrap();
        server.push(&receive_frame(&wire("m3", "u2", "live")));
        next_content_update(&mut session).await;
        assert_eq!(session.history_state(), &HistoryState::Loading);

        release
            .send(Ok(vec![wire("m1", "u2", "old"), wire("m3", "u2", "live")]))
            .unwrap();
        assert_eq!(
            next_content_update(&mut session).await,
            SessionUpdate::HistoryLoaded { count: 3 }
        );

        // m3 is known to the history, only the unconfirmed send is carried over
        assert_eq!(contents(&session), vec!["old", "live", "early"]);
    }

    #[tokio::test]
    async fn test_unkeyed_live_message_is_not_duplicated_by_history() {
        let (connector, mut servers) = MemoryConnector::new();
        let (api, release) = MockApi::new();
        let mut session =
            ChatSession::open(&create_test_config(), credentials(), api, Arc::new(connector))
                .unwrap();
        let server = servers.recv().await.unwrap();

        let live = WireMessage {
            sender_id: Some("u2".to_string()),
            content: Some("no id yet".to_string()),
            timestamp: Some("2024-05-01T10:00:00Z".to_string()),
            ..Default::default()
        };
        server.push(&receive_frame(&live));
        next_content_update(&mut session).await;

        let stored = WireMessage {
            id: Some("m4".to_string()),
            ..live.clone()
        };
        let other = WireMessage {
            content: Some("same time, other text".to_string()),
            ..live
        };
        release.send(Ok(vec![stored])).unwrap();
        next_content_update(&mut session).await;

        assert_eq!(contents(&session), vec!["no id yet"]);
        assert_eq!(
            session.snapshot().next().and_then(Message::id).map(MessageId::as_str),
            Some("m4")
        );

        // A different unkeyed message is still pushed through
        server.push(&receive_frame(&other));
        next_content_update(&mut session).await;
        assert_eq!(contents(&session), vec!["no id yet", "same time, other text"]);
    }

    #[tokio::test]
    async fn test_updates_follow_socket_delivery_order() {
        let (mut session, server) = open_with_history(Vec::new()).await;

        for round in 0..20 {
            let is_typing = round % 2 == 0;
            server.push(&format!(
                r#"{{"event":"typing","data":{{"senderId":"u2","isTyping":{}}}}}"#,
                is_typing
            ));
            server.push(&receive_frame(&wire(&format!("m{round}"), "u2", "hey")));

            assert_eq!(
                next_content_update(&mut session).await,
                SessionUpdate::RemoteTyping(is_typing)
            );
            assert!(matches!(
                next_content_update(&mut session).await,
                SessionUpdate::MessageReceived(ReconcileOutcome::Applied { .. })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_update_ends_when_connection_gives_up() {
        let (connector, _servers) = MemoryConnector::failing();
        let config = create_test_config().with_reconnect(RetryInfo::with_limits(2, 10, 100));
        let mut session = ChatSession::open(
            &config,
            credentials(),
            MockApi::with_history(Vec::new()),
            Arc::new(connector),
        )
        .unwrap();

        let mut updates = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(update) = session.next_update().await {
                updates.push(update);
            }
        })
        .await;

        assert!(drained.is_ok(), "next_update kept waiting: {:?}", updates);
        assert!(updates.contains(&SessionUpdate::HistoryLoaded { count: 0 }));
        let last_status = updates
            .iter()
            .rev()
            .find(|update| matches!(update, SessionUpdate::ConnectionChanged(_)));
        assert_eq!(
            last_status,
            Some(&SessionUpdate::ConnectionChanged(ConnectionStatus::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_history_failure_is_reported() {
        let (connector, mut servers) = MemoryConnector::new();
        let (api, release) = MockApi::new();
        let mut session =
            ChatSession::open(&create_test_config(), credentials(), api, Arc::new(connector))
                .unwrap();
        let _server = servers.recv().await.unwrap();

        release
            .send(Err(ChatError::Http {
                status: 503,
                url: "http://127.0.0.1:1/chat/messages/u2".to_string(),
            }))
            .unwrap();

        match next_content_update(&mut session).await {
            SessionUpdate::HistoryFailed { reason } => assert!(reason.contains("503")),
            other => panic!("unexpected update: {:?}", other),
        }
        assert!(matches!(session.history_state(), HistoryState::Failed(_)));
    }

    #[tokio::test]
    async fn test_remote_typing_scenario() {
        let (mut session, server) = open_with_history(Vec::new()).await;

        server.push(r#"{"event":"typing","data":{"senderId":"u3","isTyping":true}}"#);
        server.push(r#"{"event":"typing","data":{"senderId":"u2","isTyping":true}}"#);

        assert_eq!(
            next_content_update(&mut session).await,
            SessionUpdate::RemoteTyping(true)
        );
        assert!(session.remote_is_typing());

        server.push(r#"{"event":"typing","data":{"senderId":"u2","isTyping":false}}"#);
        assert_eq!(
            next_content_update(&mut session).await,
            SessionUpdate::RemoteTyping(false)
        );
        assert!(!session.remote_is_typing());
    }

    #[tokio::test]
    async fn test_typing_indicator_reaches_server() {
        let (mut session, mut server) = open_with_history(Vec::new()).await;

        session.send_typing_indicator(false).unwrap();

        assert_eq!(
            server.next_event().await,
            Some(OutboundEvent::Typing(crate::types::TypingPayload {
                receiver_id: "u2".to_string(),
                is_typing: false,
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_clears_typing_timer() {
        let (mut session, mut server) = open_with_history(Vec::new()).await;

        session.send_typing_indicator(true).unwrap();
        assert!(matches!(
            server.next_event().await,
            Some(OutboundEvent::Typing(_))
        ));

        session.close();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The socket closes without the auto-off ever being written
        assert_eq!(server.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_close_discards_late_history() {
        let (connector, mut servers) = MemoryConnector::new();
        let (api, release) = MockApi::new();
        let mut session =
            ChatSession::open(&create_test_config(), credentials(), api, Arc::new(connector))
                .unwrap();
        let _server = servers.recv().await.unwrap();

        session.close();
        // The fetch task may still be running; its result has nowhere to go
        let _ = release.send(Ok(vec![wire("m1", "u2", "late")]));
        tokio::task::yield_now().await;

        assert!(session.is_closed());
        assert_eq!(session.next_update().await, None);
        assert_eq!(session.snapshot().len(), 0);
        assert!(matches!(
            session.send_message("after close"),
            Err(ChatError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_load_peer_profile() {
        let (session, _server) = open_with_history(Vec::new()).await;

        let profile = session.load_peer_profile().await.unwrap();

        assert_eq!(profile.display_name(), "User u2 Test");
    }

    #[tokio::test]
    async fn test_snapshot_is_repeatable() {
        let (session, _server) =
            open_with_history(vec![wire("m1", "u2", "a"), wire("m2", "u1", "b")]).await;

        let snapshot = session.snapshot();
        let first: Vec<_> = snapshot.clone().collect();
        let second: Vec<_> = snapshot.collect();

        assert_eq!(first, second);
    }
}
