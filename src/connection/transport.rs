use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};

use crate::error::{ChatError, Result};

/// Write half of a socket, one JSON text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChatError> + Send>>;

/// Read half of a socket, one JSON text frame per item.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open, authenticated socket.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens socket links. The connection state machine calls this once per
/// connect or reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<Link>;
}

/// WebSocket transport over `tokio-tungstenite`, authenticated with a bearer header.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Link> {
        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ChatError::Configuration("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, response) = connect_async(request).await?;
        tracing::debug!(
            target: "rentchat::connection::transport::connect",
            "WebSocket handshake completed with status {}",
            response.status()
        );

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(ChatError::from)
            .with(|frame: String| async move { Ok::<_, ChatError>(WsMessage::Text(frame)) });

        let stream = read.filter_map(|message| async move {
            match message {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(
                        target: "rentchat::connection::transport::read",
                        "Server closed the socket: {:?}",
                        frame
                    );
                    Some(Err(ChatError::ConnectionClosed))
                }
                // Pings are answered by tungstenite itself; binary frames carry nothing for us
                Ok(_) => None,
                Err(e) => Some(Err(ChatError::from(e))),
            }
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
