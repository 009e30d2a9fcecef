//! Feed transport seam and its WebSocket implementation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use pipeline_core::{Error, Result};

/// Frame delivered to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Text(String),
    /// The server closed the connection.
    Close,
}

/// One open feed connection.
#[async_trait]
pub trait FeedTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next frame; `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<FeedFrame>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens feed connections.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>>;
}

/// Connector for the WebSocket market channel.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::transient(format!("connect {}: {e}", self.url)))?;
        debug!(url = %self.url, status = %response.status(), "feed connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::transient(format!("feed send: {e}")))
    }

    async fn next_frame(&mut self) -> Option<Result<FeedFrame>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(Error::transient(format!("feed read: {e}")))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(FeedFrame::Text(text))),
                Message::Ping(data) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(Error::transient(format!("feed pong: {e}"))));
                    }
                }
                Message::Close(frame) => {
                    debug!(?frame, "feed close frame");
                    return Some(Ok(FeedFrame::Close));
                }
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| Error::transient(format!("feed close: {e}")))
    }
}
