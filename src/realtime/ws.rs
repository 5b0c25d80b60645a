use crate::error::AppError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type PushWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(Vec<u8>),
    Closed(Option<String>),
}

/// One open transport connection.
#[async_trait]
pub trait PushLink: Send {
    async fn send_text(&mut self, payload: String) -> Result<(), AppError>;

    /// `None` once the transport has ended.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, AppError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn PushLink>, AppError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn PushLink>, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let (stream, _) =
            connect_async_with_config(endpoint.as_str().to_string(), Some(ws_config), true)
                .await?;
        Ok(Box::new(WsLink { stream }))
    }
}

pub struct WsLink {
    stream: PushWsStream,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send_text(&mut self, payload: String) -> Result<(), AppError> {
        self.stream.send(Message::Text(payload)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, AppError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(error.into())),
            };
            match message {
                Message::Text(text_payload) => {
                    return Some(Ok(InboundFrame::Text(text_payload.into_bytes())))
                }
                Message::Binary(binary_payload) => {
                    return Some(Ok(InboundFrame::Text(binary_payload)))
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    return Some(Ok(InboundFrame::Closed(reason)));
                }
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
