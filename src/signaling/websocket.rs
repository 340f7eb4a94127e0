use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{SignalingConnector, SignalingLink};
use crate::error::Error;

/// Connects to the signaling server over a WebSocket carrying JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingLink, Error> {
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        tracing::info!("WebSocket connected to {}", self.url);

        let (mut write, mut read) = stream.split();
        let (outgoing_sender, mut outgoing_receiver) = mpsc::unbounded_channel::<String>();
        let (incoming_sender, incoming_receiver) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing_receiver.recv().await {
                if let Err(err) = write.send(Message::Text(text)).await {
                    tracing::error!("failed to write signaling frame: {}", err);
                    break;
                }
            }
            let _ = write.close().await;
            tracing::debug!("WebSocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if incoming_sender.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        tracing::info!("WebSocket closed by server: {:?}", reason);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("WebSocket read error: {}", err);
                        break;
                    }
                }
            }
            tracing::debug!("WebSocket reader finished");
        });

        Ok(SignalingLink {
            sender: outgoing_sender,
            receiver: incoming_receiver,
        })
    }
}
