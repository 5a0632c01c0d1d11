//! WebSocket signaling connection
//!
//! A writer task drains the outbound queue into the socket, a reader task
//! decodes inbound frames into [`SignalingEvent`]s.

use super::message::{self, OutboundMessage};
use super::{ChannelRole, SignalingClient, SignalingClientConfig, SignalingError, SignalingEvent};
use crate::peer::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Build the connect URL for a signaling channel
pub fn connect_url(config: &SignalingClientConfig) -> Result<String, SignalingError> {
    let mut params = vec![("X-Amz-ChannelARN", config.channel_id.as_str())];
    if config.role == ChannelRole::Viewer {
        let client_id = config
            .client_id
            .as_deref()
            .ok_or_else(|| SignalingError::ConnectionFailed("Viewer role requires a client id".to_string()))?;
        params.push(("X-Amz-ClientId", client_id));
    }

    reqwest::Url::parse_with_params(&config.wss_endpoint, &params)
        .map(|url| url.to_string())
        .map_err(|e| SignalingError::ConnectionFailed(format!("Invalid endpoint {}: {}", config.wss_endpoint, e)))
}

pub struct WsSignalingClient {
    config: SignalingClientConfig,
    writer: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
}

impl WsSignalingClient {
    pub fn new(config: SignalingClientConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
        }
    }

    fn queue(&self, frame: OutboundMessage) -> Result<(), SignalingError> {
        let writer = self.writer.as_ref().ok_or(SignalingError::Closed)?;
        writer.send(frame.to_json()?).map_err(|_| SignalingError::Closed)
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        if self.writer.is_some() {
            return Err(SignalingError::ConnectionFailed("Connection already open".to_string()));
        }

        let url = connect_url(&self.config)?;
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(format!("WebSocket connect failed: {}", e)))?;
        info!("Signaling connection open for channel {}", self.config.channel_id);

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer ends, and closes the socket, once every sender is dropped
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        let _ = event_tx.send(SignalingEvent::Open);

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => match message::decode(&text) {
                        Ok(Some(event)) => {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(SignalingEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            debug!("Signaling reader finished");
            let _ = event_tx.send(SignalingEvent::Close);
        });

        self.writer = Some(out_tx);
        self.reader = Some(reader);
        Ok(event_rx)
    }

    async fn send_sdp_answer(&self, answer: &SessionDescription, viewer_id: &str) -> Result<(), SignalingError> {
        self.queue(OutboundMessage::sdp_answer(answer, viewer_id)?)
    }

    async fn send_ice_candidate(&self, candidate: &IceCandidate, viewer_id: &str) -> Result<(), SignalingError> {
        self.queue(OutboundMessage::ice_candidate(candidate, viewer_id)?)
    }

    async fn close(&mut self) -> Result<(), SignalingError> {
        self.writer.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
            info!("Signaling connection closed for channel {}", self.config.channel_id);
        }
        Ok(())
    }
}
