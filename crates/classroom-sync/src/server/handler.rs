use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::RelayState;
use crate::protocol::{decode_message, decode_text, encode_message, encode_text, ChannelMessage};

/// Handles the WebSocket connection of one classroom participant
pub struct WebSocketHandler {
    socket: WebSocket,
    state: RelayState,
    classroom_id: String,
}

impl WebSocketHandler {
    pub fn new(socket: WebSocket, state: RelayState, classroom_id: String) -> Self {
        Self {
            socket,
            state,
            classroom_id,
        }
    }

    /// Handle the WebSocket connection
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();

        let connection_id = self
            .state
            .connections()
            .register_connection(&self.classroom_id, tx)
            .await;

        info!(
            "New WebSocket connection {} for classroom '{}'",
            connection_id, self.classroom_id
        );

        // Replies mirror the frame type the client last sent
        let binary = Arc::new(AtomicBool::new(false));

        let sender_task = {
            let connection_id = connection_id.clone();
            let binary = binary.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let frame = if binary.load(Ordering::Relaxed) {
                        encode_message(&message).map(|data| Message::Binary(data.into()))
                    } else {
                        encode_text(&message).map(|text| Message::Text(text.into()))
                    };

                    match frame {
                        Ok(frame) => {
                            if let Err(e) = ws_sender.send(frame).await {
                                error!(
                                    "Failed to send WebSocket message to connection {}: {}",
                                    connection_id, e
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            error!(
                                "Failed to encode {} message for connection {}: {}",
                                message.action, connection_id, e
                            );
                        }
                    }
                }
                debug!("Sender task ended for connection {}", connection_id);
            })
        };

        let receiver_task = {
            let state = self.state.clone();
            let classroom_id = self.classroom_id.clone();
            let connection_id = connection_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    let decoded = match msg {
                        Ok(Message::Text(text)) => {
                            binary.store(false, Ordering::Relaxed);
                            decode_text(text.as_str())
                        }
                        Ok(Message::Binary(data)) => {
                            binary.store(true, Ordering::Relaxed);
                            decode_message(&data)
                        }
                        Ok(Message::Close(_)) => {
                            info!("Connection {} closed normally", connection_id);
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                        Err(e) => {
                            warn!("WebSocket error for connection {}: {}", connection_id, e);
                            break;
                        }
                    };

                    let result = match decoded {
                        Ok(message) => {
                            handle_client_message(&state, &classroom_id, &connection_id, message)
                                .await
                        }
                        Err(e) => Err(e),
                    };

                    if let Err(e) = result {
                        warn!("Error handling message from connection {}: {}", connection_id, e);
                        state
                            .connections()
                            .send_to_connection(&connection_id, ChannelMessage::error(e.to_string()))
                            .await;
                    }
                }
                debug!("Receiver task ended for connection {}", connection_id);
            })
        };

        let completion_reason = tokio::select! {
            _ = sender_task => "sender task completed",
            _ = receiver_task => "receiver task completed",
        };

        info!(
            "WebSocket connection ending for connection {} ({})",
            connection_id, completion_reason
        );

        let departures = self
            .state
            .classrooms()
            .disconnect(&self.classroom_id, &connection_id);
        self.state.deliver(departures).await;
        self.state
            .connections()
            .unregister_connection(&connection_id)
            .await;
    }
}

async fn handle_client_message(
    state: &RelayState,
    classroom_id: &str,
    connection_id: &str,
    message: ChannelMessage,
) -> crate::SyncResult<()> {
    debug!(
        "Connection {} sent {} to classroom '{}'",
        connection_id, message.action, classroom_id
    );

    let deliveries = state
        .classrooms()
        .dispatch(classroom_id, connection_id, message)?;
    state.deliver(deliveries).await;
    Ok(())
}
