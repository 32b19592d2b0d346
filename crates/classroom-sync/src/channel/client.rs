use futures_util::{SinkExt, StreamExt};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{ChannelHandle, ReadyState, WireFormat, DEFAULT_INBOUND_CAPACITY};
use crate::protocol::{decode_message, decode_text, encode_message, encode_text, ChannelMessage};
use crate::{SyncError, SyncResult};

/// Settings for a classroom WebSocket connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub wire_format: WireFormat,
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

/// WebSocket connection to a classroom relay
///
/// Dropping the client aborts its socket tasks.
pub struct ClassroomClient {
    handle: ChannelHandle,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    tasks: JoinSet<()>,
}

impl ClassroomClient {
    /// Connect to `url` with the default configuration
    pub async fn connect(url: &str) -> SyncResult<Self> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    /// Connect to `url`
    pub async fn connect_with(url: &str, config: ClientConfig) -> SyncResult<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::WebSocket(e.to_string()))?;

        info!("Connected to classroom channel at {}", url);

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let handle = ChannelHandle::new(ReadyState::Open, tx, config.inbound_capacity);
        let mut tasks = JoinSet::new();

        // Writer: drains the outbound queue into the socket
        {
            let handle = handle.clone();
            let wire_format = config.wire_format;
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        message = rx.recv() => {
                            let Some(message) = message else { break };
                            let frame = match encode_frame(&message, wire_format) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    error!("Failed to encode {} message: {}", message.action, e);
                                    continue;
                                }
                            };
                            if let Err(e) = ws_sender.send(frame).await {
                                error!("Failed to send message to classroom channel: {}", e);
                                break;
                            }
                        }
                        _ = &mut close_rx => {
                            if let Err(e) = ws_sender.send(Message::Close(None)).await {
                                debug!("Close frame not delivered: {}", e);
                            }
                            break;
                        }
                    }
                }
                handle.set_ready_state(ReadyState::Closed);
                debug!("Channel writer task ended");
            });
        }

        // Reader: fans inbound messages out to subscribers
        {
            let handle = handle.clone();
            tasks.spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    let decoded = match frame {
                        Ok(Message::Text(text)) => decode_text(&text),
                        Ok(Message::Binary(data)) => decode_message(&data),
                        Ok(Message::Close(_)) => {
                            info!("Classroom channel closed by server");
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                            continue;
                        }
                        Err(e) => {
                            warn!("Classroom channel error: {}", e);
                            break;
                        }
                    };

                    match decoded {
                        Ok(message) => {
                            handle.deliver(message);
                        }
                        Err(e) => {
                            debug!("Ignoring undecodable channel message: {}", e);
                        }
                    }
                }
                handle.set_ready_state(ReadyState::Closed);
                debug!("Channel reader task ended");
            });
        }

        Ok(Self {
            handle,
            close_tx: Mutex::new(Some(close_tx)),
            tasks,
        })
    }

    /// Get a handle to the channel
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.handle.ready_state()
    }

    /// Start closing the connection
    pub fn close(&self) {
        let close_tx = self.close_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(close_tx) = close_tx {
            self.handle.set_ready_state(ReadyState::Closing);
            let _ = close_tx.send(());
        }
    }

    /// Wait until both socket tasks have ended
    pub async fn closed(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Classroom channel task error: {}", e);
                }
            }
        }
        self.handle.set_ready_state(ReadyState::Closed);
    }
}

fn encode_frame(message: &ChannelMessage, wire_format: WireFormat) -> SyncResult<Message> {
    Ok(match wire_format {
        WireFormat::Json => Message::Text(encode_text(message)?),
        WireFormat::Lib0 => Message::Binary(encode_message(message)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, WhiteboardTarget};

    #[test]
    fn test_encode_frame_formats() {
        let message = ChannelMessage::code_change("bob", &WhiteboardTarget::Public, "x");

        match encode_frame(&message, WireFormat::Json).unwrap() {
            Message::Text(text) => assert_eq!(decode_text(&text).unwrap(), message),
            other => panic!("Expected text frame, got: {:?}", other),
        }

        match encode_frame(&message, WireFormat::Lib0).unwrap() {
            Message::Binary(data) => {
                let decoded: ChannelMessage = decode_message(&data).unwrap();
                assert_eq!(decoded.action, Action::CodeChange);
            }
            other => panic!("Expected binary frame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_to_missing_server_fails() {
        let result = ClassroomClient::connect("ws://127.0.0.1:9/ws/1").await;
        assert!(matches!(result, Err(SyncError::WebSocket(_))));
    }
}
