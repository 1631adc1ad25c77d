use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::messages::{ClientMessage, RelayEvent};
use crate::error::{Result, SessionError};

/// Cloneable handle for sending messages to the signaling relay.
///
/// All of a client's outbound traffic funnels through one unbounded
/// channel into a single writer task, which is what gives the per-sender
/// ordering guarantee for chat and negotiation messages.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RelayHandle {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| SessionError::RelayClosed)
    }
}

/// Connect to the signaling relay over websocket.
///
/// Returns a send handle plus the stream of decoded relay events. The
/// writer and reader tasks run until either side of the socket closes;
/// the event channel closing is the client's signal that the relay is
/// gone.
pub async fn connect(url: &str) -> Result<(RelayHandle, mpsc::UnboundedReceiver<RelayEvent>)> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SessionError::RelayConnectionFailed(e.to_string()))?;

    tracing::info!(url = %url, "Connected to signaling relay");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize relay message");
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                tracing::error!(error = %e, "Failed to send relay message");
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            raw_message = %text,
                            "Failed to parse relay event"
                        );
                    }
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("Relay closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Relay websocket error");
                    break;
                }
            }
        }
    });

    Ok((RelayHandle::new(out_tx), event_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::room::Role;

    #[tokio::test]
    async fn test_handle_send_fails_after_receiver_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RelayHandle::new(tx);
        drop(rx);

        let result = handle.send(ClientMessage::JoinRoom {
            room_id: "123456".to_string(),
            participant_id: "att_1".to_string(),
            display_name: "Alice".to_string(),
            role: Role::Attendee,
        });
        assert!(matches!(result, Err(SessionError::RelayClosed)));
    }

    #[tokio::test]
    async fn test_handle_preserves_send_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = RelayHandle::new(tx);

        for i in 0..5 {
            handle
                .send(ClientMessage::ChatMessage {
                    room_id: "123456".to_string(),
                    sender_id: "att_1".to_string(),
                    text: format!("message {i}"),
                    system: false,
                })
                .unwrap();
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                ClientMessage::ChatMessage { text, .. } => {
                    assert_eq!(text, format!("message {i}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
