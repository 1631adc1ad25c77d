use std::collections::VecDeque;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::session::room::Role;
use crate::signaling::messages::ClientMessage;
use crate::signaling::relay::RelayHandle;

/// How many chat entries are retained in memory.
pub const CHAT_LOG_CAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAuthor {
    Participant(String),
    /// Injected by the session itself (violation alerts, notices)
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub author: ChatAuthor,
    pub text: String,
    /// System-authored violation alerts are shown to the host only
    pub host_only: bool,
}

/// Chat and alert channel for one room.
///
/// Fan-out is the relay's job; a sent message comes back through the
/// relay like everyone else's, so the local UI needs no echo special
/// case. Ordering holds per sender (one writer channel per client),
/// never across senders.
pub struct ChatChannel {
    room_id: String,
    local_id: String,
    role: Role,
    relay: RelayHandle,
    log: RwLock<VecDeque<ChatEntry>>,
}

impl ChatChannel {
    pub fn new(room_id: String, local_id: String, role: Role, relay: RelayHandle) -> Self {
        Self {
            room_id,
            local_id,
            role,
            relay,
            log: RwLock::new(VecDeque::with_capacity(CHAT_LOG_CAP)),
        }
    }

    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.relay.send(ClientMessage::ChatMessage {
            room_id: self.room_id.clone(),
            sender_id: self.local_id.clone(),
            text: text.into(),
            system: false,
        })
    }

    /// Publish a session-generated alert to the room, tagged so
    /// receivers log it as system-authored rather than chatter.
    pub fn send_system(&self, text: impl Into<String>) -> Result<()> {
        self.relay.send(ClientMessage::ChatMessage {
            room_id: self.room_id.clone(),
            sender_id: self.local_id.clone(),
            text: text.into(),
            system: true,
        })
    }

    /// Log a relay-delivered message. System-tagged messages enter the
    /// log as host-only system entries, never as participant chatter.
    pub async fn on_message(&self, sender_id: &str, text: &str, system: bool) {
        if system {
            self.push(ChatEntry {
                author: ChatAuthor::System,
                text: text.to_string(),
                host_only: true,
            })
            .await;
            return;
        }

        self.push(ChatEntry {
            author: ChatAuthor::Participant(sender_id.to_string()),
            text: text.to_string(),
            host_only: false,
        })
        .await;
    }

    /// Inject a system-authored alert, visible to the host only.
    pub async fn system_alert(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(alert = %text, "System chat alert");
        self.push(ChatEntry {
            author: ChatAuthor::System,
            text,
            host_only: true,
        })
        .await;
    }

    /// Inject a system-authored notice visible to everyone, e.g. the
    /// custom message attached to a policy push.
    pub async fn system_notice(&self, text: impl Into<String>) {
        self.push(ChatEntry {
            author: ChatAuthor::System,
            text: text.into(),
            host_only: false,
        })
        .await;
    }

    async fn push(&self, entry: ChatEntry) {
        let mut log = self.log.write().await;
        log.push_back(entry);
        while log.len() > CHAT_LOG_CAP {
            log.pop_front();
        }
    }

    /// Entries visible to this client: attendees never see host-only
    /// system alerts.
    pub async fn visible_entries(&self) -> Vec<ChatEntry> {
        let log = self.log.read().await;
        log.iter()
            .filter(|entry| self.role == Role::Host || !entry.host_only)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel(role: Role) -> (ChatChannel, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chat = ChatChannel::new(
            "123456".to_string(),
            "att_1".to_string(),
            role,
            RelayHandle::new(tx),
        );
        (chat, rx)
    }

    #[tokio::test]
    async fn test_send_goes_through_relay_not_local_log() {
        let (chat, mut rx) = channel(Role::Attendee);

        chat.send("hello").unwrap();

        // The message only enters the log when the relay echoes it back
        assert!(chat.visible_entries().await.is_empty());
        match rx.recv().await.unwrap() {
            ClientMessage::ChatMessage { sender_id, text, .. } => {
                assert_eq!(sender_id, "att_1");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_system_alerts_are_host_only() {
        let (host_chat, _rx) = channel(Role::Host);
        host_chat.on_message("att_2", "hi", false).await;
        host_chat.system_alert("att_2 used attempt 2 of 3").await;

        let visible = host_chat.visible_entries().await;
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[1].author, ChatAuthor::System);

        let (attendee_chat, _rx) = channel(Role::Attendee);
        attendee_chat.on_message("att_2", "hi", false).await;
        attendee_chat.system_alert("should stay hidden").await;

        let visible = attendee_chat.visible_entries().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].author, ChatAuthor::Participant("att_2".to_string()));
    }

    #[tokio::test]
    async fn test_system_tagged_message_is_hidden_from_attendees() {
        // e.g. the detector poller's proctoring-offline notice
        let (host_chat, _rx) = channel(Role::Host);
        host_chat
            .on_message("att_2", "proctoring offline: frame detector unreachable", true)
            .await;

        let visible = host_chat.visible_entries().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].author, ChatAuthor::System);
        assert!(visible[0].host_only);

        let (attendee_chat, _rx) = channel(Role::Attendee);
        attendee_chat
            .on_message("att_2", "proctoring offline: frame detector unreachable", true)
            .await;
        assert!(attendee_chat.visible_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_system_sets_the_wire_tag() {
        let (chat, mut rx) = channel(Role::Attendee);
        chat.send_system("proctoring offline").unwrap();

        match rx.recv().await.unwrap() {
            ClientMessage::ChatMessage { system, text, .. } => {
                assert!(system);
                assert_eq!(text, "proctoring offline");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let (chat, _rx) = channel(Role::Host);
        for i in 0..(CHAT_LOG_CAP + 20) {
            chat.on_message("att_2", &format!("message {i}"), false).await;
        }

        let visible = chat.visible_entries().await;
        assert_eq!(visible.len(), CHAT_LOG_CAP);
        assert_eq!(visible[0].text, "message 20");
    }
}
