use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::signaling::messages::ParticipantInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Attendee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Joining,
    Connected,
    Disconnected,
}

/// One room member as seen from this client. Media flags are overwritten
/// wholesale by `media-status-update`, which is what makes duplicate
/// status messages harmless.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub camera_on: bool,
    pub microphone_on: bool,
    pub connection_state: ConnectionState,
}

impl From<ParticipantInfo> for Participant {
    fn from(info: ParticipantInfo) -> Self {
        Self {
            id: info.participant_id,
            display_name: info.display_name,
            role: info.role,
            camera_on: info.camera_on,
            microphone_on: info.microphone_on,
            connection_state: ConnectionState::Connected,
        }
    }
}

/// The room aggregate: the single owner of roster state for one session.
/// All roster reads and writes go through here, never through ambient
/// maps.
pub struct Room {
    id: String,
    participants: RwLock<HashMap<String, Participant>>,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            participants: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the roster from the relay's initial snapshot.
    pub async fn apply_roster(&self, roster: Vec<ParticipantInfo>) {
        let mut participants = self.participants.write().await;
        participants.clear();
        for info in roster {
            participants.insert(info.participant_id.clone(), info.into());
        }
        tracing::info!(
            room_id = %self.id,
            count = participants.len(),
            "Applied room roster"
        );
    }

    /// Insert a newly joined participant. Duplicate join events from the
    /// relay leave existing state untouched.
    pub async fn insert_participant(&self, info: ParticipantInfo) -> bool {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&info.participant_id) {
            tracing::debug!(
                participant_id = %info.participant_id,
                "Duplicate participant-joined ignored"
            );
            return false;
        }

        tracing::info!(
            participant_id = %info.participant_id,
            room_id = %self.id,
            "Participant joined room"
        );
        participants.insert(info.participant_id.clone(), info.into());
        true
    }

    pub async fn remove_participant(&self, participant_id: &str) -> Option<Participant> {
        let mut participants = self.participants.write().await;
        let removed = participants.remove(participant_id);
        if removed.is_some() {
            tracing::info!(
                participant_id = %participant_id,
                room_id = %self.id,
                "Participant left room"
            );
        }
        removed
    }

    /// Overwrite a participant's media flags. Idempotent by construction.
    pub async fn set_media_status(
        &self,
        participant_id: &str,
        camera_on: bool,
        microphone_on: bool,
    ) -> bool {
        let mut participants = self.participants.write().await;
        match participants.get_mut(participant_id) {
            Some(participant) => {
                participant.camera_on = camera_on;
                participant.microphone_on = microphone_on;
                true
            }
            None => false,
        }
    }

    pub async fn set_connection_state(&self, participant_id: &str, state: ConnectionState) {
        let mut participants = self.participants.write().await;
        if let Some(participant) = participants.get_mut(participant_id) {
            participant.connection_state = state;
        }
    }

    pub async fn participant(&self, participant_id: &str) -> Option<Participant> {
        let participants = self.participants.read().await;
        participants.get(participant_id).cloned()
    }

    pub async fn contains(&self, participant_id: &str) -> bool {
        let participants = self.participants.read().await;
        participants.contains_key(participant_id)
    }

    pub async fn participants(&self) -> Vec<Participant> {
        let participants = self.participants.read().await;
        participants.values().cloned().collect()
    }

    pub async fn participant_ids(&self) -> Vec<String> {
        let participants = self.participants.read().await;
        participants.keys().cloned().collect()
    }

    pub async fn host_id(&self) -> Option<String> {
        let participants = self.participants.read().await;
        participants
            .values()
            .find(|p| p.role == Role::Host)
            .map(|p| p.id.clone())
    }

    pub async fn is_empty(&self) -> bool {
        let participants = self.participants.read().await;
        participants.is_empty()
    }
}
