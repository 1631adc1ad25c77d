use tokio::sync::RwLock;

use super::mesh::MeshManager;
use super::room::Room;
use crate::error::Result;
use crate::signaling::messages::ClientMessage;
use crate::signaling::relay::RelayHandle;

/// Media-status synchronizer: broadcasts local camera/microphone
/// toggles and applies peers' status updates to the roster.
///
/// Updates overwrite state wholesale, so redelivered status messages
/// from the relay are harmless.
pub struct MediaSync {
    room_id: String,
    relay: RelayHandle,
    camera_on: RwLock<bool>,
    microphone_on: RwLock<bool>,
}

impl MediaSync {
    pub fn new(room_id: String, relay: RelayHandle) -> Self {
        Self {
            room_id,
            relay,
            camera_on: RwLock::new(true),
            microphone_on: RwLock::new(true),
        }
    }

    /// Toggle local capture state and broadcast it to the room.
    pub async fn set_local_media(&self, camera_on: bool, microphone_on: bool) -> Result<()> {
        *self.camera_on.write().await = camera_on;
        *self.microphone_on.write().await = microphone_on;

        tracing::info!(camera_on, microphone_on, "Broadcasting local media status");
        self.relay.send(ClientMessage::MediaStatus {
            room_id: self.room_id.clone(),
            camera_on,
            microphone_on,
        })
    }

    pub async fn local_status(&self) -> (bool, bool) {
        (*self.camera_on.read().await, *self.microphone_on.read().await)
    }

    /// Apply a peer's status update. When their camera went off, the
    /// rendered track for their link is dropped so no stale frame stays
    /// on screen; the link itself is untouched.
    pub async fn apply_update(
        &self,
        room: &Room,
        mesh: &MeshManager,
        participant_id: &str,
        camera_on: bool,
        microphone_on: bool,
    ) {
        if !room
            .set_media_status(participant_id, camera_on, microphone_on)
            .await
        {
            tracing::debug!(
                participant_id = %participant_id,
                "Media status for unknown participant ignored"
            );
            return;
        }

        if !camera_on {
            if let Some(link) = mesh.link(participant_id).await {
                link.clear_remote_track().await;
            }
        }
    }
}
