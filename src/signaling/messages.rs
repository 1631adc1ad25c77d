use serde::{Deserialize, Serialize};

use crate::proctoring::policy::PolicyPatch;
use crate::proctoring::{Severity, ViolationKind};
use crate::session::room::Role;

/// Target id meaning "every participant in the room" for policy pushes.
pub const BROADCAST_TARGET: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub camera_on: bool,
    #[serde(default)]
    pub microphone_on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    AttemptsExhausted,
    NetworkLost,
    HostEnded,
}

/// Messages a client sends to the signaling relay. The relay forwards the
/// peer-addressed ones (`offer`, `answer`, `candidate`) to `target_id` and
/// fans the room-scoped ones out to the whole room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        participant_id: String,
        display_name: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    Offer {
        target_id: String,
        sender_id: String,
        sdp: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        target_id: String,
        sender_id: String,
        sdp: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    Candidate {
        target_id: String,
        sender_id: String,
        candidate: IceCandidatePayload,
    },

    #[serde(rename_all = "camelCase")]
    MediaStatus {
        room_id: String,
        camera_on: bool,
        microphone_on: bool,
    },

    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        sender_id: String,
        text: String,
        /// Session-generated alert (e.g. proctoring offline), not
        /// participant chatter
        #[serde(default)]
        system: bool,
    },

    /// The payload's `kind` carries what the external detector calls the
    /// violation `type`; the key is renamed because `type` is already the
    /// event discriminant.
    #[serde(rename_all = "camelCase")]
    ViolationSignal {
        participant_id: String,
        kind: ViolationKind,
        severity: Severity,
        detected_at: u64,
    },

    /// Host-issued policy push; `target_id` is a participant id or
    /// [`BROADCAST_TARGET`].
    #[serde(rename_all = "camelCase")]
    PolicyUpdate {
        target_id: String,
        policy: PolicyPatch,
    },

    #[serde(rename_all = "camelCase")]
    DisconnectDirective {
        participant_id: String,
        reason: DisconnectReason,
    },
}

/// Events the relay delivers to a client. At-least-once delivery: every
/// handler must tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    #[serde(rename_all = "camelCase")]
    RoomParticipants { participants: Vec<ParticipantInfo> },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: ParticipantInfo },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },

    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: String,
        sdp: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: String,
        sdp: String,
        role: Role,
    },

    #[serde(rename_all = "camelCase")]
    Candidate {
        sender_id: String,
        candidate: IceCandidatePayload,
    },

    #[serde(rename_all = "camelCase")]
    MediaStatusUpdate {
        participant_id: String,
        camera_on: bool,
        microphone_on: bool,
    },

    #[serde(rename_all = "camelCase")]
    ChatMessage {
        sender_id: String,
        text: String,
        #[serde(default)]
        system: bool,
    },

    #[serde(rename_all = "camelCase")]
    ViolationSignal {
        participant_id: String,
        kind: ViolationKind,
        severity: Severity,
        detected_at: u64,
    },

    #[serde(rename_all = "camelCase")]
    PolicyUpdate {
        target_id: String,
        policy: PolicyPatch,
    },

    #[serde(rename_all = "camelCase")]
    DisconnectDirective {
        participant_id: String,
        reason: DisconnectReason,
    },
}
