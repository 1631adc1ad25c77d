use thiserror::Error;

/// Custom error types for the exam session client
#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer negotiation errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP format: {0}")]
    InvalidSdp(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescriptionFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Negotiation failed for link to {0}")]
    NegotiationFailed(String),

    #[error("Invalid link transition from {from:?} to {to:?} for {remote_id}")]
    InvalidLinkTransition {
        remote_id: String,
        from: crate::session::link::NegotiationState,
        to: crate::session::link::NegotiationState,
    },

    /// Room and roster errors
    #[error("Not joined to any room")]
    RoomNotJoined,

    #[error("Participant {0} not found")]
    ParticipantNotFound(String),

    #[error("Link to peer {0} not found")]
    LinkNotFound(String),

    /// Local capture errors
    #[error("Camera/microphone access denied: {0}")]
    DeviceAccessDenied(String),

    /// Proctoring errors
    #[error("Frame detector unavailable: {0}")]
    DetectorUnavailable(String),

    /// Relay transport errors
    #[error("Failed to connect to signaling relay: {0}")]
    RelayConnectionFailed(String),

    #[error("Signaling relay connection closed")]
    RelayClosed,

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Internal session error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience type alias for Results using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        SessionError::Internal(msg.into())
    }

    /// Helper to create device-access errors
    pub fn device_denied(msg: impl Into<String>) -> Self {
        SessionError::DeviceAccessDenied(msg.into())
    }

    /// Helper to create detector-unavailable errors
    pub fn detector(msg: impl Into<String>) -> Self {
        SessionError::DetectorUnavailable(msg.into())
    }
}

/// Convert webrtc::Error to SessionError
impl From<webrtc::Error> for SessionError {
    fn from(err: webrtc::Error) -> Self {
        SessionError::NegotiationFailed(err.to_string())
    }
}
