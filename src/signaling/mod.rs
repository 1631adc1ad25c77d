pub mod messages;
pub mod relay;

pub use messages::{ClientMessage, DisconnectReason, IceCandidatePayload, ParticipantInfo, RelayEvent, BROADCAST_TARGET};
pub use relay::RelayHandle;
