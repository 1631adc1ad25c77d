pub mod client;
pub mod devices;
pub mod link;
pub mod media;
pub mod mesh;
pub mod room;
pub mod rtc;

pub use client::SessionClient;
pub use devices::{CaptureSession, DeviceAccess, GrantedDevices};
pub use link::{NegotiationState, PeerLink};
pub use mesh::MeshManager;
pub use room::{ConnectionState, Participant, Role, Room};
