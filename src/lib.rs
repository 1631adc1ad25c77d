pub mod chat;
pub mod config;
pub mod error;
pub mod proctoring;
pub mod session;
pub mod signaling;

pub use error::{Result, SessionError};
pub use session::client::{SessionClient, SessionIdentity};
