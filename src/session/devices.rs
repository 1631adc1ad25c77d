use crate::error::{Result, SessionError};

/// Handle to the local capture devices held for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub camera: bool,
    pub microphone: bool,
}

/// Boundary to the platform's capture devices. The session client never
/// talks to hardware directly; permission policy lives behind this
/// trait.
pub trait DeviceAccess: Send + Sync {
    /// Acquire camera and/or microphone. Denial is fatal to the joining
    /// client (the session is not entered), never to the room.
    fn acquire(&self, camera: bool, microphone: bool) -> Result<CaptureSession>;

    /// Release previously acquired devices. Must be callable during
    /// teardown regardless of session state.
    fn release(&self, session: CaptureSession);
}

/// Default access policy: the surrounding shell has already secured the
/// permissions, so acquisition always succeeds.
pub struct GrantedDevices;

impl DeviceAccess for GrantedDevices {
    fn acquire(&self, camera: bool, microphone: bool) -> Result<CaptureSession> {
        tracing::debug!(camera, microphone, "Acquired capture devices");
        Ok(CaptureSession { camera, microphone })
    }

    fn release(&self, session: CaptureSession) {
        tracing::debug!(
            camera = session.camera,
            microphone = session.microphone,
            "Released capture devices"
        );
    }
}

/// Access policy that refuses everything, for exercising the fatal-join
/// path.
pub struct DeniedDevices;

impl DeviceAccess for DeniedDevices {
    fn acquire(&self, _camera: bool, _microphone: bool) -> Result<CaptureSession> {
        Err(SessionError::device_denied("permission refused by user"))
    }

    fn release(&self, _session: CaptureSession) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted_devices() {
        let devices = GrantedDevices;
        let session = devices.acquire(true, false).unwrap();
        assert!(session.camera);
        assert!(!session.microphone);
        devices.release(session);
    }

    #[test]
    fn test_denied_devices() {
        let devices = DeniedDevices;
        let result = devices.acquire(true, true);
        assert!(matches!(result, Err(SessionError::DeviceAccessDenied(_))));
    }
}
