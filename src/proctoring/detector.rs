use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::policy::{CheckKind, DetectionPolicy, PolicyPatch};
use super::{Severity, ViolationKind};
use crate::error::{Result, SessionError};
use crate::signaling::messages::ClientMessage;
use crate::signaling::relay::RelayHandle;

/// One frame-level result from the external detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCheck {
    pub subject_count: u32,
    pub gaze_deviation: bool,
    pub eyes_visible: bool,
    pub hand_near_face: bool,
}

/// Reduce a frame check to at most one violation, under a fixed
/// precedence: absence > multiple subjects > gaze > eyes > hand. A
/// single frame can trip several checks at once; reporting only the
/// highest keeps compound detections from flooding the budget.
pub fn classify(
    check: &FrameCheck,
    enabled: &std::collections::HashSet<CheckKind>,
) -> Option<(ViolationKind, Severity)> {
    if check.subject_count == 0 && enabled.contains(&CheckKind::Absence) {
        return Some((ViolationKind::Absence, Severity::High));
    }
    if check.subject_count > 1 && enabled.contains(&CheckKind::MultipleSubjects) {
        return Some((ViolationKind::MultipleSubjects, Severity::High));
    }
    if check.subject_count == 0 || check.subject_count > 1 {
        // The head-count conditions mask the face-level flags even when
        // their own checks are disabled; face metrics from a wrong-count
        // frame are meaningless.
        return None;
    }
    if check.gaze_deviation && enabled.contains(&CheckKind::GazeDeviation) {
        return Some((ViolationKind::GazeDeviation, Severity::Medium));
    }
    if !check.eyes_visible && enabled.contains(&CheckKind::EyesNotVisible) {
        return Some((ViolationKind::EyesNotVisible, Severity::Medium));
    }
    if check.hand_near_face && enabled.contains(&CheckKind::HandNearFace) {
        return Some((ViolationKind::HandNearFace, Severity::Low));
    }
    None
}

/// HTTP client for the external frame detector.
pub struct DetectorClient {
    http: reqwest::Client,
    endpoint: String,
}

impl DetectorClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub async fn check_frame(&self) -> Result<FrameCheck> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| SessionError::DetectorUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::DetectorUnavailable(format!(
                "detector returned {}",
                response.status()
            )));
        }

        response
            .json::<FrameCheck>()
            .await
            .map_err(|e| SessionError::DetectorUnavailable(e.to_string()))
    }
}

/// Attendee-side translator between detector output and the host's
/// budget engine. Holds the locally cached policy pushed by the control
/// plane; it never touches a budget itself, it only reports candidates
/// upstream.
pub struct DetectorTranslator {
    local_id: String,
    relay: RelayHandle,
    policy: RwLock<DetectionPolicy>,
    offline: AtomicBool,
}

impl DetectorTranslator {
    pub fn new(local_id: String, relay: RelayHandle, policy: DetectionPolicy) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            relay,
            policy: RwLock::new(policy),
            offline: AtomicBool::new(false),
        })
    }

    /// Apply a pushed policy to the local cache. Returns the custom
    /// message to surface to the user, if the push carried one.
    pub async fn apply_policy(&self, patch: &PolicyPatch) -> Option<String> {
        let mut policy = self.policy.write().await;
        patch.apply_to(&mut policy);
        tracing::info!(
            enabled = policy.enabled_checks.len(),
            "Applied pushed detection policy"
        );
        patch.custom_message.clone()
    }

    pub async fn cached_policy(&self) -> DetectionPolicy {
        self.policy.read().await.clone()
    }

    /// True while the external detector is unreachable.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Evaluate one detector tick. A reachable detector yields zero or
    /// one violation signal; an unreachable one flips the offline flag
    /// instead of fabricating violations. Returns true on the tick that
    /// transitions into offline, so the caller can inform the host once.
    pub async fn tick(&self, detector: &DetectorClient) -> Result<bool> {
        match detector.check_frame().await {
            Ok(check) => {
                if self.offline.swap(false, Ordering::Relaxed) {
                    tracing::info!("Frame detector reachable again, proctoring resumed");
                }

                let enabled = self.policy.read().await.enabled_checks.clone();
                if let Some((kind, severity)) = classify(&check, &enabled) {
                    let detected_at = unix_millis();
                    tracing::debug!(?kind, ?severity, "Detector tick produced violation candidate");
                    self.relay.send(ClientMessage::ViolationSignal {
                        participant_id: self.local_id.clone(),
                        kind,
                        severity,
                        detected_at,
                    })?;
                }
                Ok(false)
            }
            Err(e) => {
                let went_offline = !self.offline.swap(true, Ordering::Relaxed);
                if went_offline {
                    tracing::warn!(error = %e, "Frame detector unreachable, proctoring offline");
                }
                Ok(went_offline)
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Poll the detector on a fixed interval until the task is aborted.
/// The transition into offline is reported to the host as a system chat
/// notice so monitoring is never silently degraded.
pub fn spawn_poller(
    translator: Arc<DetectorTranslator>,
    detector: DetectorClient,
    room_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match translator.tick(&detector).await {
                Ok(true) => {
                    let notice = ClientMessage::ChatMessage {
                        room_id: room_id.clone(),
                        sender_id: translator.local_id.clone(),
                        text: "proctoring offline: frame detector unreachable".to_string(),
                        system: true,
                    };
                    if translator.relay.send(notice).is_err() {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Detector tick failed to report");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::ClientMessage;
    use tokio::sync::mpsc;

    fn present() -> FrameCheck {
        FrameCheck {
            subject_count: 1,
            gaze_deviation: false,
            eyes_visible: true,
            hand_near_face: false,
        }
    }

    #[test]
    fn test_clean_frame_yields_nothing() {
        assert_eq!(classify(&present(), &CheckKind::all()), None);
    }

    #[test]
    fn test_precedence_absence_first() {
        let check = FrameCheck {
            subject_count: 0,
            gaze_deviation: true,
            eyes_visible: false,
            hand_near_face: true,
        };
        assert_eq!(
            classify(&check, &CheckKind::all()),
            Some((ViolationKind::Absence, Severity::High))
        );
    }

    #[test]
    fn test_precedence_multiple_over_face_flags() {
        let check = FrameCheck {
            subject_count: 2,
            gaze_deviation: true,
            eyes_visible: false,
            hand_near_face: true,
        };
        assert_eq!(
            classify(&check, &CheckKind::all()),
            Some((ViolationKind::MultipleSubjects, Severity::High))
        );
    }

    #[test]
    fn test_precedence_gaze_over_eyes_and_hand() {
        let check = FrameCheck {
            gaze_deviation: true,
            eyes_visible: false,
            hand_near_face: true,
            ..present()
        };
        assert_eq!(
            classify(&check, &CheckKind::all()),
            Some((ViolationKind::GazeDeviation, Severity::Medium))
        );

        let check = FrameCheck {
            eyes_visible: false,
            hand_near_face: true,
            ..present()
        };
        assert_eq!(
            classify(&check, &CheckKind::all()),
            Some((ViolationKind::EyesNotVisible, Severity::Medium))
        );

        let check = FrameCheck {
            hand_near_face: true,
            ..present()
        };
        assert_eq!(
            classify(&check, &CheckKind::all()),
            Some((ViolationKind::HandNearFace, Severity::Low))
        );
    }

    #[test]
    fn test_disabled_checks_are_skipped() {
        let check = FrameCheck {
            gaze_deviation: true,
            hand_near_face: true,
            ..present()
        };

        let mut enabled = CheckKind::all();
        enabled.remove(&CheckKind::GazeDeviation);
        assert_eq!(
            classify(&check, &enabled),
            Some((ViolationKind::HandNearFace, Severity::Low))
        );

        assert_eq!(classify(&check, &std::collections::HashSet::new()), None);
    }

    #[tokio::test]
    async fn test_unreachable_detector_goes_offline_without_violations() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let translator = DetectorTranslator::new(
            "att_1".to_string(),
            RelayHandle::new(tx),
            DetectionPolicy::default(),
        );
        // Nothing is listening on this port
        let detector = DetectorClient::new("http://127.0.0.1:9/check");

        let went_offline = translator.tick(&detector).await.unwrap();
        assert!(went_offline);
        assert!(translator.is_offline());

        // Second failed tick does not re-report
        let went_offline = translator.tick(&detector).await.unwrap();
        assert!(!went_offline);

        // No violation signal was fabricated
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_policy_push_updates_cache_and_surfaces_message() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let translator = DetectorTranslator::new(
            "att_1".to_string(),
            RelayHandle::new(tx),
            DetectionPolicy::default(),
        );

        let patch = PolicyPatch {
            enabled_checks: Some(std::collections::HashSet::new()),
            custom_message: Some("stay centered in frame".to_string()),
            ..PolicyPatch::default()
        };

        let message = translator.apply_policy(&patch).await;
        assert_eq!(message.as_deref(), Some("stay centered in frame"));
        assert!(translator.cached_policy().await.enabled_checks.is_empty());
    }

    #[tokio::test]
    async fn test_candidate_is_sent_upstream_not_accounted_locally() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let translator = DetectorTranslator::new(
            "att_1".to_string(),
            RelayHandle::new(tx),
            DetectionPolicy::default(),
        );

        // Drive the translation path directly; the HTTP layer is covered
        // by the offline test above.
        let enabled = translator.cached_policy().await.enabled_checks;
        let check = FrameCheck {
            subject_count: 0,
            ..present()
        };
        let (kind, severity) = classify(&check, &enabled).unwrap();
        translator
            .relay
            .send(ClientMessage::ViolationSignal {
                participant_id: "att_1".to_string(),
                kind,
                severity,
                detected_at: 42,
            })
            .unwrap();

        match rx.recv().await.unwrap() {
            ClientMessage::ViolationSignal {
                participant_id,
                kind,
                ..
            } => {
                assert_eq!(participant_id, "att_1");
                assert_eq!(kind, ViolationKind::Absence);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
