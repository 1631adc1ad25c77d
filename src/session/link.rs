use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::{Result, SessionError};
use crate::signaling::messages::{ClientMessage, IceCandidatePayload};
use crate::signaling::relay::RelayHandle;

/// Negotiation lifecycle of one link. `Failed` and `Closed` are
/// terminal; a replacement link starts over at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Stable,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    pub fn can_transition(self, to: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, to) {
            (Idle, Offering) | (Idle, Answering) => true,
            (Offering, Stable) | (Answering, Stable) => true,
            (from, Failed) | (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Deterministic initiator tie-break over participant ids: the
/// lexicographically smaller id keeps its offer when both sides raced.
/// Join/offer handlers share this one rule instead of scattering
/// duplicate checks.
pub fn initiates(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Reference to the remote media currently rendered for a peer. Cleared
/// when the peer's camera goes off so no stale last frame survives.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: String,
}

/// One negotiated direct connection to a single remote participant.
pub struct PeerLink {
    local_id: String,
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    state: RwLock<NegotiationState>,
    /// Candidates that arrived before the remote description was set
    pending_candidates: Mutex<Vec<IceCandidatePayload>>,
    remote_track: Arc<RwLock<Option<RemoteTrack>>>,
}

impl PeerLink {
    pub async fn new(
        local_id: String,
        remote_id: String,
        api: &Arc<API>,
        ice_servers: Vec<RTCIceServer>,
        relay: RelayHandle,
        failure_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SessionError::PeerConnectionCreation(e.to_string()))?,
        );

        pc.add_transceiver_from_kind(RTPCodecType::Video, None).await?;
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None).await?;

        {
            let relay = relay.clone();
            let local_id = local_id.clone();
            let remote_id = remote_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let message = ClientMessage::Candidate {
                                target_id: remote_id.clone(),
                                sender_id: local_id.clone(),
                                candidate: IceCandidatePayload {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            };
                            let _ = relay.send(message);
                        }
                        Err(e) => {
                            tracing::error!(
                                remote_id = %remote_id,
                                error = %e,
                                "Failed to marshal local ICE candidate"
                            );
                        }
                    }
                }
                Box::pin(async {})
            }));
        }

        {
            let remote_id = remote_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                ) {
                    tracing::warn!(remote_id = %remote_id, ?state, "Peer link degraded");
                    let _ = failure_tx.send(remote_id.clone());
                }
                Box::pin(async {})
            }));
        }

        Ok(Self {
            local_id,
            remote_id,
            pc,
            state: RwLock::new(NegotiationState::Idle),
            pending_candidates: Mutex::new(Vec::new()),
            remote_track: Arc::new(RwLock::new(None)),
        })
    }

    /// Wire the incoming-track callback. Separate from construction
    /// because the callback needs a handle back to the link.
    pub(crate) fn register_track_handler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(link) = weak.upgrade() {
                    link.attach_remote_track(RemoteTrack {
                        track_id: track.id(),
                        kind: track.kind().to_string(),
                    })
                    .await;
                }
            })
        }));
    }

    /// Record the remote media now rendered for this peer.
    pub(crate) async fn attach_remote_track(&self, track: RemoteTrack) {
        tracing::info!(
            remote_id = %self.remote_id,
            track_id = %track.track_id,
            kind = %track.kind,
            "Remote track received"
        );
        *self.remote_track.write().await = Some(track);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub async fn state(&self) -> NegotiationState {
        *self.state.read().await
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    async fn transition(&self, to: NegotiationState) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_transition(to) {
            return Err(SessionError::InvalidLinkTransition {
                remote_id: self.remote_id.clone(),
                from: *state,
                to,
            });
        }
        tracing::debug!(
            remote_id = %self.remote_id,
            from = ?*state,
            to = ?to,
            "Link transition"
        );
        *state = to;
        Ok(())
    }

    /// Start negotiation as the initiator. Legal only from `Idle`, which
    /// makes duplicate offer requests structurally impossible.
    pub async fn create_offer(&self) -> Result<String> {
        self.transition(NegotiationState::Offering).await?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::CreateOfferFailed(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| SessionError::SetLocalDescriptionFailed(e.to_string()))?;

        Ok(sdp)
    }

    /// Accept a remote offer and produce the answer, flushing any
    /// candidates that arrived early.
    pub async fn accept_offer(&self, sdp: &str) -> Result<String> {
        self.transition(NegotiationState::Answering).await?;

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| SessionError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| SessionError::SetRemoteDescriptionFailed(e.to_string()))?;

        self.flush_pending_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::CreateAnswerFailed(e.to_string()))?;
        let answer_sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| SessionError::SetLocalDescriptionFailed(e.to_string()))?;

        self.transition(NegotiationState::Stable).await?;
        Ok(answer_sdp)
    }

    /// Accept the remote answer to our own offer.
    pub async fn accept_answer(&self, sdp: &str) -> Result<()> {
        if self.state().await != NegotiationState::Offering {
            return Err(SessionError::InvalidLinkTransition {
                remote_id: self.remote_id.clone(),
                from: self.state().await,
                to: NegotiationState::Stable,
            });
        }

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| SessionError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SessionError::SetRemoteDescriptionFailed(e.to_string()))?;

        self.flush_pending_candidates().await;
        self.transition(NegotiationState::Stable).await
    }

    /// Apply an ICE candidate, or buffer it if it beat the remote
    /// description here.
    pub async fn add_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            let mut pending = self.pending_candidates.lock().await;
            pending.push(candidate);
            tracing::debug!(
                remote_id = %self.remote_id,
                queue_size = pending.len(),
                "Queued ICE candidate until remote description is set"
            );
            return Ok(());
        }

        self.apply_candidate(candidate).await
    }

    async fn apply_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::AddIceCandidateFailed(e.to_string()))
    }

    async fn flush_pending_candidates(&self) {
        let candidates: Vec<_> = {
            let mut pending = self.pending_candidates.lock().await;
            pending.drain(..).collect()
        };

        if candidates.is_empty() {
            return;
        }

        tracing::debug!(
            remote_id = %self.remote_id,
            count = candidates.len(),
            "Flushing queued ICE candidates"
        );
        for candidate in candidates {
            if let Err(e) = self.apply_candidate(candidate).await {
                tracing::error!(
                    remote_id = %self.remote_id,
                    error = %e,
                    "Failed to add queued ICE candidate"
                );
            }
        }
    }

    pub async fn remote_track(&self) -> Option<RemoteTrack> {
        self.remote_track.read().await.clone()
    }

    /// Drop the rendered remote track reference. The link itself stays
    /// open; only the rendering side forgets the frame source.
    pub async fn clear_remote_track(&self) {
        let mut slot = self.remote_track.write().await;
        if slot.take().is_some() {
            tracing::debug!(remote_id = %self.remote_id, "Cleared rendered remote track");
        }
    }

    pub async fn mark_failed(&self) {
        if self.transition(NegotiationState::Failed).await.is_ok() {
            tracing::warn!(remote_id = %self.remote_id, "Link marked failed");
        }
    }

    /// Close the link and its underlying connection. Idempotent.
    pub async fn close(&self) {
        if self.transition(NegotiationState::Closed).await.is_ok() {
            tracing::info!(remote_id = %self.remote_id, "Closing peer link");
        }
        self.remote_track.write().await.take();
        let _ = self.pc.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::rtc::{create_rtc_api, ice_servers};

    #[test]
    fn test_tie_break_is_deterministic() {
        assert!(initiates("att_a", "att_b"));
        assert!(!initiates("att_b", "att_a"));
        assert!(!initiates("att_a", "att_a"));
    }

    #[test]
    fn test_legal_transitions() {
        use NegotiationState::*;
        assert!(Idle.can_transition(Offering));
        assert!(Idle.can_transition(Answering));
        assert!(Offering.can_transition(Stable));
        assert!(Answering.can_transition(Stable));
        assert!(Stable.can_transition(Failed));
        assert!(Stable.can_transition(Closed));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use NegotiationState::*;
        for to in [Idle, Offering, Answering, Stable, Failed, Closed] {
            assert!(!Failed.can_transition(to));
            assert!(!Closed.can_transition(to));
        }
        assert!(!Stable.can_transition(Idle));
        assert!(!Offering.can_transition(Offering));
    }

    async fn test_link(local: &str, remote: &str) -> PeerLink {
        let api = create_rtc_api().unwrap();
        let config = Config::default();
        let (relay_tx, _relay_rx) = mpsc::unbounded_channel();
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        PeerLink::new(
            local.to_string(),
            remote.to_string(),
            &api,
            ice_servers(&config.rtc),
            RelayHandle::new(relay_tx),
            failure_tx,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_stable() {
        let initiator = test_link("att_a", "att_b").await;
        let responder = test_link("att_b", "att_a").await;

        let offer = initiator.create_offer().await.unwrap();
        assert_eq!(initiator.state().await, NegotiationState::Offering);

        let answer = responder.accept_offer(&offer).await.unwrap();
        assert_eq!(responder.state().await, NegotiationState::Stable);

        initiator.accept_answer(&answer).await.unwrap();
        assert_eq!(initiator.state().await, NegotiationState::Stable);

        initiator.close().await;
        responder.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_offer_request_is_rejected() {
        let link = test_link("att_a", "att_b").await;
        link.create_offer().await.unwrap();

        let result = link.create_offer().await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidLinkTransition { .. })
        ));
        link.close().await;
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_and_flushed() {
        let initiator = test_link("att_a", "att_b").await;
        let responder = test_link("att_b", "att_a").await;

        let candidate = IceCandidatePayload {
            candidate: "candidate:1 1 UDP 2122252543 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        // Candidate arrives before any description exists
        responder.add_candidate(candidate).await.unwrap();
        assert_eq!(responder.pending_candidates.lock().await.len(), 1);

        let offer = initiator.create_offer().await.unwrap();
        responder.accept_offer(&offer).await.unwrap();

        assert!(responder.pending_candidates.lock().await.is_empty());

        initiator.close().await;
        responder.close().await;
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let link = test_link("att_a", "att_b").await;
        let result = link.accept_answer("v=0").await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidLinkTransition { .. })
        ));
        link.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let link = test_link("att_a", "att_b").await;
        link.close().await;
        assert_eq!(link.state().await, NegotiationState::Closed);

        link.close().await;
        assert_eq!(link.state().await, NegotiationState::Closed);

        let result = link.create_offer().await;
        assert!(result.is_err());
    }
}
