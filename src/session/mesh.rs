use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use webrtc::api::API;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::link::{initiates, NegotiationState, PeerLink};
use super::room::Role;
use crate::error::Result;
use crate::signaling::messages::{ClientMessage, IceCandidatePayload, ParticipantInfo};
use crate::signaling::relay::RelayHandle;

/// Peer-mesh manager: one link per remote participant, keyed by their
/// id. Pair uniqueness falls out of the initiator rules: a newcomer
/// offers to everyone present, an existing member waits for the
/// newcomer's offer, and a simultaneous-offer race is settled by the
/// id tie-break.
pub struct MeshManager {
    local_id: String,
    role: Role,
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    relay: RelayHandle,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    failure_tx: mpsc::UnboundedSender<String>,
    failure_grace: Duration,
}

impl MeshManager {
    pub fn new(
        local_id: String,
        role: Role,
        api: Arc<API>,
        ice_servers: Vec<RTCIceServer>,
        relay: RelayHandle,
        failure_grace: Duration,
    ) -> Arc<Self> {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let mesh = Arc::new(Self {
            local_id,
            role,
            api,
            ice_servers,
            relay,
            links: RwLock::new(HashMap::new()),
            failure_tx,
            failure_grace,
        });

        mesh.clone().start_failure_watcher(failure_rx);
        mesh
    }

    /// Reap links that stay failed or disconnected past the grace
    /// period. A link that recovers in the meantime is left alone.
    fn start_failure_watcher(self: Arc<Self>, mut failure_rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(remote_id) = failure_rx.recv().await {
                let mesh = self.clone();
                tokio::spawn(async move {
                    sleep(mesh.failure_grace).await;
                    mesh.reap_if_still_degraded(&remote_id).await;
                });
            }
        });
    }

    async fn reap_if_still_degraded(&self, remote_id: &str) {
        let link = {
            let links = self.links.read().await;
            links.get(remote_id).cloned()
        };

        let Some(link) = link else { return };

        match link.connection_state() {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                tracing::warn!(
                    remote_id = %remote_id,
                    grace = ?self.failure_grace,
                    "Link still degraded after grace period, tearing down"
                );
                link.mark_failed().await;
                self.remove_link(remote_id).await;
            }
            state => {
                tracing::debug!(remote_id = %remote_id, ?state, "Link recovered within grace period");
            }
        }
    }

    /// Create and register a fresh link for `remote_id`. Returns `None`
    /// when a live link already exists (idempotent join/offer).
    async fn create_link(&self, remote_id: &str) -> Result<Option<Arc<PeerLink>>> {
        {
            let links = self.links.read().await;
            if let Some(existing) = links.get(remote_id) {
                if !existing.state().await.is_terminal() {
                    tracing::debug!(
                        remote_id = %remote_id,
                        "Link already exists, duplicate request discarded"
                    );
                    return Ok(None);
                }
            }
        }

        let link = Arc::new(
            PeerLink::new(
                self.local_id.clone(),
                remote_id.to_string(),
                &self.api,
                self.ice_servers.clone(),
                self.relay.clone(),
                self.failure_tx.clone(),
            )
            .await?,
        );
        link.register_track_handler();

        let mut links = self.links.write().await;
        // Lost a race while constructing: keep the registered one
        if let Some(existing) = links.get(remote_id) {
            if !existing.state().await.is_terminal() {
                link.close().await;
                return Ok(None);
            }
        }
        links.insert(remote_id.to_string(), link.clone());
        Ok(Some(link))
    }

    async fn remove_link(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        let removed = {
            let mut links = self.links.write().await;
            links.remove(remote_id)
        };
        if let Some(ref link) = removed {
            link.close().await;
        }
        removed
    }

    /// Offer toward one remote participant. Used by the newly joined
    /// side, which always initiates: it has no stale state toward
    /// anyone.
    pub async fn offer_to(&self, remote_id: &str) -> Result<()> {
        let Some(link) = self.create_link(remote_id).await? else {
            return Ok(());
        };

        let sdp = link.create_offer().await?;
        tracing::info!(remote_id = %remote_id, "Sending offer");
        self.relay.send(ClientMessage::Offer {
            target_id: remote_id.to_string(),
            sender_id: self.local_id.clone(),
            sdp,
            role: self.role,
        })
    }

    /// React to the initial roster: offer to every participant already
    /// in the room.
    pub async fn connect_to_roster(&self, roster: &[ParticipantInfo]) {
        for participant in roster {
            if participant.participant_id == self.local_id {
                continue;
            }
            if let Err(e) = self.offer_to(&participant.participant_id).await {
                tracing::error!(
                    remote_id = %participant.participant_id,
                    error = %e,
                    "Failed to offer to existing participant"
                );
            }
        }
    }

    /// Handle an incoming offer, including the glare race and duplicate
    /// deliveries.
    pub async fn handle_offer(&self, sender_id: &str, sdp: &str) -> Result<()> {
        let existing = {
            let links = self.links.read().await;
            links.get(sender_id).cloned()
        };

        if let Some(link) = existing {
            match link.state().await {
                NegotiationState::Offering => {
                    if initiates(&self.local_id, sender_id) {
                        // We win the glare race; the other side backs off
                        tracing::info!(
                            remote_id = %sender_id,
                            "Glare: keeping own offer, discarding incoming"
                        );
                        return Ok(());
                    }
                    // We lose: abandon our offer and answer theirs on a
                    // fresh link
                    tracing::info!(
                        remote_id = %sender_id,
                        "Glare: yielding to remote offer"
                    );
                    self.remove_link(sender_id).await;
                }
                NegotiationState::Answering | NegotiationState::Stable => {
                    tracing::debug!(remote_id = %sender_id, "Duplicate offer discarded");
                    return Ok(());
                }
                NegotiationState::Idle => {
                    // Pre-created link waiting for exactly this offer
                    return self.answer_on(link, sender_id, sdp).await;
                }
                NegotiationState::Failed | NegotiationState::Closed => {
                    self.remove_link(sender_id).await;
                }
            }
        }

        let Some(link) = self.create_link(sender_id).await? else {
            return Ok(());
        };
        self.answer_on(link, sender_id, sdp).await
    }

    async fn answer_on(&self, link: Arc<PeerLink>, sender_id: &str, sdp: &str) -> Result<()> {
        let answer = link.accept_offer(sdp).await?;
        tracing::info!(remote_id = %sender_id, "Sending answer");
        self.relay.send(ClientMessage::Answer {
            target_id: sender_id.to_string(),
            sender_id: self.local_id.clone(),
            sdp: answer,
            role: self.role,
        })
    }

    pub async fn handle_answer(&self, sender_id: &str, sdp: &str) -> Result<()> {
        let link = {
            let links = self.links.read().await;
            links.get(sender_id).cloned()
        };

        match link {
            Some(link) if link.state().await == NegotiationState::Offering => {
                link.accept_answer(sdp).await?;
                tracing::info!(remote_id = %sender_id, "Link stable");
                Ok(())
            }
            Some(link) => {
                let state = link.state().await;
                tracing::debug!(
                    remote_id = %sender_id,
                    ?state,
                    "Stale or duplicate answer discarded"
                );
                Ok(())
            }
            None => {
                tracing::debug!(remote_id = %sender_id, "Answer for unknown link discarded");
                Ok(())
            }
        }
    }

    pub async fn handle_candidate(
        &self,
        sender_id: &str,
        candidate: IceCandidatePayload,
    ) -> Result<()> {
        let link = {
            let links = self.links.read().await;
            links.get(sender_id).cloned()
        };

        match link {
            Some(link) => link.add_candidate(candidate).await,
            None => {
                tracing::debug!(remote_id = %sender_id, "Candidate for unknown link discarded");
                Ok(())
            }
        }
    }

    /// A participant left (or the relay lost them): drop every link
    /// referencing them.
    pub async fn handle_participant_left(&self, participant_id: &str) {
        if self.remove_link(participant_id).await.is_some() {
            tracing::info!(remote_id = %participant_id, "Tore down link for departed participant");
        }
    }

    /// Cancel all in-flight negotiations and close every link.
    pub async fn teardown_all(&self) {
        let links: Vec<_> = {
            let mut map = self.links.write().await;
            map.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.close().await;
        }
        tracing::info!("Mesh torn down");
    }

    pub async fn link(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        let links = self.links.read().await;
        links.get(remote_id).cloned()
    }

    pub async fn link_count(&self) -> usize {
        let links = self.links.read().await;
        links.len()
    }

    pub async fn stable_link_count(&self) -> usize {
        let links = self.links.read().await;
        let mut count = 0;
        for link in links.values() {
            if link.state().await == NegotiationState::Stable {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::rtc::{create_rtc_api, ice_servers};
    use crate::signaling::messages::ClientMessage;

    fn mesh(local_id: &str) -> (Arc<MeshManager>, mpsc::UnboundedReceiver<ClientMessage>) {
        let api = create_rtc_api().unwrap();
        let config = Config::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let mesh = MeshManager::new(
            local_id.to_string(),
            Role::Attendee,
            api,
            ice_servers(&config.rtc),
            RelayHandle::new(tx),
            Duration::from_millis(50),
        );
        (mesh, rx)
    }

    fn info(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: id.to_string(),
            display_name: id.to_string(),
            role: Role::Attendee,
            camera_on: true,
            microphone_on: true,
        }
    }

    #[tokio::test]
    async fn test_newcomer_offers_to_existing_roster() {
        let (mesh, mut rx) = mesh("att_b");

        mesh.connect_to_roster(&[info("att_a"), info("att_b"), info("host_1")])
            .await;

        // Self is skipped, both others get offers
        assert_eq!(mesh.link_count().await, 2);
        let mut targets = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ClientMessage::Offer { target_id, sender_id, .. } = message {
                assert_eq!(sender_id, "att_b");
                targets.push(target_id);
            }
        }
        targets.sort();
        assert_eq!(targets, vec!["att_a", "host_1"]);
    }

    #[tokio::test]
    async fn test_duplicate_offer_request_is_suppressed() {
        let (mesh, mut rx) = mesh("att_b");

        mesh.offer_to("att_a").await.unwrap();
        mesh.offer_to("att_a").await.unwrap();

        assert_eq!(mesh.link_count().await, 1);
        let mut offers = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, ClientMessage::Offer { .. }) {
                offers += 1;
            }
        }
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_meshes() {
        let (mesh_a, _rx_a) = mesh("att_a");
        let (mesh_b, mut rx_b) = mesh("att_b");

        // B joined second, so B offers toward A
        mesh_b.offer_to("att_a").await.unwrap();
        let offer_sdp = loop {
            match rx_b.try_recv().unwrap() {
                ClientMessage::Offer { sdp, .. } => break sdp,
                _ => continue,
            }
        };

        mesh_a.handle_offer("att_b", &offer_sdp).await.unwrap();
        assert_eq!(
            mesh_a.link("att_b").await.unwrap().state().await,
            NegotiationState::Stable
        );

        mesh_a.teardown_all().await;
        mesh_b.teardown_all().await;
    }

    #[tokio::test]
    async fn test_glare_resolved_by_tie_break() {
        let (mesh_a, mut rx_a) = mesh("att_a");
        let (mesh_b, mut rx_b) = mesh("att_b");

        // Both sides offer simultaneously
        mesh_a.offer_to("att_b").await.unwrap();
        mesh_b.offer_to("att_a").await.unwrap();

        let offer_from_a = loop {
            match rx_a.try_recv().unwrap() {
                ClientMessage::Offer { sdp, .. } => break sdp,
                _ => continue,
            }
        };
        let offer_from_b = loop {
            match rx_b.try_recv().unwrap() {
                ClientMessage::Offer { sdp, .. } => break sdp,
                _ => continue,
            }
        };

        // att_a sorts first, so it keeps its own offer and discards B's
        mesh_a.handle_offer("att_b", &offer_from_b).await.unwrap();
        assert_eq!(
            mesh_a.link("att_b").await.unwrap().state().await,
            NegotiationState::Offering
        );

        // att_b yields: its own offer dies and it answers A's instead
        mesh_b.handle_offer("att_a", &offer_from_a).await.unwrap();
        assert_eq!(
            mesh_b.link("att_a").await.unwrap().state().await,
            NegotiationState::Stable
        );

        // B's answer completes A's side
        let answer_from_b = loop {
            match rx_b.try_recv().unwrap() {
                ClientMessage::Answer { sdp, .. } => break sdp,
                _ => continue,
            }
        };
        mesh_a.handle_answer("att_b", &answer_from_b).await.unwrap();
        assert_eq!(
            mesh_a.link("att_b").await.unwrap().state().await,
            NegotiationState::Stable
        );
        assert_eq!(mesh_a.link_count().await, 1);
        assert_eq!(mesh_b.link_count().await, 1);

        mesh_a.teardown_all().await;
        mesh_b.teardown_all().await;
    }

    #[tokio::test]
    async fn test_participant_left_tears_down_link() {
        let (mesh, _rx) = mesh("att_b");
        mesh.offer_to("att_a").await.unwrap();
        assert_eq!(mesh.link_count().await, 1);

        mesh.handle_participant_left("att_a").await;
        assert_eq!(mesh.link_count().await, 0);

        // Duplicate leave is a no-op
        mesh.handle_participant_left("att_a").await;
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_link_is_dropped() {
        let (mesh, _rx) = mesh("att_b");
        let result = mesh
            .handle_candidate(
                "ghost",
                IceCandidatePayload {
                    candidate: "candidate:1 1 UDP 2122252543 127.0.0.1 54321 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stale_answer_is_discarded() {
        let (mesh, _rx) = mesh("att_b");
        // Answer for a link that never offered
        assert!(mesh.handle_answer("att_a", "v=0").await.is_ok());
    }

    #[tokio::test]
    async fn test_handlers_run_on_spawned_tasks() {
        let (mesh, _rx) = mesh("att_b");
        mesh.offer_to("att_a").await.unwrap();

        // The event loop runs under tokio::spawn, so every handler
        // future must be Send
        let task = tokio::spawn(async move {
            mesh.handle_answer("ghost", "not sdp").await.unwrap();
            mesh.handle_participant_left("att_a").await;
            mesh.link_count().await
        });
        assert_eq!(task.await.unwrap(), 0);
    }
}
