use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::devices::{CaptureSession, DeviceAccess};
use super::media::MediaSync;
use super::mesh::MeshManager;
use super::room::{ConnectionState, Role, Room};
use super::rtc::{create_rtc_api, ice_servers};
use crate::chat::ChatChannel;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::proctoring::budget::BudgetEngine;
use crate::proctoring::control::ControlPlane;
use crate::proctoring::detector::{spawn_poller, DetectorClient, DetectorTranslator};
use crate::proctoring::policy::{DetectionPolicy, PolicyStore};
use crate::proctoring::{AttemptBudget, Severity, ViolationKind, ViolationOutcome};
use crate::signaling::messages::{
    ClientMessage, DisconnectReason, ParticipantInfo, RelayEvent, BROADCAST_TARGET,
};
use crate::signaling::relay::RelayHandle;

#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
}

/// One client's view of a monitored exam session.
///
/// Every relay event funnels through [`SessionClient::handle_event`] on
/// one logical thread of control; the components it dispatches into
/// guard their own state, so interleaved async callbacks cannot corrupt
/// the roster, the mesh, or a budget.
pub struct SessionClient {
    identity: SessionIdentity,
    room: Arc<Room>,
    mesh: Arc<MeshManager>,
    media: MediaSync,
    chat: ChatChannel,
    relay: RelayHandle,
    devices: Arc<dyn DeviceAccess>,
    capture: Mutex<Option<CaptureSession>>,
    /// Host-side proctoring state; `None` on attendees
    budgets: Option<Arc<BudgetEngine>>,
    control: Option<ControlPlane>,
    /// Attendee-side detector translator; `None` on the host
    translator: Option<Arc<DetectorTranslator>>,
    detector_task: Mutex<Option<JoinHandle<()>>>,
    ended: RwLock<Option<DisconnectReason>>,
}

impl SessionClient {
    /// Join a room. Device acquisition happens before anything goes on
    /// the wire: a denied camera or microphone means the session is
    /// never entered.
    pub async fn join(
        config: &Config,
        identity: SessionIdentity,
        room_id: String,
        relay: RelayHandle,
        devices: Arc<dyn DeviceAccess>,
    ) -> Result<Arc<Self>> {
        let capture = devices.acquire(true, true)?;

        let api = create_rtc_api()?;
        let room = Arc::new(Room::new(room_id.clone()));
        let mesh = MeshManager::new(
            identity.participant_id.clone(),
            identity.role,
            api,
            ice_servers(&config.rtc),
            relay.clone(),
            config.rtc.failure_grace,
        );
        let media = MediaSync::new(room_id.clone(), relay.clone());
        let chat = ChatChannel::new(
            room_id.clone(),
            identity.participant_id.clone(),
            identity.role,
            relay.clone(),
        );

        let default_policy =
            DetectionPolicy::with_max_attempts(config.proctoring.default_max_attempts);

        let (budgets, control, translator) = match identity.role {
            Role::Host => {
                let policies = PolicyStore::new(default_policy);
                let budgets = BudgetEngine::new(policies.clone());
                let control = ControlPlane::new(
                    relay.clone(),
                    room.clone(),
                    policies,
                    budgets.clone(),
                );
                (Some(budgets), Some(control), None)
            }
            Role::Attendee => {
                let translator = DetectorTranslator::new(
                    identity.participant_id.clone(),
                    relay.clone(),
                    default_policy,
                );
                (None, None, Some(translator))
            }
        };

        relay.send(ClientMessage::JoinRoom {
            room_id: room_id.clone(),
            participant_id: identity.participant_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
        })?;

        tracing::info!(
            participant_id = %identity.participant_id,
            room_id = %room_id,
            role = ?identity.role,
            "Joining room"
        );

        let client = Arc::new(Self {
            identity,
            room,
            mesh,
            media,
            chat,
            relay,
            devices,
            capture: Mutex::new(Some(capture)),
            budgets,
            control,
            translator,
            detector_task: Mutex::new(None),
            ended: RwLock::new(None),
        });

        // The room covers every member, the local participant included
        client.room.insert_participant(client.local_info()).await;

        if let (Some(translator), Some(url)) = (
            client.translator.clone(),
            config.proctoring.detector_url.clone(),
        ) {
            let task = spawn_poller(
                translator,
                DetectorClient::new(url),
                room_id,
                config.proctoring.detector_interval,
            );
            *client.detector_task.lock().await = Some(task);
        }

        Ok(client)
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn local_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.identity.participant_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role,
            camera_on: true,
            microphone_on: true,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn mesh(&self) -> &Arc<MeshManager> {
        &self.mesh
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    /// Host-only control plane for policy pushes.
    pub fn control(&self) -> Option<&ControlPlane> {
        self.control.as_ref()
    }

    /// Attendee-side proctoring-offline indicator.
    pub fn proctoring_offline(&self) -> bool {
        self.translator
            .as_ref()
            .map(|t| t.is_offline())
            .unwrap_or(false)
    }

    /// Why the session ended, once it has.
    pub async fn ended(&self) -> Option<DisconnectReason> {
        *self.ended.read().await
    }

    /// Drive the session until the relay closes or the session ends.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
            if self.ended().await.is_some() {
                return;
            }
        }

        tracing::warn!(reason = "network-lost", "Relay connection lost, leaving session");
        self.leave(DisconnectReason::NetworkLost).await;
    }

    /// Dispatch one relay event. Failures inside a single negotiation or
    /// detector path are contained here; they never abort the session.
    pub async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::RoomParticipants { participants } => {
                self.room.apply_roster(participants.clone()).await;
                // Roster snapshots list the other members; the local
                // entry is restored after the wholesale replacement
                self.room.insert_participant(self.local_info()).await;
                if let Some(ref budgets) = self.budgets {
                    for participant in &participants {
                        if participant.role == Role::Attendee {
                            budgets.observe(&participant.participant_id).await;
                        }
                    }
                }
                self.mesh.connect_to_roster(&participants).await;
            }

            RelayEvent::ParticipantJoined { participant } => {
                if participant.participant_id == self.identity.participant_id {
                    return;
                }
                let role = participant.role;
                let id = participant.participant_id.clone();
                if self.room.insert_participant(participant).await {
                    if let Some(ref budgets) = self.budgets {
                        if role == Role::Attendee {
                            budgets.observe(&id).await;
                        }
                    }
                }
                // The newcomer initiates toward us; nothing to send here
            }

            RelayEvent::ParticipantLeft { participant_id } => {
                self.room.remove_participant(&participant_id).await;
                self.mesh.handle_participant_left(&participant_id).await;
            }

            RelayEvent::Offer { sender_id, sdp, .. } => {
                if let Err(e) = self.mesh.handle_offer(&sender_id, &sdp).await {
                    tracing::error!(remote_id = %sender_id, error = %e, "Offer handling failed");
                }
            }

            RelayEvent::Answer { sender_id, sdp, .. } => {
                if let Err(e) = self.mesh.handle_answer(&sender_id, &sdp).await {
                    tracing::error!(remote_id = %sender_id, error = %e, "Answer handling failed");
                }
            }

            RelayEvent::Candidate { sender_id, candidate } => {
                if let Err(e) = self.mesh.handle_candidate(&sender_id, candidate).await {
                    tracing::error!(remote_id = %sender_id, error = %e, "Candidate handling failed");
                }
            }

            RelayEvent::MediaStatusUpdate {
                participant_id,
                camera_on,
                microphone_on,
            } => {
                if participant_id == self.identity.participant_id {
                    return;
                }
                self.media
                    .apply_update(&self.room, &self.mesh, &participant_id, camera_on, microphone_on)
                    .await;
            }

            RelayEvent::ChatMessage {
                sender_id,
                text,
                system,
            } => {
                self.chat.on_message(&sender_id, &text, system).await;
            }

            RelayEvent::ViolationSignal {
                participant_id,
                kind,
                severity,
                detected_at,
            } => {
                if self.budgets.is_some() {
                    self.account_violation(&participant_id, kind, severity, detected_at, None)
                        .await;
                } else {
                    tracing::debug!(
                        participant_id = %participant_id,
                        "Violation signal ignored on non-host client"
                    );
                }
            }

            RelayEvent::PolicyUpdate { target_id, policy } => {
                if target_id != self.identity.participant_id && target_id != BROADCAST_TARGET {
                    return;
                }
                if let Some(ref translator) = self.translator {
                    if let Some(message) = translator.apply_policy(&policy).await {
                        self.chat.system_notice(message).await;
                    }
                }
            }

            RelayEvent::DisconnectDirective {
                participant_id,
                reason,
            } => {
                if participant_id == self.identity.participant_id {
                    match reason {
                        DisconnectReason::AttemptsExhausted => {
                            // Policy enforcement, not a failure
                            tracing::warn!(
                                reason = "attempts-exhausted",
                                "Session terminated: violation budget exhausted"
                            );
                        }
                        other => {
                            tracing::warn!(reason = ?other, "Session terminated by host");
                        }
                    }
                    self.leave(reason).await;
                } else {
                    self.room
                        .set_connection_state(&participant_id, ConnectionState::Disconnected)
                        .await;
                }
            }
        }
    }

    /// Host-side accounting for one violation: budget mutation, the
    /// host-only chat alert, and (at most once per exhaustion) the
    /// disconnect directive.
    async fn account_violation(
        &self,
        participant_id: &str,
        kind: ViolationKind,
        severity: Severity,
        detected_at: u64,
        detail: Option<String>,
    ) -> Option<ViolationOutcome> {
        let budgets = self.budgets.as_ref()?;

        let outcome = match detail {
            Some(label) => {
                budgets
                    .manual_violation(participant_id, label, detected_at)
                    .await
            }
            None => {
                budgets
                    .record_violation(participant_id, kind, severity, detected_at)
                    .await
            }
        };

        let display_name = self
            .room
            .participant(participant_id)
            .await
            .map(|p| p.display_name)
            .unwrap_or_else(|| participant_id.to_string());
        self.chat
            .system_alert(format!(
                "{display_name}: {kind:?} violation, {} of {} attempts used",
                outcome.record.attempts_used_after,
                outcome.record.attempts_used_after + outcome.record.attempts_left_after,
            ))
            .await;

        if outcome.disconnect {
            self.chat
                .system_alert(format!("{display_name}: attempts exhausted, disconnecting"))
                .await;
            if let Err(e) = self.relay.send(ClientMessage::DisconnectDirective {
                participant_id: participant_id.to_string(),
                reason: DisconnectReason::AttemptsExhausted,
            }) {
                tracing::error!(error = %e, "Failed to send disconnect directive");
            }
        }

        Some(outcome)
    }

    /// Host-initiated penalty, accounted exactly like a detector signal.
    pub async fn manual_violation(
        &self,
        participant_id: &str,
        label: impl Into<String>,
    ) -> Result<ViolationOutcome> {
        self.account_violation(
            participant_id,
            ViolationKind::Manual,
            Severity::Manual,
            unix_millis(),
            Some(label.into()),
        )
        .await
        .ok_or_else(|| SessionError::internal("manual violations are host-only"))
    }

    pub async fn reset_attempts(&self, participant_id: &str) -> Result<()> {
        let budgets = self
            .budgets
            .as_ref()
            .ok_or_else(|| SessionError::internal("attempt reset is host-only"))?;
        budgets.reset_attempts(participant_id).await;
        Ok(())
    }

    pub async fn set_max_attempts(&self, participant_id: Option<&str>, n: u32) -> Result<()> {
        let budgets = self
            .budgets
            .as_ref()
            .ok_or_else(|| SessionError::internal("budget configuration is host-only"))?;
        budgets.set_max_attempts(participant_id, n).await;
        Ok(())
    }

    pub async fn budget_snapshot(&self, participant_id: &str) -> Option<AttemptBudget> {
        match self.budgets {
            Some(ref budgets) => budgets.snapshot(participant_id).await,
            None => None,
        }
    }

    pub async fn set_local_media(&self, camera_on: bool, microphone_on: bool) -> Result<()> {
        self.media.set_local_media(camera_on, microphone_on).await
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.chat.send(text)
    }

    /// End the exam for everyone: the host directs each remaining
    /// participant to disconnect, then leaves itself.
    pub async fn end_session(&self) -> Result<()> {
        if self.budgets.is_none() {
            return Err(SessionError::internal("ending the session is host-only"));
        }

        for participant_id in self.room.participant_ids().await {
            if participant_id == self.identity.participant_id {
                continue;
            }
            self.relay.send(ClientMessage::DisconnectDirective {
                participant_id,
                reason: DisconnectReason::HostEnded,
            })?;
        }

        self.leave(DisconnectReason::HostEnded).await;
        Ok(())
    }

    /// Leave the room: cancel the detector poller and all in-flight
    /// negotiations, then hand the capture devices back.
    pub async fn leave(&self, reason: DisconnectReason) {
        {
            let mut ended = self.ended.write().await;
            if ended.is_some() {
                return;
            }
            *ended = Some(reason);
        }

        if let Some(task) = self.detector_task.lock().await.take() {
            task.abort();
        }

        self.mesh.teardown_all().await;

        if let Some(capture) = self.capture.lock().await.take() {
            self.devices.release(capture);
        }

        tracing::info!(
            participant_id = %self.identity.participant_id,
            ?reason,
            "Left session"
        );
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
