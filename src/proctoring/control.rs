use std::sync::Arc;

use super::budget::BudgetEngine;
use super::policy::{DetectionPolicy, PolicyPatch, PolicyStore};
use crate::error::Result;
use crate::session::room::Room;
use crate::signaling::messages::{ClientMessage, BROADCAST_TARGET};
use crate::signaling::relay::RelayHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyScope {
    Global,
    Participant(String),
}

/// Host-side control plane: writes policy into the host's own store,
/// recomputes affected budgets, then pushes the patch to the targeted
/// attendees through the relay.
pub struct ControlPlane {
    relay: RelayHandle,
    room: Arc<Room>,
    policies: Arc<PolicyStore>,
    budgets: Arc<BudgetEngine>,
}

impl ControlPlane {
    pub fn new(
        relay: RelayHandle,
        room: Arc<Room>,
        policies: Arc<PolicyStore>,
        budgets: Arc<BudgetEngine>,
    ) -> Self {
        Self {
            relay,
            room,
            policies,
            budgets,
        }
    }

    /// Apply a policy patch to one participant or the whole room.
    ///
    /// A push addressed to a participant who has already left is dropped
    /// without error. Attempts already used are never touched; a changed
    /// maximum only recomputes what is left.
    pub async fn apply_policy(&self, scope: PolicyScope, patch: PolicyPatch) -> Result<()> {
        let target_id = match scope {
            PolicyScope::Global => {
                self.policies.patch_global(&patch).await;
                if let Some(n) = patch.max_attempts {
                    self.budgets.apply_max(None, n).await;
                }
                BROADCAST_TARGET.to_string()
            }
            PolicyScope::Participant(id) => {
                if !self.room.contains(&id).await {
                    tracing::debug!(
                        participant_id = %id,
                        "Dropping policy push for departed participant"
                    );
                    return Ok(());
                }
                self.policies.patch_participant(&id, &patch).await;
                if let Some(n) = patch.max_attempts {
                    self.budgets.apply_max(Some(&id), n).await;
                }
                id
            }
        };

        self.relay.send(ClientMessage::PolicyUpdate {
            target_id,
            policy: patch,
        })
    }

    pub async fn enable_all(&self) -> Result<()> {
        self.apply_policy(PolicyScope::Global, PolicyPatch::enable_all())
            .await
    }

    pub async fn disable_all(&self) -> Result<()> {
        self.apply_policy(PolicyScope::Global, PolicyPatch::disable_all())
            .await
    }

    /// Drop a participant's override and push them the full global
    /// policy so their local cache converges on it.
    pub async fn reset_to_global(&self, participant_id: &str) -> Result<()> {
        self.policies.clear_override(participant_id).await;

        if !self.room.contains(participant_id).await {
            return Ok(());
        }

        let global = self.policies.global().await;
        self.budgets
            .apply_max(Some(participant_id), global.max_attempts)
            .await;
        self.relay.send(ClientMessage::PolicyUpdate {
            target_id: participant_id.to_string(),
            policy: full_patch(&global),
        })
    }
}

/// A patch with every field set, mirroring a concrete policy.
fn full_patch(policy: &DetectionPolicy) -> PolicyPatch {
    PolicyPatch {
        enabled_checks: Some(policy.enabled_checks.clone()),
        max_attempts: Some(policy.max_attempts),
        auto_disconnect_on_exhaustion: Some(policy.auto_disconnect_on_exhaustion),
        custom_message: policy.custom_message.clone(),
    }
}
