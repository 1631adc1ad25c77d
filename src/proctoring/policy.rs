use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Lowest and highest configurable attempt budgets. Out-of-range values
/// are clamped, never rejected.
pub const MIN_MAX_ATTEMPTS: u32 = 1;
pub const MAX_MAX_ATTEMPTS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    Absence,
    MultipleSubjects,
    GazeDeviation,
    EyesNotVisible,
    HandNearFace,
}

impl CheckKind {
    pub fn all() -> HashSet<CheckKind> {
        [
            CheckKind::Absence,
            CheckKind::MultipleSubjects,
            CheckKind::GazeDeviation,
            CheckKind::EyesNotVisible,
            CheckKind::HandNearFace,
        ]
        .into_iter()
        .collect()
    }
}

/// Effective proctoring policy for one participant (or the room default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPolicy {
    pub enabled_checks: HashSet<CheckKind>,
    pub max_attempts: u32,
    pub auto_disconnect_on_exhaustion: bool,
    pub custom_message: Option<String>,
}

impl DetectionPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: clamp_max_attempts(max_attempts),
            ..Self::default()
        }
    }
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            enabled_checks: CheckKind::all(),
            max_attempts: 3,
            auto_disconnect_on_exhaustion: true,
            custom_message: None,
        }
    }
}

/// Partial policy update. Unset fields keep their previous value;
/// set fields are last-write-wins, both for the global default and for
/// per-participant overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_checks: Option<HashSet<CheckKind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_disconnect_on_exhaustion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
}

impl PolicyPatch {
    pub fn enable_all() -> Self {
        Self {
            enabled_checks: Some(CheckKind::all()),
            ..Self::default()
        }
    }

    pub fn disable_all() -> Self {
        Self {
            enabled_checks: Some(HashSet::new()),
            ..Self::default()
        }
    }

    pub fn max_attempts(n: u32) -> Self {
        Self {
            max_attempts: Some(n),
            ..Self::default()
        }
    }

    /// Overlay this patch onto a concrete policy, clamping attempts.
    pub fn apply_to(&self, policy: &mut DetectionPolicy) {
        if let Some(ref checks) = self.enabled_checks {
            policy.enabled_checks = checks.clone();
        }
        if let Some(n) = self.max_attempts {
            policy.max_attempts = clamp_max_attempts(n);
        }
        if let Some(auto) = self.auto_disconnect_on_exhaustion {
            policy.auto_disconnect_on_exhaustion = auto;
        }
        if let Some(ref message) = self.custom_message {
            policy.custom_message = Some(message.clone());
        }
    }

    /// Merge a newer patch into this one, field by field.
    fn absorb(&mut self, newer: &PolicyPatch) {
        if newer.enabled_checks.is_some() {
            self.enabled_checks = newer.enabled_checks.clone();
        }
        if newer.max_attempts.is_some() {
            self.max_attempts = newer.max_attempts;
        }
        if newer.auto_disconnect_on_exhaustion.is_some() {
            self.auto_disconnect_on_exhaustion = newer.auto_disconnect_on_exhaustion;
        }
        if newer.custom_message.is_some() {
            self.custom_message = newer.custom_message.clone();
        }
    }
}

pub fn clamp_max_attempts(n: u32) -> u32 {
    n.clamp(MIN_MAX_ATTEMPTS, MAX_MAX_ATTEMPTS)
}

/// Host-owned policy map: one global default plus per-participant
/// override patches. Overrides stay patches (not full copies) so the
/// global default keeps showing through unset fields.
pub struct PolicyStore {
    global: RwLock<DetectionPolicy>,
    overrides: RwLock<HashMap<String, PolicyPatch>>,
}

impl PolicyStore {
    pub fn new(global: DetectionPolicy) -> Arc<Self> {
        Arc::new(Self {
            global: RwLock::new(global),
            overrides: RwLock::new(HashMap::new()),
        })
    }

    pub async fn global(&self) -> DetectionPolicy {
        self.global.read().await.clone()
    }

    pub async fn patch_global(&self, patch: &PolicyPatch) {
        let mut global = self.global.write().await;
        patch.apply_to(&mut global);
        tracing::info!(?patch, "Global detection policy updated");
    }

    pub async fn patch_participant(&self, participant_id: &str, patch: &PolicyPatch) {
        let mut overrides = self.overrides.write().await;
        overrides
            .entry(participant_id.to_string())
            .or_default()
            .absorb(patch);
        tracing::info!(participant_id = %participant_id, ?patch, "Participant policy override updated");
    }

    /// Drop the participant's override so the global default applies again.
    pub async fn clear_override(&self, participant_id: &str) {
        let mut overrides = self.overrides.write().await;
        if overrides.remove(participant_id).is_some() {
            tracing::info!(participant_id = %participant_id, "Participant policy reset to global");
        }
    }

    /// Global default overlaid with the participant's override patch.
    pub async fn effective(&self, participant_id: &str) -> DetectionPolicy {
        let mut policy = self.global.read().await.clone();
        let overrides = self.overrides.read().await;
        if let Some(patch) = overrides.get(participant_id) {
            patch.apply_to(&mut policy);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_effective_defaults_to_global() {
        let store = PolicyStore::new(DetectionPolicy::default());
        let policy = store.effective("att_1").await;
        assert_eq!(policy, DetectionPolicy::default());
    }

    #[tokio::test]
    async fn test_override_is_field_wise() {
        let store = PolicyStore::new(DetectionPolicy::default());
        store
            .patch_participant("att_1", &PolicyPatch::max_attempts(5))
            .await;

        let policy = store.effective("att_1").await;
        assert_eq!(policy.max_attempts, 5);
        // Unset fields still come from the global default
        assert_eq!(policy.enabled_checks, CheckKind::all());
        assert!(policy.auto_disconnect_on_exhaustion);
    }

    #[tokio::test]
    async fn test_override_last_write_wins_per_field() {
        let store = PolicyStore::new(DetectionPolicy::default());
        store
            .patch_participant("att_1", &PolicyPatch::max_attempts(5))
            .await;
        store
            .patch_participant("att_1", &PolicyPatch::disable_all())
            .await;

        let policy = store.effective("att_1").await;
        // Second patch did not touch max_attempts
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.enabled_checks.is_empty());
    }

    #[tokio::test]
    async fn test_global_change_shows_through_unset_override_fields() {
        let store = PolicyStore::new(DetectionPolicy::default());
        store
            .patch_participant("att_1", &PolicyPatch::disable_all())
            .await;
        store.patch_global(&PolicyPatch::max_attempts(10)).await;

        let policy = store.effective("att_1").await;
        assert_eq!(policy.max_attempts, 10);
        assert!(policy.enabled_checks.is_empty());
    }

    #[tokio::test]
    async fn test_clear_override_restores_global() {
        let store = PolicyStore::new(DetectionPolicy::default());
        store
            .patch_participant("att_1", &PolicyPatch::disable_all())
            .await;
        store.clear_override("att_1").await;

        let policy = store.effective("att_1").await;
        assert_eq!(policy, DetectionPolicy::default());
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(clamp_max_attempts(0), 1);
        assert_eq!(clamp_max_attempts(25), 25);
        assert_eq!(clamp_max_attempts(1000), 50);

        let mut policy = DetectionPolicy::default();
        PolicyPatch::max_attempts(0).apply_to(&mut policy);
        assert_eq!(policy.max_attempts, 1);
    }
}
