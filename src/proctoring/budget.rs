use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::policy::{clamp_max_attempts, PolicyPatch, PolicyStore};
use super::{Severity, ViolationKind};

/// How many violation records are retained per participant.
pub const HISTORY_WINDOW: usize = 10;

/// Immutable record of one accounted violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub source_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub attempts_used_after: u32,
    pub attempts_left_after: u32,
}

/// Per-participant violation budget, owned by the host's engine.
///
/// `used_attempts` may exceed `max_attempts`; `attempts_left` floors at
/// zero. `disconnect_emitted` latches after the exhaustion directive so
/// repeated violations never produce a second one; only an explicit
/// reset re-arms it.
#[derive(Debug, Clone)]
pub struct AttemptBudget {
    pub participant_id: String,
    pub max_attempts: u32,
    pub used_attempts: u32,
    pub history: VecDeque<ViolationRecord>,
    disconnect_emitted: bool,
}

impl AttemptBudget {
    fn new(participant_id: String, max_attempts: u32) -> Self {
        Self {
            participant_id,
            max_attempts,
            used_attempts: 0,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            disconnect_emitted: false,
        }
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.used_attempts)
    }
}

/// Result of accounting one violation.
#[derive(Debug, Clone)]
pub struct ViolationOutcome {
    pub record: ViolationRecord,
    /// Set on the single call that exhausts the budget under an
    /// auto-disconnect policy
    pub disconnect: bool,
}

/// Host-side Violation & Attempt-Budget Engine.
///
/// Budgets sit behind a per-participant mutex inside the shared map, so
/// violations for different participants account concurrently while
/// calls for the same participant serialize. That serialization is what
/// makes the exhaustion directive exactly-once.
pub struct BudgetEngine {
    budgets: RwLock<HashMap<String, Arc<Mutex<AttemptBudget>>>>,
    policies: Arc<PolicyStore>,
}

impl BudgetEngine {
    pub fn new(policies: Arc<PolicyStore>) -> Arc<Self> {
        Arc::new(Self {
            budgets: RwLock::new(HashMap::new()),
            policies,
        })
    }

    /// Ensure a budget exists for a newly observed participant, seeded
    /// from their effective policy. Idempotent.
    pub async fn observe(&self, participant_id: &str) {
        self.budget_cell(participant_id).await;
    }

    async fn budget_cell(&self, participant_id: &str) -> Arc<Mutex<AttemptBudget>> {
        {
            let budgets = self.budgets.read().await;
            if let Some(cell) = budgets.get(participant_id) {
                return cell.clone();
            }
        }

        let max_attempts = self.policies.effective(participant_id).await.max_attempts;
        let mut budgets = self.budgets.write().await;
        budgets
            .entry(participant_id.to_string())
            .or_insert_with(|| {
                tracing::info!(
                    participant_id = %participant_id,
                    max_attempts = max_attempts,
                    "Created attempt budget"
                );
                Arc::new(Mutex::new(AttemptBudget::new(
                    participant_id.to_string(),
                    max_attempts,
                )))
            })
            .clone()
    }

    /// Account one violation: bump the counter, append the bounded
    /// history record, and decide the disconnect directive, all under
    /// the participant's lock.
    pub async fn record_violation(
        &self,
        participant_id: &str,
        kind: ViolationKind,
        severity: Severity,
        source_timestamp: u64,
    ) -> ViolationOutcome {
        self.record(participant_id, kind, severity, source_timestamp, None)
            .await
    }

    /// Host-initiated penalty, accounted exactly like a detector one.
    pub async fn manual_violation(
        &self,
        participant_id: &str,
        label: impl Into<String>,
        source_timestamp: u64,
    ) -> ViolationOutcome {
        self.record(
            participant_id,
            ViolationKind::Manual,
            Severity::Manual,
            source_timestamp,
            Some(label.into()),
        )
        .await
    }

    async fn record(
        &self,
        participant_id: &str,
        kind: ViolationKind,
        severity: Severity,
        source_timestamp: u64,
        detail: Option<String>,
    ) -> ViolationOutcome {
        let auto_disconnect = self
            .policies
            .effective(participant_id)
            .await
            .auto_disconnect_on_exhaustion;
        let cell = self.budget_cell(participant_id).await;
        let mut budget = cell.lock().await;

        budget.used_attempts += 1;
        let record = ViolationRecord {
            kind,
            severity,
            source_timestamp,
            detail,
            attempts_used_after: budget.used_attempts,
            attempts_left_after: budget.attempts_left(),
        };

        budget.history.push_back(record.clone());
        while budget.history.len() > HISTORY_WINDOW {
            budget.history.pop_front();
        }

        let disconnect =
            budget.attempts_left() == 0 && auto_disconnect && !budget.disconnect_emitted;
        if disconnect {
            budget.disconnect_emitted = true;
        }

        tracing::info!(
            participant_id = %participant_id,
            ?kind,
            used_attempts = budget.used_attempts,
            attempts_left = budget.attempts_left(),
            disconnect = disconnect,
            "Recorded violation"
        );

        ViolationOutcome { record, disconnect }
    }

    /// Zero the counter and clear history; `max_attempts` is untouched.
    /// Re-arms the exhaustion directive.
    pub async fn reset_attempts(&self, participant_id: &str) {
        let cell = self.budget_cell(participant_id).await;
        let mut budget = cell.lock().await;
        budget.used_attempts = 0;
        budget.history.clear();
        budget.disconnect_emitted = false;
        tracing::info!(participant_id = %participant_id, "Attempt budget reset");
    }

    /// Update the configured maximum for one participant (`Some(id)`) or
    /// everyone (`None`), clamped to the legal range. `used_attempts`
    /// is never altered, so remaining attempts recompute naturally.
    pub async fn set_max_attempts(&self, participant_id: Option<&str>, n: u32) {
        let clamped = clamp_max_attempts(n);
        if clamped != n {
            tracing::warn!(requested = n, clamped = clamped, "Max attempts out of bounds, clamped");
        }

        match participant_id {
            Some(id) => {
                self.policies
                    .patch_participant(id, &PolicyPatch::max_attempts(clamped))
                    .await;
            }
            None => {
                self.policies
                    .patch_global(&PolicyPatch::max_attempts(clamped))
                    .await;
            }
        }
        self.apply_max(participant_id, clamped).await;
    }

    /// Recompute budget maxima after a policy change, without touching
    /// the policy store (the caller has already written it). A global
    /// change re-resolves every budget through the effective policy, so
    /// a participant whose override pins `max_attempts` keeps it.
    pub(crate) async fn apply_max(&self, participant_id: Option<&str>, n: u32) {
        match participant_id {
            Some(id) => {
                let cell = self.budget_cell(id).await;
                cell.lock().await.max_attempts = clamp_max_attempts(n);
            }
            None => {
                let cells: Vec<_> = {
                    let budgets = self.budgets.read().await;
                    budgets
                        .iter()
                        .map(|(id, cell)| (id.clone(), cell.clone()))
                        .collect()
                };
                for (id, cell) in cells {
                    let effective = self.policies.effective(&id).await.max_attempts;
                    cell.lock().await.max_attempts = effective;
                }
            }
        }
    }

    pub async fn snapshot(&self, participant_id: &str) -> Option<AttemptBudget> {
        let budgets = self.budgets.read().await;
        match budgets.get(participant_id) {
            Some(cell) => Some(cell.lock().await.clone()),
            None => None,
        }
    }
}
