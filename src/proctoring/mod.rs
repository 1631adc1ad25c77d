pub mod budget;
pub mod control;
pub mod detector;
pub mod policy;

use serde::{Deserialize, Serialize};

/// What the detector (or the host, for manual penalties) says went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    Absence,
    MultipleSubjects,
    GazeDeviation,
    EyesNotVisible,
    HandNearFace,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Low,
    Medium,
    High,
    /// Host-initiated penalty, independent of the detector
    Manual,
}

pub use budget::{AttemptBudget, BudgetEngine, ViolationOutcome, ViolationRecord};
pub use control::{ControlPlane, PolicyScope};
pub use detector::{DetectorClient, DetectorTranslator, FrameCheck};
pub use policy::{CheckKind, DetectionPolicy, PolicyPatch, PolicyStore};
