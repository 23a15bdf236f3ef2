//! The monotonic status vocabulary that an [`crate::Envelope`] advances
//! through (§6 of the workflow spec).

use serde::{Deserialize, Serialize};
use std::fmt;

/// The workflow's status vocabulary.
///
/// Ordered so that `status as status` comparisons (via
/// [`WorkflowStatus::ordinal`]) express the monotonic invariant in §3:
/// "`status` advances monotonically through the vocabulary."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// The envelope has just been created.
    Initialized,
    /// The Initializer has stored the initial durable record.
    VerificationInitialized,
    /// The Fetcher has written image (and layout/historical) metadata.
    ImagesFetched,
    /// The system prompt has been built and stored.
    SystemPromptReady,
    /// Turn-1's prompt has been built and stored.
    Turn1PromptReady,
    /// Turn-1's raw model response has been persisted.
    Turn1Completed,
    /// Turn-1's response has been parsed into a structured result.
    Turn1Processed,
    /// Turn-2's prompt has been built and stored.
    Turn2PromptReady,
    /// Turn-2's raw model response has been persisted.
    Turn2Completed,
    /// Turn-2's response has been parsed into a structured result.
    Turn2Processed,
    /// The Finalizer has completed and the workflow is done.
    Completed,
    /// Terminal failure state; reachable from any non-terminal status.
    VerificationFailed,
}

/// The non-failure statuses in the order the workflow advances through them.
const ORDER: &[WorkflowStatus] = &[
    WorkflowStatus::Initialized,
    WorkflowStatus::VerificationInitialized,
    WorkflowStatus::ImagesFetched,
    WorkflowStatus::SystemPromptReady,
    WorkflowStatus::Turn1PromptReady,
    WorkflowStatus::Turn1Completed,
    WorkflowStatus::Turn1Processed,
    WorkflowStatus::Turn2PromptReady,
    WorkflowStatus::Turn2Completed,
    WorkflowStatus::Turn2Processed,
    WorkflowStatus::Completed,
];

impl WorkflowStatus {
    /// Stable string form (e.g. `"IMAGES_FETCHED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::VerificationInitialized => "VERIFICATION_INITIALIZED",
            Self::ImagesFetched => "IMAGES_FETCHED",
            Self::SystemPromptReady => "SYSTEM_PROMPT_READY",
            Self::Turn1PromptReady => "TURN1_PROMPT_READY",
            Self::Turn1Completed => "TURN1_COMPLETED",
            Self::Turn1Processed => "TURN1_PROCESSED",
            Self::Turn2PromptReady => "TURN2_PROMPT_READY",
            Self::Turn2Completed => "TURN2_COMPLETED",
            Self::Turn2Processed => "TURN2_PROCESSED",
            Self::Completed => "COMPLETED",
            Self::VerificationFailed => "VERIFICATION_FAILED",
        }
    }

    /// Position in the non-failure ordering, or `None` for the terminal
    /// failure status (which has no position — it is reachable from
    /// anywhere).
    #[must_use]
    pub fn ordinal(&self) -> Option<usize> {
        ORDER.iter().position(|s| s == self)
    }

    /// `true` if `self -> next` is a legal monotonic transition: either
    /// `next`'s ordinal is strictly greater than `self`'s, or `next` is the
    /// terminal failure status (reachable from any non-terminal status).
    #[must_use]
    pub fn can_advance_to(&self, next: WorkflowStatus) -> bool {
        if next == Self::VerificationFailed {
            return *self != Self::VerificationFailed;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
