//! Stable contract types shared by every stage of the vending-machine
//! visual-verification workflow.
//!
//! This crate has no stage-specific logic; it exists so that the envelope,
//! status vocabulary, and record types have exactly one definition that
//! every other `vvw-*` crate depends on.

pub mod envelope;
pub mod machine;
pub mod status;
pub mod summary;
pub mod verification;

pub use envelope::{Envelope, EnvelopeInput, Reference, ReferenceCategory};
pub use machine::{ExtractedState, MachineStructure, RowState};
pub use status::WorkflowStatus;
pub use summary::{VerificationOutcome, VerificationSummary, DEFAULT_TOTAL_POSITIONS};
pub use verification::{
    allocate_verification_id, date_partition, select_processing_path, ProcessingMetrics,
    ProcessingPath, StatusTransition, TrackedError, VerificationContext, VerificationType,
};
