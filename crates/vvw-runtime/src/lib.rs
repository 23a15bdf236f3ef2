//! Stage orchestration (§4.3-§4.9): each module is one pipeline stage,
//! plumbed over the `ObjectStore`/`RecordStore`/`InferenceBackend` seams.
//! `vvw-cli` sequences these functions for local runs.

pub mod fetcher;
pub mod finalizer;
pub mod historical;
pub mod initializer;
pub mod processor;
pub mod turn_executor;

use vvw_core::{Envelope, ReferenceCategory, WorkflowStatus};
use vvw_error::WorkflowError;
use vvw_store::ObjectStore;

/// Record a stage failure: persist `err` under `errors/<stage>.json` and
/// advance the envelope to [`WorkflowStatus::VerificationFailed`].
///
/// Mirrors every stage's failure path (§4.2 "every stage writes its error
/// under its own category before failing the envelope"). Storage errors
/// encountered while recording the failure are themselves propagated,
/// since a failure that can't be written down is worse than none.
///
/// # Errors
///
/// Returns [`vvw_error::ErrorCode::S3Error`] if writing the error blob
/// fails, or the [`vvw_error::ErrorCode::ValidationError`] from an illegal
/// status transition (should not happen: failure is reachable from any
/// non-terminal status).
pub async fn record_failure(
    objects: &dyn ObjectStore,
    envelope: &mut Envelope,
    stage: &str,
    err: &WorkflowError,
) -> Result<(), WorkflowError> {
    let dto = vvw_error::WorkflowErrorDto::from(err);
    vvw_store::save_to_envelope(objects, envelope, &ReferenceCategory::Errors(stage.to_string()), &dto).await?;
    envelope.advance_status(WorkflowStatus::VerificationFailed)?;
    Ok(())
}
