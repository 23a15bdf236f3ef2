//! The Finalizer (C9, §4.9): combine the two turns' extracted state into a
//! [`VerificationSummary`], update the durable record to its terminal
//! state, and advance the envelope to `COMPLETED`.

use vvw_core::{
    Envelope, ExtractedState, ReferenceCategory, VerificationContext, VerificationOutcome, VerificationSummary,
    WorkflowStatus, DEFAULT_TOTAL_POSITIONS,
};
use vvw_error::WorkflowError;
use vvw_records::{RecordStore, VerificationRecord, VerificationStatus};
use vvw_store::ObjectStore;

/// Positions whose filled/empty status differs between the two turns'
/// extracted states (§4.9 step 2, "diff turn 1 vs. turn 2").
///
/// Computed as the symmetric difference of `filled_positions` between `a`
/// and `b`: a position filled in one turn but not the other.
#[must_use]
pub fn diff_positions(a: &ExtractedState, b: &ExtractedState) -> Vec<String> {
    let mut discrepant: Vec<String> = a
        .filled_positions
        .iter()
        .filter(|p| !b.filled_positions.contains(p))
        .cloned()
        .chain(b.filled_positions.iter().filter(|p| !a.filled_positions.contains(p)).cloned())
        .collect();
    discrepant.sort();
    discrepant.dedup();
    discrepant
}

fn verification_status_for(outcome: VerificationOutcome) -> VerificationStatus {
    match outcome {
        VerificationOutcome::Matched => VerificationStatus::Correct,
        VerificationOutcome::Discrepant => VerificationStatus::Incorrect,
        VerificationOutcome::Inconclusive => VerificationStatus::Success,
    }
}

/// Run the Finalizer (§4.9): reconcile turn-1/turn-2 extracted state into a
/// [`VerificationSummary`], persist it under the envelope, update the
/// durable [`VerificationRecord`] and conversation row to their terminal
/// state, and advance `envelope` to [`WorkflowStatus::Completed`].
///
/// When neither turn produced an extracted state, `total_positions`
/// defaults to [`DEFAULT_TOTAL_POSITIONS`] and the outcome comes back
/// [`VerificationOutcome::Inconclusive`] rather than failing the run (§9
/// Open Question: an empty summary is a warning, not an error).
///
/// # Errors
///
/// Returns [`vvw_error::ErrorCode::S3Error`]/[`vvw_error::ErrorCode::DynamoDbError`]
/// on storage failures, or [`vvw_error::ErrorCode::ValidationError`] if the
/// envelope's status cannot advance to `Completed`.
pub async fn finalize(
    envelope: &mut Envelope,
    context: &VerificationContext,
    turn1_extracted_state: Option<&ExtractedState>,
    turn2_extracted_state: Option<&ExtractedState>,
    confidence: f64,
    objects: &dyn ObjectStore,
    records: &dyn RecordStore,
) -> Result<VerificationSummary, WorkflowError> {
    let verification_id = &context.verification_id;

    let discrepant_positions = match (turn1_extracted_state, turn2_extracted_state) {
        (Some(t1), Some(t2)) => diff_positions(t1, t2),
        _ => Vec::new(),
    };

    let authoritative = turn2_extracted_state.or(turn1_extracted_state);
    let total_positions_checked = match authoritative {
        Some(state) => state.machine_structure.as_ref().map_or(state.total_filled_count + state.total_empty_count, |s| s.total_positions),
        None => {
            tracing::warn!(
                verification_id,
                "no extracted state available from either turn; defaulting totalPositionsChecked"
            );
            DEFAULT_TOTAL_POSITIONS
        }
    };
    let empty_positions_in_checking = authoritative.map(|s| s.empty_positions.clone()).unwrap_or_default();

    let summary = VerificationSummary::build(
        verification_id.clone(),
        total_positions_checked,
        discrepant_positions,
        empty_positions_in_checking,
        confidence,
    );

    let mut record = records
        .get_verification(verification_id)
        .await?
        .ok_or_else(|| WorkflowError::missing_field("verificationRecord").with_verification_id(verification_id.clone()))?;

    let now = chrono::Utc::now().to_rfc3339();
    record.status = WorkflowStatus::Completed;
    record.current_status = Some(WorkflowStatus::Completed);
    record.verification_status = Some(verification_status_for(summary.verification_outcome));
    record.last_updated_at = now.clone();
    record.status_history.push(vvw_core::StatusTransition {
        status: WorkflowStatus::Completed,
        timestamp: now.clone(),
        stage: "finalizer".to_string(),
    });
    records.upsert_verification(record).await?;

    records.update_conversation_status(verification_id, "WORKFLOW_COMPLETED").await?;

    vvw_store::save_to_envelope(objects, envelope, &ReferenceCategory::ResultsVerificationSummary, &summary).await?;
    envelope.advance_status(WorkflowStatus::Completed)?;

    envelope.summary.insert("verificationStatus".to_string(), serde_json::json!(verification_status_for(summary.verification_outcome)));
    envelope.summary.insert("verificationAt".to_string(), serde_json::json!(now));
    envelope.summary.insert(
        "message".to_string(),
        serde_json::json!(format!(
            "verification {verification_id} completed: {:?} ({}/{} positions checked)",
            summary.verification_outcome, summary.correct_positions, summary.total_positions_checked
        )),
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vvw_core::{MachineStructure, RowState, VerificationType};
    use vvw_records::{ConversationRecord, FilesystemRecordStore};
    use vvw_store::FilesystemObjectStore;

    fn context() -> VerificationContext {
        VerificationContext {
            verification_id: "verif-20250605074028-f5c4".to_string(),
            verification_type: VerificationType::LayoutVsChecking,
            vending_machine_id: "vm-1".to_string(),
            checking_image_key: "b.jpg".to_string(),
            reference_image_key: Some("a.png".to_string()),
            request_metadata: BTreeMap::new(),
        }
    }

    fn seeded_record(id: &str) -> VerificationRecord {
        VerificationRecord {
            verification_id: id.to_string(),
            verification_at: "2025-06-05T07:40:28Z".to_string(),
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: "s3://reference/a.png".to_string(),
            checking_image_url: "s3://checking/b.jpg".to_string(),
            vending_machine_id: "vm-1".to_string(),
            layout_id: None,
            layout_prefix: None,
            previous_verification_id: None,
            notification_enabled: false,
            status: WorkflowStatus::Turn1Processed,
            last_updated_at: "2025-06-05T07:40:28Z".to_string(),
            current_status: None,
            verification_status: None,
            status_history: vec![],
            processing_metrics: vvw_core::ProcessingMetrics::default(),
            error_tracking: vec![],
        }
    }

    fn state_with_filled(filled: &[&str]) -> ExtractedState {
        let mut state = ExtractedState {
            machine_structure: Some(MachineStructure::canonical_6x7()),
            ..Default::default()
        };
        state.row_states.insert(
            "A".to_string(),
            RowState { filled_positions: filled.iter().map(|s| s.to_string()).collect(), ..Default::default() },
        );
        state.recompute_aggregates();
        state
    }

    #[tokio::test]
    async fn matching_turns_yield_matched_outcome_and_completed_record() {
        let dir = tempfile::tempdir().unwrap();
        let records = FilesystemRecordStore::new(dir.path());
        let objects = FilesystemObjectStore::new(dir.path(), "state");
        records.upsert_verification(seeded_record("verif-20250605074028-f5c4")).await.unwrap();
        records
            .put_conversation(&ConversationRecord {
                verification_id: "verif-20250605074028-f5c4".to_string(),
                conversation_at: "2025-06-05T07:41:00Z".to_string(),
                turn_status: "TURN1_COMPLETED".to_string(),
            })
            .await
            .unwrap();

        let mut envelope = Envelope::new("verif-20250605074028-f5c4");
        envelope.advance_status(WorkflowStatus::VerificationInitialized).unwrap();
        envelope.advance_status(WorkflowStatus::Turn1Processed).unwrap();

        let turn1 = state_with_filled(&["A1", "A2"]);
        let turn2 = state_with_filled(&["A1", "A2"]);

        let summary = finalize(&mut envelope, &context(), Some(&turn1), Some(&turn2), 0.95, &objects, &records)
            .await
            .unwrap();
        assert_eq!(summary.verification_outcome, VerificationOutcome::Matched);
        assert_eq!(envelope.status, WorkflowStatus::Completed);

        let record = records.get_verification("verif-20250605074028-f5c4").await.unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.verification_status, Some(VerificationStatus::Correct));
    }

    #[tokio::test]
    async fn discrepant_turns_surface_symmetric_difference() {
        let dir = tempfile::tempdir().unwrap();
        let records = FilesystemRecordStore::new(dir.path());
        let objects = FilesystemObjectStore::new(dir.path(), "state");
        records.upsert_verification(seeded_record("verif-20250605074028-f5c4")).await.unwrap();
        records
            .put_conversation(&ConversationRecord {
                verification_id: "verif-20250605074028-f5c4".to_string(),
                conversation_at: "2025-06-05T07:41:00Z".to_string(),
                turn_status: "TURN1_COMPLETED".to_string(),
            })
            .await
            .unwrap();

        let mut envelope = Envelope::new("verif-20250605074028-f5c4");
        envelope.advance_status(WorkflowStatus::VerificationInitialized).unwrap();
        envelope.advance_status(WorkflowStatus::Turn1Processed).unwrap();

        let turn1 = state_with_filled(&["A1", "A2"]);
        let turn2 = state_with_filled(&["A1", "A3"]);

        let summary = finalize(&mut envelope, &context(), Some(&turn1), Some(&turn2), 0.8, &objects, &records)
            .await
            .unwrap();
        assert_eq!(summary.verification_outcome, VerificationOutcome::Discrepant);
        assert_eq!(summary.discrepant_positions, vec!["A2".to_string(), "A3".to_string()]);
    }

    #[tokio::test]
    async fn missing_both_states_is_inconclusive_with_default_positions() {
        let dir = tempfile::tempdir().unwrap();
        let records = FilesystemRecordStore::new(dir.path());
        let objects = FilesystemObjectStore::new(dir.path(), "state");
        records.upsert_verification(seeded_record("verif-20250605074028-f5c4")).await.unwrap();
        records
            .put_conversation(&ConversationRecord {
                verification_id: "verif-20250605074028-f5c4".to_string(),
                conversation_at: "2025-06-05T07:41:00Z".to_string(),
                turn_status: "TURN1_COMPLETED".to_string(),
            })
            .await
            .unwrap();

        let mut envelope = Envelope::new("verif-20250605074028-f5c4");
        envelope.advance_status(WorkflowStatus::VerificationInitialized).unwrap();
        envelope.advance_status(WorkflowStatus::Turn1Processed).unwrap();

        let summary = finalize(&mut envelope, &context(), None, None, 0.0, &objects, &records).await.unwrap();
        assert_eq!(summary.verification_outcome, VerificationOutcome::Inconclusive);
        assert_eq!(summary.total_positions_checked, DEFAULT_TOTAL_POSITIONS);
    }

    #[tokio::test]
    async fn finalize_without_existing_record_is_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        let records = FilesystemRecordStore::new(dir.path());
        let objects = FilesystemObjectStore::new(dir.path(), "state");
        let mut envelope = Envelope::new("verif-20250605074028-f5c4");
        envelope.advance_status(WorkflowStatus::VerificationInitialized).unwrap();
        envelope.advance_status(WorkflowStatus::Turn1Processed).unwrap();

        let err = finalize(&mut envelope, &context(), None, None, 0.0, &objects, &records).await.unwrap_err();
        assert_eq!(err.code, vvw_error::ErrorCode::MissingField);
    }

    #[test]
    fn diff_positions_is_symmetric() {
        let a = state_with_filled(&["A1", "A2"]);
        let b = state_with_filled(&["A2", "A3"]);
        assert_eq!(diff_positions(&a, &b), diff_positions(&b, &a));
    }
}
