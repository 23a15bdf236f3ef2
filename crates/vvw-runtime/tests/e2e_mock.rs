//! End-to-end tests driving the full stage pipeline against
//! filesystem-backed stores and the mock inference backend.

use vvw_backend_mock::MockInferenceBackend;
use vvw_config::WorkflowConfig;
use vvw_core::{ReferenceCategory, VerificationContext, VerificationType};
use vvw_records::{FilesystemRecordStore, RecordStore};
use vvw_runtime::initializer::InitializationRequest;
use vvw_runtime::turn_executor::{TurnInputs, TurnNumber};
use vvw_runtime::{fetcher, finalizer, initializer, processor};
use vvw_store::{FilesystemObjectStore, ObjectStore};

const FRESH_EXTRACTION_RESPONSE: &str = "## Row A\n**Status: full**\n- A1: soda\n\n\
    ## Row B\n**Status: full**\n- B1: chips\n\n\
    ## Row C\n**Status: full**\n- C1: candy\n\n\
    ## Row D\n**Status: full**\n- D1: water\n\n\
    ## Row E\n**Status: full**\n- E1: juice\n\n\
    ## Row F\n**Status: partial**\n- F1: empty";

/// Same layout as [`FRESH_EXTRACTION_RESPONSE`] except row C comes back
/// empty, so diffing it against a turn 1 that reported C1 filled yields a
/// discrepant C1 — used to seed a prior verification whose outcome is
/// `Discrepant`, so its `verificationSummary` carries a real
/// `discrepant_positions` entry for the historical-enhancement test to
/// derive `knownIssues` from.
const FRESH_EXTRACTION_RESPONSE_ROW_C_EMPTIED: &str = "## Row A\n**Status: full**\n- A1: soda\n\n\
    ## Row B\n**Status: full**\n- B1: chips\n\n\
    ## Row C\n**Status: empty**\n- C1: empty\n\n\
    ## Row D\n**Status: full**\n- D1: water\n\n\
    ## Row E\n**Status: full**\n- E1: juice\n\n\
    ## Row F\n**Status: partial**\n- F1: empty";

const VALIDATION_FLOW_RESPONSE: &str =
    "Structure confirmed: true. The reference layout shows a 6 rows (A-F), 7 slots per row vending machine.";

async fn seed_image(root: &std::path::Path, bucket: &str, key: &str) {
    let store = FilesystemObjectStore::new(root, bucket);
    store.put_bytes("", key, vec![0u8; 64]).await.expect("seed image");
}

/// [`WorkflowConfig::default`] leaves the bucket names empty (they're
/// meant to come from the environment via `vvw_config::load`); tests fill
/// them in the way `vvw-cli` does.
fn test_config() -> WorkflowConfig {
    WorkflowConfig {
        checking_bucket: "checking".to_string(),
        reference_bucket: "reference".to_string(),
        state_bucket: "state".to_string(),
        ..WorkflowConfig::default()
    }
}

/// Run init -> fetch -> turn 1 -> process -> turn 2 -> finalize against a
/// tempdir-backed store, returning the resulting summary.
async fn run_pipeline(
    root: &std::path::Path,
    request: InitializationRequest,
    raw_turn1_response: &str,
    raw_turn2_response: &str,
) -> vvw_core::VerificationSummary {
    let config = test_config();
    let objects = FilesystemObjectStore::new(root, config.state_bucket.clone());
    let records = FilesystemRecordStore::new(root.join("records"));
    let backend = MockInferenceBackend::with_response(raw_turn1_response);

    let (mut envelope, record) = initializer::initialize(request, &objects, &records).await.expect("initialize");

    let init_reference = envelope
        .get_reference(&ReferenceCategory::ProcessingInitialization)
        .cloned()
        .expect("envelope carries its initialization reference");
    let context: VerificationContext = vvw_store::retrieve_json(&objects, &init_reference).await.expect("retrieve context");

    let (historical_context, _layout) =
        fetcher::fetch(&mut envelope, &context, &record, &config, &objects, &records).await.expect("fetch");

    let checking_image =
        vvw_runtime::turn_executor::stage_image(&[0u8; 64], None, config.base64_size_threshold).expect("stage checking image");
    let reference_image = if context.reference_image_key.is_some() {
        Some(vvw_runtime::turn_executor::stage_image(&[0u8; 64], None, config.base64_size_threshold).expect("stage reference image"))
    } else {
        None
    };

    let turn1_inputs = TurnInputs {
        system_prompt: "inspect the vending machine".to_string(),
        user_text: "describe what you see".to_string(),
        checking_image: checking_image.clone(),
        reference_image: reference_image.clone(),
        image_format: "jpeg".to_string(),
    };
    let turn1_response =
        vvw_runtime::turn_executor::execute_turn(TurnNumber::One, turn1_inputs, &config, &backend, None)
            .await
            .expect("execute turn 1");

    let turn1_result = processor::process_turn1_response(
        context.verification_type,
        &historical_context,
        &turn1_response.content,
        "2025-06-09T00:00:00Z",
    )
    .expect("process turn 1");
    let confidence = vvw_validate::score_completeness(&turn1_result);
    let context_for_turn2 = processor::build_context_for_turn2(&turn1_result);

    let backend2 = MockInferenceBackend::with_response(raw_turn2_response);
    let turn2_inputs = TurnInputs {
        system_prompt: "inspect the vending machine".to_string(),
        user_text: "confirm the final state".to_string(),
        checking_image,
        reference_image,
        image_format: "jpeg".to_string(),
    };
    let turn2_response =
        vvw_runtime::turn_executor::execute_turn(TurnNumber::Two, turn2_inputs, &config, &backend2, None)
            .await
            .expect("execute turn 2");
    let turn2_state = vvw_parser::parse_fresh_extraction(&turn2_response.content).state;

    finalizer::finalize(
        &mut envelope,
        &context,
        context_for_turn2.extracted_state(),
        Some(&turn2_state),
        confidence,
        &objects,
        &records,
    )
    .await
    .expect("finalize")
}

fn layout_vs_checking_request() -> InitializationRequest {
    InitializationRequest {
        verification_id: None,
        vending_machine_id: "vm-1".to_string(),
        verification_type: VerificationType::LayoutVsChecking,
        checking_image_url: "s3://checking/current.jpg".to_string(),
        reference_image_url: Some("s3://reference/planogram.png".to_string()),
        layout_id: None,
        layout_prefix: None,
        previous_verification_id: None,
        notification_enabled: false,
    }
}

fn previous_vs_current_request() -> InitializationRequest {
    InitializationRequest {
        verification_id: None,
        vending_machine_id: "vm-1".to_string(),
        verification_type: VerificationType::PreviousVsCurrent,
        checking_image_url: "s3://checking/current.jpg".to_string(),
        reference_image_url: None,
        layout_id: None,
        layout_prefix: None,
        previous_verification_id: None,
        notification_enabled: false,
    }
}

// ---------- 1. Happy LAYOUT_VS_CHECKING ----------

#[tokio::test]
async fn happy_layout_vs_checking_completes() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    seed_image(tmp.path(), "checking", "current.jpg").await;
    seed_image(tmp.path(), "reference", "planogram.png").await;

    let summary = run_pipeline(
        tmp.path(),
        layout_vs_checking_request(),
        VALIDATION_FLOW_RESPONSE,
        VALIDATION_FLOW_RESPONSE,
    )
    .await;

    assert!(summary.total_positions_checked > 0);
}

// ---------- 2. Historical-enhancement path ----------

#[tokio::test]
async fn previous_vs_current_with_history_takes_historical_enhancement() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    seed_image(tmp.path(), "checking", "current.jpg").await;
    // The second run names this same image as its `reference_image_url`
    // (the Fetcher always HEADs reference images from `reference_bucket`).
    seed_image(tmp.path(), "reference", "current.jpg").await;

    // Seed a completed, discrepant prior verification for the same vending
    // machine: turn 1 reports C1 filled, turn 2 reports it empty.
    let prior_summary = run_pipeline(
        tmp.path(),
        previous_vs_current_request(),
        FRESH_EXTRACTION_RESPONSE,
        FRESH_EXTRACTION_RESPONSE_ROW_C_EMPTIED,
    )
    .await;
    assert_eq!(prior_summary.verification_outcome, vvw_core::VerificationOutcome::Discrepant);

    let config = test_config();
    let records = FilesystemRecordStore::new(tmp.path().join("records"));
    let prior_record = records
        .get_verification(&prior_summary.verification_id)
        .await
        .expect("lookup prior record")
        .expect("prior record exists");

    // §4.5's query is driven by the record store's own index, not a
    // caller-supplied id: this run names its `reference_image_url` as the
    // prior run's `checking_image_url` so the two line up.
    let request = InitializationRequest {
        reference_image_url: Some(prior_record.checking_image_url.clone()),
        ..previous_vs_current_request()
    };

    let objects2 = FilesystemObjectStore::new(tmp.path(), config.state_bucket.clone());
    let (mut envelope, record) = initializer::initialize(request, &objects2, &records).await.expect("initialize");
    let init_reference = envelope.get_reference(&ReferenceCategory::ProcessingInitialization).cloned().unwrap();
    let context: VerificationContext = vvw_store::retrieve_json(&objects2, &init_reference).await.unwrap();

    let (historical_context, _layout) =
        fetcher::fetch(&mut envelope, &context, &record, &config, &objects2, &records).await.expect("fetch");

    assert!(historical_context.present, "historical context should resolve via the checking-image-url index");
    let result = processor::process_turn1_response(
        context.verification_type,
        &historical_context,
        FRESH_EXTRACTION_RESPONSE,
        "2025-06-09T00:00:00Z",
    )
    .expect("process turn 1");
    assert_eq!(result.path(), vvw_core::ProcessingPath::HistoricalEnhancement);

    match result {
        vvw_validate::Turn1ProcessingResult::HistoricalEnhancement {
            source_type, known_issues, focus_areas, ..
        } => {
            assert_eq!(source_type, vvw_validate::SourceType::HistoricalWithVisualConfirmation);
            assert!(
                known_issues.contains(&"incorrect_products".to_string()),
                "a discrepant prior verification should carry `incorrect_products` forward as a known issue"
            );
            assert_eq!(focus_areas, vec!["C".to_string()], "row C should be flagged as a focus area from the prior discrepancy");
        }
        _ => panic!("expected HistoricalEnhancement"),
    }
}

// ---------- 3. Fresh-extraction with implausible structure ----------

#[tokio::test]
async fn fresh_extraction_falls_back_on_implausible_structure() {
    // No recognizable row headings or dimension phrase: `extract_machine_structure`
    // can't infer anything plausible and falls back to the canonical 6x7 layout
    // rather than leaving the response unvalidatable.
    let garbled_response = "the shelves look about the same as before, nothing else to report";

    let result = processor::process_turn1_response(
        VerificationType::PreviousVsCurrent,
        &vvw_runtime::historical::HistoricalContext::default(),
        garbled_response,
        "2025-06-09T00:00:00Z",
    )
    .expect("fresh extraction still validates via the canonical fallback");

    assert_eq!(result.path(), vvw_core::ProcessingPath::FreshExtraction);
    let fallback_used = match &result {
        vvw_validate::Turn1ProcessingResult::FreshExtraction { fallback_used, .. } => *fallback_used,
        _ => panic!("expected FreshExtraction"),
    };
    assert!(fallback_used, "an unrecognizable structure should trigger the canonical fallback");
    let state = result.extracted_state().expect("fallback still produces an extracted state");
    assert_eq!(state.machine_structure.as_ref().unwrap().row_count, 6);
}

// ---------- 4. Transient DynamoDB throttling recovers under retry ----------

#[tokio::test]
async fn transient_throttling_recovers_under_retry_policy() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use vvw_error::{ErrorCode, WorkflowError};

    let attempts = AtomicU32::new(0);
    let policy = vvw_retry::RetryPolicy::default();

    let result: Result<&'static str, WorkflowError> = policy
        .retry(Duration::from_secs(5), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(WorkflowError::new(ErrorCode::DynamoDbError, "ProvisionedThroughputExceededException")
                        .retryable(true))
                } else {
                    Ok("layout row")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "layout row");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "should succeed on the third attempt");
}

// ---------- 5. Missing initialization context on finalization ----------

#[tokio::test]
async fn finalize_without_a_verification_record_fails() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let config = test_config();
    let objects = FilesystemObjectStore::new(tmp.path(), config.state_bucket.clone());
    let records = FilesystemRecordStore::new(tmp.path().join("records"));

    let context = VerificationContext {
        verification_id: "verif-never-initialized".to_string(),
        verification_type: VerificationType::PreviousVsCurrent,
        vending_machine_id: "vm-1".to_string(),
        checking_image_key: "current.jpg".to_string(),
        reference_image_key: None,
        request_metadata: Default::default(),
    };
    let mut envelope = vvw_core::Envelope::new(&context.verification_id);

    let err = finalizer::finalize(&mut envelope, &context, None, None, 0.5, &objects, &records)
        .await
        .expect_err("finalize should fail when no verification record was ever stored");

    assert_eq!(err.code, vvw_error::ErrorCode::MissingField);
}

// ---------- 6. Idempotent re-run ----------

#[tokio::test]
async fn idempotent_replay_reuses_the_existing_record() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    seed_image(tmp.path(), "checking", "current.jpg").await;
    seed_image(tmp.path(), "reference", "planogram.png").await;

    let config = test_config();
    let state_objects = FilesystemObjectStore::new(tmp.path(), config.state_bucket.clone());
    let records = FilesystemRecordStore::new(tmp.path().join("records"));

    let request = InitializationRequest { verification_id: Some("verif-fixed-id".to_string()), ..layout_vs_checking_request() };

    let (_envelope1, record1) =
        initializer::initialize(request.clone(), &state_objects, &records).await.expect("first initialize");
    let (_envelope2, record2) =
        initializer::initialize(request, &state_objects, &records).await.expect("second (replay) initialize");

    assert_eq!(record1.verification_id, record2.verification_id);
    assert_eq!(record1.verification_at, record2.verification_at, "replay must not re-stamp the timestamp");

    let stored = records.get_verification("verif-fixed-id").await.unwrap().unwrap();
    assert_eq!(stored.verification_id, "verif-fixed-id");
}
