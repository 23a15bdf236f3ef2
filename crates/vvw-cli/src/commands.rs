//! Subcommand implementations for the `vvw` CLI.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vvw_backend_mock::MockInferenceBackend;
use vvw_config::WorkflowConfig;
use vvw_core::{MachineStructure, ReferenceCategory, VerificationType};
use vvw_records::{FilesystemRecordStore, LayoutRecord};
use vvw_runtime::{fetcher, finalizer, initializer, processor, turn_executor};
use vvw_runtime::initializer::InitializationRequest;
use vvw_runtime::turn_executor::{TurnInputs, TurnNumber};
use vvw_store::{FilesystemObjectStore, ObjectStore};

/// Write `size` zero bytes under `<root>/<bucket>/<key>`, standing in for a
/// checking or reference image fixture.
pub async fn cmd_seed_image(root: &Path, bucket: &str, key: &str, size: u64) -> Result<()> {
    let store = FilesystemObjectStore::new(root, bucket);
    let bytes = vec![0u8; size as usize];
    store.put_bytes("", key, bytes).await.context("failed to seed image")?;
    println!("seeded {bucket}/{key} ({size} bytes)");
    Ok(())
}

/// Write a canonical 6x7 [`LayoutRecord`] under `<root>/records`.
pub async fn cmd_seed_layout(root: &Path, layout_id: i64, layout_prefix: &str) -> Result<()> {
    let records = FilesystemRecordStore::new(root.join("records"));
    records
        .put_layout(&LayoutRecord {
            layout_id,
            layout_prefix: layout_prefix.to_string(),
            machine_structure: MachineStructure::canonical_6x7(),
            metadata: BTreeMap::new(),
        })
        .await
        .context("failed to seed layout")?;
    println!("seeded layout {layout_id}/{layout_prefix}");
    Ok(())
}

/// Arguments for [`cmd_run`], gathered here so `main.rs`'s `Commands::Run`
/// variant stays a plain field list.
pub struct RunArgs {
    pub root: PathBuf,
    pub verification_id: Option<String>,
    pub vending_machine_id: String,
    pub verification_type: VerificationType,
    pub checking_image_url: String,
    pub reference_image_url: Option<String>,
    pub layout_id: Option<i64>,
    pub layout_prefix: Option<String>,
    pub previous_verification_id: Option<String>,
    pub checking_bucket: String,
    pub reference_bucket: String,
    pub state_bucket: String,
    pub json: bool,
}

/// Run a stage's result; on failure, record it under the envelope's
/// `errors/<stage>.json` before propagating (§4.2's "every stage writes
/// its error before failing the envelope").
macro_rules! stage_or_record {
    ($objects:expr, $envelope:expr, $stage:literal, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                let _ = vvw_runtime::record_failure($objects, $envelope, $stage, &err).await;
                return Err(err.into());
            }
        }
    };
}

const SYSTEM_PROMPT: &str = "You are inspecting a vending machine's shelves for stock verification.";

/// Canned response for the local mock backend: satisfies both the
/// VALIDATION_FLOW path (confirms structure, carries an observation) and
/// the two extraction paths (every row of the canonical 6x7 layout gets a
/// heading, so `ExtractedState` validation never fails on a missing row).
const MOCK_RESPONSE: &str = "Structure confirmed: true. The reference layout shows a 6 rows (A-F), 7 slots per row vending machine.\n\n\
    ## Row A\n**Status: full**\n- A1: soda\n\n\
    ## Row B\n**Status: full**\n- B1: chips\n\n\
    ## Row C\n**Status: full**\n- C1: candy\n\n\
    ## Row D\n**Status: full**\n- D1: water\n\n\
    ## Row E\n**Status: full**\n- E1: juice\n\n\
    ## Row F\n**Status: partial**\n- F1: empty";

fn user_text_for_turn1(context: &vvw_core::VerificationContext) -> String {
    match context.verification_type {
        VerificationType::LayoutVsChecking => {
            "Compare the reference layout image against the checking image and confirm whether the structure matches.".to_string()
        }
        VerificationType::PreviousVsCurrent => {
            "Describe the current state of every row and slot in the checking image.".to_string()
        }
    }
}

/// Run the full Initializer -> Fetcher -> Turn Executor (x2) -> Turn-1
/// Response Processor -> Finalizer pipeline against filesystem-backed
/// stores and a [`MockInferenceBackend`], printing the resulting
/// [`vvw_core::VerificationSummary`].
pub async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = WorkflowConfig::default();
    config.checking_bucket = args.checking_bucket;
    config.reference_bucket = args.reference_bucket;
    config.state_bucket = args.state_bucket;

    let objects = FilesystemObjectStore::new(&args.root, config.state_bucket.clone());
    let records = FilesystemRecordStore::new(args.root.join("records"));
    let backend = MockInferenceBackend::with_response(MOCK_RESPONSE);

    let request = InitializationRequest {
        verification_id: args.verification_id,
        vending_machine_id: args.vending_machine_id,
        verification_type: args.verification_type,
        checking_image_url: args.checking_image_url,
        reference_image_url: args.reference_image_url,
        layout_id: args.layout_id,
        layout_prefix: args.layout_prefix,
        previous_verification_id: args.previous_verification_id,
        notification_enabled: false,
    };

    let (mut envelope, record) = initializer::initialize(request, &objects, &records).await?;
    tracing::info!(verification_id = %envelope.verification_id, "initialized");

    let init_reference = envelope
        .get_reference(&ReferenceCategory::ProcessingInitialization)
        .cloned()
        .context("envelope missing its initialization reference")?;
    let context: vvw_core::VerificationContext = vvw_store::retrieve_json(&objects, &init_reference).await?;

    let (historical_context, _layout) = stage_or_record!(
        &objects,
        &mut envelope,
        "fetcher",
        fetcher::fetch(&mut envelope, &context, &record, &config, &objects, &records).await
    );
    tracing::info!(verification_id = %envelope.verification_id, "images fetched");

    let checking_bytes = objects
        .get_bytes(&vvw_core::Reference {
            bucket: config.checking_bucket.clone(),
            key: context.checking_image_key.clone(),
            size: 0,
        })
        .await?;
    let reference_bytes = match &context.reference_image_key {
        Some(key) => Some(
            objects
                .get_bytes(&vvw_core::Reference { bucket: config.reference_bucket.clone(), key: key.clone(), size: 0 })
                .await?,
        ),
        None => None,
    };

    let checking_image = turn_executor::stage_image(&checking_bytes, None, config.base64_size_threshold)?;
    let reference_image = reference_bytes
        .as_deref()
        .map(|bytes| turn_executor::stage_image(bytes, None, config.base64_size_threshold))
        .transpose()?;

    let turn1_inputs = TurnInputs {
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_text: user_text_for_turn1(&context),
        checking_image: checking_image.clone(),
        reference_image: reference_image.clone(),
        image_format: fetcher::infer_image_format(&context.checking_image_key),
    };
    let turn1_response = stage_or_record!(
        &objects,
        &mut envelope,
        "turn_executor",
        turn_executor::execute_turn(TurnNumber::One, turn1_inputs, &config, &backend, None).await
    );
    tracing::info!(verification_id = %envelope.verification_id, "turn 1 executed");

    let turn1_result = stage_or_record!(
        &objects,
        &mut envelope,
        "processor",
        processor::process_turn1_response(
            context.verification_type,
            &historical_context,
            &turn1_response.content,
            &chrono::Utc::now().to_rfc3339(),
        )
    );
    let confidence = vvw_validate::score_completeness(&turn1_result);
    let context_for_turn2 = processor::build_context_for_turn2(&turn1_result);

    let turn2_inputs = TurnInputs {
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_text: format!(
            "Confirm the final state, taking into account these observations: {}",
            turn1_result.observations().join("; ")
        ),
        checking_image,
        reference_image,
        image_format: fetcher::infer_image_format(&context.checking_image_key),
    };
    let turn2_response = stage_or_record!(
        &objects,
        &mut envelope,
        "turn_executor",
        turn_executor::execute_turn(TurnNumber::Two, turn2_inputs, &config, &backend, None).await
    );
    tracing::info!(verification_id = %envelope.verification_id, "turn 2 executed");

    let turn2_state = vvw_parser::parse_fresh_extraction(&turn2_response.content).state;

    let summary = stage_or_record!(
        &objects,
        &mut envelope,
        "finalizer",
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
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "verification {} -> {:?} ({} / {} checked, accuracy {}, confidence {})",
            summary.verification_id,
            summary.verification_outcome,
            summary.correct_positions,
            summary.total_positions_checked,
            summary.overall_accuracy,
            summary.overall_confidence,
        );
    }
    Ok(())
}
