//! The Turn-1 Response Processor (C7, §4.7): select the processing path,
//! parse the raw model response, and validate the resulting boundary
//! object before it is handed to the Finalizer or Turn-2 prompt builder.

use vvw_core::{select_processing_path, ProcessingPath, VerificationType};
use vvw_error::WorkflowError;
use vvw_validate::{
    ContextForTurn2, ExtractionContext, SourceType, Turn1ProcessingResult, Turn1Status, ValidationFlowContext,
};

use crate::historical::HistoricalContext;

/// Process a raw Turn-1 model response (§4.7.1-§4.7.3): select the path
/// from `verification_type`/`historical_context`, dispatch to the matching
/// parser, assemble the path's `referenceAnalysis`/`contextForTurn2`
/// contract (§4.7.2), and validate the result.
///
/// `enhancement_timestamp` is only consulted on the `HISTORICAL_ENHANCEMENT`
/// path, where it becomes `enrichedBaseline.enhancementTimestamp`.
///
/// # Errors
///
/// Returns [`vvw_error::ErrorCode::ParsingError`] if `raw_response` is
/// empty, or propagates [`vvw_validate::validate_turn1_result`]'s errors
/// when the parsed payload doesn't satisfy its path's requirements.
pub fn process_turn1_response(
    verification_type: VerificationType,
    historical_context: &HistoricalContext,
    raw_response: &str,
    enhancement_timestamp: &str,
) -> Result<Turn1ProcessingResult, WorkflowError> {
    vvw_parser::require_non_empty(raw_response)?;

    let path = select_processing_path(verification_type, historical_context.present);
    let result = match path {
        ProcessingPath::ValidationFlow => {
            let parsed = vvw_parser::parse_validation_flow(raw_response);
            Turn1ProcessingResult::ValidationFlow {
                status: Turn1Status::ValidationComplete,
                source_type: SourceType::ReferenceValidation,
                context_for_turn2: ContextForTurn2::ValidationFlow(ValidationFlowContext {
                    reference_validated: true,
                    use_system_prompt_reference: true,
                    validation_passed: parsed.structure_confirmed,
                    ready_for_turn2: true,
                }),
                validation_results: parsed,
            }
        }
        ProcessingPath::HistoricalEnhancement => {
            let parsed = vvw_parser::parse_historical_enhancement(
                raw_response,
                historical_context.previous_verification_id.as_deref(),
                historical_context.previous_summary.as_ref(),
                enhancement_timestamp,
            );
            let extracted_structure = parsed
                .state
                .machine_structure
                .clone()
                .unwrap_or_else(vvw_core::MachineStructure::canonical_6x7);
            Turn1ProcessingResult::HistoricalEnhancement {
                status: Turn1Status::ExtractionComplete,
                source_type: SourceType::HistoricalWithVisualConfirmation,
                historical_baseline: parsed.historical_baseline,
                visual_confirmation: parsed.visual_confirmation,
                enriched_baseline: parsed.enhanced_baseline,
                focus_areas: parsed.focus_areas,
                known_issues: parsed.known_issues,
                fallback_used: parsed.fallback_used,
                context_for_turn2: ContextForTurn2::Extraction(ExtractionContext {
                    baseline_source: "ENHANCED_BASELINE".to_string(),
                    use_historical_data: true,
                    extracted_data_available: true,
                    ready_for_turn2: true,
                    extracted_structure,
                    extracted_state: parsed.state,
                }),
            }
        }
        ProcessingPath::FreshExtraction => {
            let parsed = vvw_parser::parse_fresh_extraction(raw_response);
            let extracted_structure = parsed
                .state
                .machine_structure
                .clone()
                .unwrap_or_else(vvw_core::MachineStructure::canonical_6x7);
            Turn1ProcessingResult::FreshExtraction {
                status: Turn1Status::ExtractionComplete,
                source_type: SourceType::FreshVisualAnalysis,
                extracted_structure: extracted_structure.clone(),
                extracted_state: parsed.state.clone(),
                fallback_used: parsed.fallback_used,
                context_for_turn2: ContextForTurn2::Extraction(ExtractionContext {
                    baseline_source: "EXTRACTED_STATE".to_string(),
                    use_historical_data: false,
                    extracted_data_available: true,
                    ready_for_turn2: true,
                    extracted_structure,
                    extracted_state: parsed.state,
                }),
            }
        }
    };

    vvw_validate::validate_turn1_result(&result)?;
    Ok(result)
}

/// Build the context handed to the Turn Executor for turn 2 (§4.7.2
/// `contextForTurn2`), already assembled by [`process_turn1_response`] — this
/// just hands back a clone for callers that want to keep `result` around.
#[must_use]
pub fn build_context_for_turn2(result: &Turn1ProcessingResult) -> ContextForTurn2 {
    result.context_for_turn2().clone()
}
