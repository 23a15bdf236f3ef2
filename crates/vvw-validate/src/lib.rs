//! Boundary validation and completeness scoring (§4.8, the Validator).
//!
//! Every function here checks one handoff point in the pipeline. None of
//! them mutate their argument; a failing check returns a
//! [`WorkflowError`] describing exactly which field or invariant broke,
//! so a caller can decide whether the failure is local-recoverable or
//! must surface.

#![deny(unsafe_code)]

use vvw_backend_core::{ContentBlock, ImageSource, InferenceRequest};
use vvw_config::WorkflowConfig;
use vvw_core::{ExtractedState, MachineStructure, ProcessingPath, VerificationContext};
use vvw_error::{ErrorCode, WorkflowError};
use vvw_parser::{BaselineData, EnhancedBaseline, ValidationFlowResult};

/// Check a [`VerificationContext`] at the boundary where it's handed from
/// the Initializer to the Fetcher: re-runs its own cross-field invariant
/// and additionally rejects an empty `checking_image_key`.
///
/// # Errors
///
/// Returns [`ErrorCode::MissingField`] or [`ErrorCode::ValidationError`].
pub fn validate_verification_context(ctx: &VerificationContext) -> Result<(), WorkflowError> {
    ctx.validate()?;
    if ctx.checking_image_key.trim().is_empty() {
        return Err(WorkflowError::missing_field("checkingImageKey")
            .with_verification_id(ctx.verification_id.clone()));
    }
    Ok(())
}

/// Check that `config` carries everything the Turn Executor needs to
/// build a Bedrock-style invocation (§4.6 "Request shape").
///
/// # Errors
///
/// Returns [`ErrorCode::MissingField`] if `bedrock_model`, `bedrock_region`,
/// or `anthropic_version` is empty, or [`ErrorCode::ValidationError`] if
/// `max_tokens` is zero.
pub fn validate_bedrock_config(config: &WorkflowConfig) -> Result<(), WorkflowError> {
    for (field, value) in [
        ("bedrockModel", &config.bedrock_model),
        ("bedrockRegion", &config.bedrock_region),
        ("anthropicVersion", &config.anthropic_version),
    ] {
        if value.trim().is_empty() {
            return Err(WorkflowError::missing_field(field));
        }
    }
    if config.max_tokens == 0 {
        return Err(WorkflowError::new(ErrorCode::ValidationError, "maxTokens must be > 0"));
    }
    Ok(())
}

/// Check a fully assembled [`InferenceRequest`] before it's sent (§4.6):
/// the current prompt (the last message's text content) must be
/// non-empty, and `system` must be non-empty.
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if either is empty.
pub fn validate_current_prompt(request: &InferenceRequest) -> Result<(), WorkflowError> {
    if request.system.trim().is_empty() {
        return Err(WorkflowError::new(ErrorCode::ValidationError, "system prompt is empty"));
    }
    let has_text = request
        .messages
        .last()
        .is_some_and(|m| m.content.iter().any(|c| matches!(c, ContentBlock::Text { text } if !text.trim().is_empty())));
    if !has_text {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            "current prompt has no non-empty text content",
        ));
    }
    Ok(())
}

/// Check a single [`ImageSource`] (§4.6 "Image delivery"): exactly one of
/// `bytes` or `staged_key` must be present, never both, never neither.
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] on a missing or doubled source.
pub fn validate_image_data(source: &ImageSource) -> Result<(), WorkflowError> {
    match (&source.bytes, &source.staged_key) {
        (Some(_), Some(_)) => Err(WorkflowError::new(
            ErrorCode::ValidationError,
            "image source carries both inline bytes and a staged key",
        )),
        (None, None) => Err(WorkflowError::new(
            ErrorCode::ValidationError,
            "image source carries neither inline bytes nor a staged key",
        )),
        _ => Ok(()),
    }
}

/// Check a [`MachineStructure`] at the boundary between extraction and
/// persistence: delegates to its own invariant check, then additionally
/// flags implausible dimensions as a hard validation failure (by this
/// point the canonical-6×7 fallback should already have been applied, so
/// an implausible structure here indicates a caller bypassed it).
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`].
pub fn validate_machine_structure(structure: &MachineStructure) -> Result<(), WorkflowError> {
    structure.validate()?;
    if structure.is_implausible() {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!(
                "machine structure {}x{} is implausible and was not replaced by the canonical fallback",
                structure.row_count, structure.columns_per_row
            ),
        ));
    }
    Ok(())
}

/// Check an [`ExtractedState`] against its declared [`MachineStructure`]
/// (§4.8 `ExtractedState` validation, §8 invariant 6).
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if aggregates are inconsistent,
/// a row's positions overlap, or a declared row has no recorded state.
pub fn validate_extracted_state(state: &ExtractedState) -> Result<(), WorkflowError> {
    if !state.aggregates_are_consistent() {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            "extracted state aggregates do not match the sum of per-row positions",
        ));
    }
    for (row_id, row) in &state.row_states {
        if !row.positions_disjoint() {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!("row {row_id} lists a position as both filled and empty"),
            ));
        }
    }
    if let Some(structure) = &state.machine_structure {
        if !state.every_row_has_state(structure) {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                "extracted state is missing a row declared by its machine structure",
            ));
        }
    }
    Ok(())
}

/// `status` values a [`Turn1ProcessingResult`] can carry (§4.8:
/// `Turn1ProcessingResult.status ∈ {EXTRACTION_COMPLETE, VALIDATION_COMPLETE,
/// EXTRACTION_FAILED, VALIDATION_FAILED}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn1Status {
    ExtractionComplete,
    ValidationComplete,
    ExtractionFailed,
    ValidationFailed,
}

/// `sourceType` values a path's `referenceAnalysis` carries (§4.7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    ReferenceValidation,
    HistoricalWithVisualConfirmation,
    FreshVisualAnalysis,
}

/// `VALIDATION_FLOW`'s `contextForTurn2` (§4.7.2: `{ referenceValidated,
/// useSystemPromptReference, validationPassed, readyForTurn2 }`).
#[derive(Debug, Clone)]
pub struct ValidationFlowContext {
    pub reference_validated: bool,
    pub use_system_prompt_reference: bool,
    pub validation_passed: bool,
    pub ready_for_turn2: bool,
}

/// The extraction paths' (`HISTORICAL_ENHANCEMENT`/`FRESH_EXTRACTION`)
/// `contextForTurn2` (§4.7.2): `baselineSource` is `"EXTRACTED_STATE"` for a
/// fresh extraction or `"ENHANCED_BASELINE"` when a historical baseline
/// informed it; `useHistoricalData` mirrors which path produced it.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub baseline_source: String,
    pub use_historical_data: bool,
    pub extracted_data_available: bool,
    pub ready_for_turn2: bool,
    pub extracted_structure: MachineStructure,
    pub extracted_state: ExtractedState,
}

/// The context handed to the Turn Executor for turn 2, shaped by whichever
/// path turn 1 took (§4.7.2, `ContextForTurn2`).
#[derive(Debug, Clone)]
pub enum ContextForTurn2 {
    ValidationFlow(ValidationFlowContext),
    Extraction(ExtractionContext),
}

impl ContextForTurn2 {
    /// `true` once this path's contract has been satisfied (§4.8:
    /// `ContextForTurn2.readyForTurn2 == true`).
    #[must_use]
    pub fn ready_for_turn2(&self) -> bool {
        match self {
            Self::ValidationFlow(c) => c.ready_for_turn2,
            Self::Extraction(c) => c.ready_for_turn2,
        }
    }

    /// The extracted state carried by this context, when its path produced
    /// one (everything but `ValidationFlow`).
    #[must_use]
    pub fn extracted_state(&self) -> Option<&ExtractedState> {
        match self {
            Self::ValidationFlow(_) => None,
            Self::Extraction(c) => Some(&c.extracted_state),
        }
    }
}

/// The result of processing a Turn-1 response through one of the three
/// paths (§4.7.2, `Turn1ProcessingResult`): each variant carries exactly
/// the fields §4.8's required-field table names for that path.
#[derive(Debug, Clone)]
pub enum Turn1ProcessingResult {
    /// `LAYOUT_VS_CHECKING` always takes this path.
    ValidationFlow {
        status: Turn1Status,
        source_type: SourceType,
        validation_results: ValidationFlowResult,
        context_for_turn2: ContextForTurn2,
    },
    /// `PREVIOUS_VS_CURRENT` with usable historical context.
    HistoricalEnhancement {
        status: Turn1Status,
        source_type: SourceType,
        historical_baseline: BaselineData,
        visual_confirmation: bool,
        enriched_baseline: EnhancedBaseline,
        focus_areas: Vec<String>,
        known_issues: Vec<String>,
        fallback_used: bool,
        context_for_turn2: ContextForTurn2,
    },
    /// `PREVIOUS_VS_CURRENT` without historical context.
    FreshExtraction {
        status: Turn1Status,
        source_type: SourceType,
        extracted_structure: MachineStructure,
        extracted_state: ExtractedState,
        fallback_used: bool,
        context_for_turn2: ContextForTurn2,
    },
}

impl Turn1ProcessingResult {
    /// Which path produced this result.
    #[must_use]
    pub fn path(&self) -> ProcessingPath {
        match self {
            Self::ValidationFlow { .. } => ProcessingPath::ValidationFlow,
            Self::HistoricalEnhancement { .. } => ProcessingPath::HistoricalEnhancement,
            Self::FreshExtraction { .. } => ProcessingPath::FreshExtraction,
        }
    }

    /// The `contextForTurn2` this result carries, regardless of path.
    #[must_use]
    pub fn context_for_turn2(&self) -> &ContextForTurn2 {
        match self {
            Self::ValidationFlow { context_for_turn2, .. }
            | Self::HistoricalEnhancement { context_for_turn2, .. }
            | Self::FreshExtraction { context_for_turn2, .. } => context_for_turn2,
        }
    }

    /// The extracted state this result carries, for paths that produce one.
    #[must_use]
    pub fn extracted_state(&self) -> Option<&ExtractedState> {
        match self {
            Self::ValidationFlow { .. } => None,
            Self::HistoricalEnhancement { .. } | Self::FreshExtraction { .. } => {
                self.context_for_turn2().extracted_state()
            }
        }
    }

    /// Observations to carry forward into the turn-2 prompt: the
    /// extraction paths' state observations, or a validation flow's
    /// free-text notes.
    #[must_use]
    pub fn observations(&self) -> Vec<String> {
        match self {
            Self::ValidationFlow { validation_results, .. } => validation_results.observations.clone(),
            Self::HistoricalEnhancement { .. } | Self::FreshExtraction { .. } => {
                self.extracted_state().map(|s| s.observations.clone()).unwrap_or_default()
            }
        }
    }
}

/// Check a [`Turn1ProcessingResult`] carries what its path requires
/// (§4.8's per-path required-field table): the two extraction paths need
/// an [`ExtractedState`] with a resolved [`MachineStructure`]; every path
/// needs a `contextForTurn2` whose `readyForTurn2` is `true`.
///
/// # Errors
///
/// Returns [`ErrorCode::MissingField`] when the path-appropriate payload
/// is absent or not ready, or propagates [`validate_extracted_state`]'s
/// errors.
pub fn validate_turn1_result(result: &Turn1ProcessingResult) -> Result<(), WorkflowError> {
    if !result.context_for_turn2().ready_for_turn2() {
        return Err(WorkflowError::missing_field("contextForTurn2.readyForTurn2"));
    }
    match result {
        Turn1ProcessingResult::ValidationFlow { .. } => {}
        Turn1ProcessingResult::HistoricalEnhancement { .. } | Turn1ProcessingResult::FreshExtraction { .. } => {
            let Some(state) = result.extracted_state() else {
                return Err(WorkflowError::missing_field("extractedState"));
            };
            if state.machine_structure.is_none() {
                return Err(WorkflowError::missing_field("extractedState.machineStructure"));
            }
            validate_extracted_state(state)?;
        }
    }
    Ok(())
}

/// Check a [`ContextForTurn2`] is ready to hand to turn 2 (§4.8:
/// `ContextForTurn2.readyForTurn2 == true`), and that the extraction
/// variant carries a state (it has nothing to extract only for
/// `ValidationFlow`).
///
/// # Errors
///
/// Returns [`ErrorCode::MissingField`].
pub fn validate_context_for_turn2(context: &ContextForTurn2) -> Result<(), WorkflowError> {
    if !context.ready_for_turn2() {
        return Err(WorkflowError::missing_field("contextForTurn2.readyForTurn2"));
    }
    if matches!(context, ContextForTurn2::Extraction(_)) && context.extracted_state().is_none() {
        return Err(WorkflowError::missing_field("contextForTurn2.extractedState"));
    }
    Ok(())
}

/// Score how complete a [`Turn1ProcessingResult`] is, in `[0.0, 1.0]`
/// (§4.7.4 "completeness scoring"): the fraction of §4.8's required fields
/// for that path that are present.
#[must_use]
pub fn score_completeness(result: &Turn1ProcessingResult) -> f64 {
    match result {
        Turn1ProcessingResult::ValidationFlow { validation_results, context_for_turn2, .. } => {
            // Required: status, sourceType, validationResults, contextForTurn2.
            // status/sourceType are always present by construction; score the
            // two payload fields against whether they carry real content.
            let mut present = 2u32;
            if validation_results.structure_confirmed || !validation_results.observations.is_empty() {
                present += 1;
            }
            if context_for_turn2.ready_for_turn2() {
                present += 1;
            }
            f64::from(present) / 4.0
        }
        Turn1ProcessingResult::HistoricalEnhancement {
            historical_baseline, enriched_baseline, context_for_turn2, ..
        } => {
            // Required: status, sourceType, historicalBaseline,
            // visualConfirmation, enrichedBaseline, contextForTurn2.
            let mut present = 2u32;
            if historical_baseline.previous_verification_id.is_some() {
                present += 1;
            }
            present += 1; // visualConfirmation is always populated (bool, never absent)
            if !enriched_baseline.enhancement_timestamp.is_empty() {
                present += 1;
            }
            if context_for_turn2.ready_for_turn2() {
                present += 1;
            }
            f64::from(present) / 6.0
        }
        Turn1ProcessingResult::FreshExtraction { extracted_state, context_for_turn2, .. } => {
            // Required: status, sourceType, extractedStructure, extractedState,
            // contextForTurn2.
            let mut present = 3u32; // status, sourceType, extractedStructure always present
            if extracted_state.machine_structure.is_some() && !extracted_state.row_states.is_empty() {
                present += 1;
            }
            if context_for_turn2.ready_for_turn2() {
                present += 1;
            }
            f64::from(present) / 5.0
        }
    }
}
