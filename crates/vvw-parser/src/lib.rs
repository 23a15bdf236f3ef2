//! Markdown-to-structured-state parsing for Turn-1 model responses (§4.7.3).
//!
//! The model's response is free-form markdown, not a schema the caller
//! controls. Rather than a general markdown AST, this crate uses a small
//! table of named regexes whose tags are stable identifiers
//! (`machineStructure`, `rowStatus`, `position`, ...) so that a parsing
//! failure can be attributed to one named step instead of "the parser broke".
//!
//! Every extraction function here is a pure function of its input string:
//! same input, same output, no mutation, no I/O.

#![deny(unsafe_code)]

use regex::Regex;
use std::sync::LazyLock;
use vvw_core::{ExtractedState, MachineStructure, RowState};
use vvw_error::{ErrorCode, WorkflowError};

// ---------------------------------------------------------------------
// Step 1: content separation
// ---------------------------------------------------------------------

/// Field keys recognized as holding the model's primary answer.
const MAIN_CONTENT_KEYS: &[&str] = &["content", "response", "text", "output", "result"];
/// Field keys (or heading labels) recognized as holding the model's
/// internal deliberation, which is kept but never parsed for machine state.
const THINKING_KEYS: &[&str] = &["thinking", "reasoning", "analysis"];

static THINKING_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*#{1,6}?\s*\**(thinking|reasoning|analysis)\**\s*:?\s*$")
        .expect("thinking heading regex is valid")
});

/// The result of separating a raw model response into the segment that
/// carries verifiable content and the segment that carries deliberation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeparatedContent {
    /// The segment parsed for machine state (never the thinking segment).
    pub main: String,
    /// The deliberation segment, if one was recognized.
    pub thinking: Option<String>,
}

/// Split a raw response into its main-content and thinking segments
/// (§4.7.3 step 1).
///
/// If `raw` parses as a JSON object exposing one of [`MAIN_CONTENT_KEYS`],
/// that field (and any [`THINKING_KEYS`] field) is used directly. Otherwise
/// `raw` is treated as plain markdown and split at the first recognized
/// thinking heading (e.g. `## Reasoning` or `**Analysis:**`).
#[must_use]
pub fn separate_content(raw: &str) -> SeparatedContent {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) {
        let main = MAIN_CONTENT_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string);
        let thinking = THINKING_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string);
        if let Some(main) = main {
            return SeparatedContent { main, thinking };
        }
    }

    match THINKING_HEADING_RE.find(raw) {
        Some(m) => SeparatedContent {
            main: raw[..m.start()].trim().to_string(),
            thinking: Some(raw[m.end()..].trim().to_string()),
        },
        None => SeparatedContent { main: raw.trim().to_string(), thinking: None },
    }
}

// ---------------------------------------------------------------------
// Step 2: machine structure recognition
// ---------------------------------------------------------------------

static LETTER_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Z])\s*[\x{2013}\x{2014}-]\s*([A-Z])\)").expect("letter range regex is valid"));
static ROW_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*rows?\b").expect("row count regex is valid"));
static COLUMN_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:slots|columns|positions)\s*(?:per\s*row)?").expect("column count regex is valid")
});
static DOMAIN_KEYWORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)vending machine|slots? per row|vending-machine").expect("domain keyword regex is valid")
});

/// The result of machine-structure recognition: the structure itself, and
/// whether the canonical-6×7 fallback (§9) was used to produce it.
#[derive(Debug, Clone)]
pub struct StructureExtraction {
    /// The recognized (or fallback) structure.
    pub structure: MachineStructure,
    /// `true` if the naive extraction was implausible and the canonical
    /// 6×7 layout was substituted.
    pub fallback_used: bool,
}

/// Recognize a [`MachineStructure`] from prose (§4.7.3 step 2).
///
/// Tries a letter-range row count first (e.g. `"(A-F)"`), then a plain
/// `"<N> rows"` pattern, then a `"<N> slots/columns per row"` pattern for
/// columns. When the text reads like vending-machine domain prose and the
/// naive result is implausible (either axis over 10), falls back to
/// [`MachineStructure::canonical_6x7`] with `fallback_used = true`.
#[must_use]
pub fn extract_machine_structure(text: &str) -> StructureExtraction {
    let row_count_from_letters = LETTER_RANGE_RE.captures(text).and_then(|caps| {
        let start = caps[1].chars().next()?;
        let end = caps[2].chars().next()?;
        if end >= start {
            Some((end as u32) - (start as u32) + 1)
        } else {
            None
        }
    });

    let row_count = row_count_from_letters
        .or_else(|| ROW_COUNT_RE.captures(text).and_then(|c| c[1].parse::<u32>().ok()));
    let columns_per_row = COLUMN_COUNT_RE.captures(text).and_then(|c| c[1].parse::<u32>().ok());

    let naive = match (row_count, columns_per_row) {
        (Some(rows), Some(cols)) if rows > 0 && cols > 0 => MachineStructure::new(
            (0..rows).map(letter_for).collect(),
            (1..=cols).map(|n| n.to_string()).collect(),
        )
        .ok(),
        _ => None,
    };

    let domain_detected = DOMAIN_KEYWORDS_RE.is_match(text);

    match naive {
        Some(structure) if domain_detected && structure.is_implausible() => {
            StructureExtraction { structure: MachineStructure::canonical_6x7(), fallback_used: true }
        }
        Some(structure) => StructureExtraction { structure, fallback_used: false },
        None if domain_detected => {
            StructureExtraction { structure: MachineStructure::canonical_6x7(), fallback_used: true }
        }
        None => StructureExtraction { structure: MachineStructure::canonical_6x7(), fallback_used: true },
    }
}

fn letter_for(index: u32) -> String {
    char::from_u32(u32::from(b'A') + index).map(String::from).unwrap_or_else(|| index.to_string())
}

// ---------------------------------------------------------------------
// Steps 3-5: row status, positions, quantity consistency
// ---------------------------------------------------------------------

static ROW_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##\s*Row\s+([A-Z])\b").expect("row heading regex is valid"));
static ROW_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\*\*Status:\s*(\w+)\*\*").expect("row status regex is valid"));
static POSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^-\s*([A-Z]\d+):\s*(.+)$").expect("position regex is valid"));
static QUANTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)quantity:\s*(\d+)").expect("quantity regex is valid"));
static EMPTY_DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bempty\b").expect("empty description regex is valid"));

/// Extract per-row states from `## Row X` sections (§4.7.3 steps 3-5).
///
/// Each row's section runs from its heading to the next `## Row` heading
/// (or end of text). Within a section: `**Status: word**` sets
/// [`RowState::status`]; `- A1: description` lines are accumulated into
/// [`RowState::filled_positions`] (or `empty_positions` when the
/// description contains the word "empty"); `quantity: N` sets
/// [`RowState::quantity`] without being reconciled against the observed
/// position count (§8 property: quantity mismatch is a warning, not a
/// parse failure).
#[must_use]
pub fn extract_row_states(text: &str) -> std::collections::BTreeMap<String, RowState> {
    let headings: Vec<_> = ROW_HEADING_RE.captures_iter(text).map(|c| (c[1].to_string(), c.get(0).unwrap().start())).collect();
    let mut rows = std::collections::BTreeMap::new();

    for (i, (row_id, start)) in headings.iter().enumerate() {
        let end = headings.get(i + 1).map(|(_, s)| *s).unwrap_or(text.len());
        let section = &text[*start..end];

        let status = ROW_STATUS_RE.captures(section).map(|c| c[1].to_string()).unwrap_or_default();
        let quantity = QUANTITY_RE.captures(section).and_then(|c| c[1].parse().ok()).unwrap_or(0);

        let mut filled = Vec::new();
        let mut empty = Vec::new();
        for caps in POSITION_RE.captures_iter(section) {
            let position = caps[1].to_string();
            let description = &caps[2];
            if EMPTY_DESCRIPTION_RE.is_match(description) {
                empty.push(position);
            } else {
                filled.push(position);
            }
        }

        rows.insert(
            row_id.clone(),
            RowState { status, filled_positions: filled, empty_positions: empty, quantity, notes: String::new() },
        );
    }

    rows
}

// ---------------------------------------------------------------------
// Step 6: observation summary
// ---------------------------------------------------------------------

static OBSERVATION_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^.*\b(reference layout shows|observations?:|note[sd]?:)\s*(.*)$")
        .expect("observation marker regex is valid")
});

/// Collect free-text observation lines following a recognizable marker
/// (§4.7.3 step 6), e.g. a line beginning "The reference layout shows...".
#[must_use]
pub fn extract_observations(text: &str) -> Vec<String> {
    OBSERVATION_MARKER_RE
        .captures_iter(text)
        .map(|c| c[2].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------
// Path-level assembly
// ---------------------------------------------------------------------

/// Full fresh-extraction parse result (§4.7.2 FRESH_EXTRACTION path):
/// structure recognition plus per-row state, assembled into one
/// [`ExtractedState`].
#[derive(Debug, Clone)]
pub struct FreshExtractionResult {
    /// The extracted state, with aggregates already recomputed.
    pub state: ExtractedState,
    /// `true` if the canonical-6×7 fallback was used for `state.machine_structure`.
    pub fallback_used: bool,
}

/// Run the full FRESH_EXTRACTION parse: content separation, structure
/// recognition, row/position extraction, and observation collection.
#[must_use]
pub fn parse_fresh_extraction(raw_response: &str) -> FreshExtractionResult {
    let separated = separate_content(raw_response);
    let structure = extract_machine_structure(&separated.main);
    let row_states = extract_row_states(&separated.main);
    let observations = extract_observations(&separated.main);

    let mut state = ExtractedState {
        machine_structure: Some(structure.structure.clone()),
        row_states,
        observations,
        ..ExtractedState::default()
    };
    state.recompute_aggregates();
    state.overall_status = overall_status_from_rows(&state);

    FreshExtractionResult { state, fallback_used: structure.fallback_used }
}

/// The prior verification's state, as known to the HISTORICAL_ENHANCEMENT
/// parse (§4.7.2 `baselineData`): whatever the Historical Context Builder
/// could resolve, carried forward unmodified into `enhancedBaseline`.
#[derive(Debug, Clone, Default)]
pub struct BaselineData {
    /// The prior verification's id, when one was resolved.
    pub previous_verification_id: Option<String>,
    /// The prior verification's outcome (`"Matched"`, `"Discrepant"`,
    /// `"Inconclusive"`), when its summary was loaded.
    pub previous_verification_outcome: Option<String>,
    /// Positions the prior verification found discrepant.
    pub previous_discrepant_positions: Vec<String>,
    /// Positions the prior verification found empty in its checking image.
    pub previous_empty_positions: Vec<String>,
}

/// `baselineData` merged with this turn's visual confirmation (§4.7.2
/// `enhancedBaseline = baselineData ∪ { visualConfirmation, enhancementTimestamp }`).
#[derive(Debug, Clone, Default)]
pub struct EnhancedBaseline {
    /// The prior verification's carried-forward state.
    pub baseline_data: BaselineData,
    /// Whether this turn's response visually confirmed a row/position state.
    pub visual_confirmation: bool,
    /// When this enhancement was produced.
    pub enhancement_timestamp: String,
}

/// Full HISTORICAL_ENHANCEMENT parse result (§4.7.2 HISTORICAL_ENHANCEMENT
/// path): the same row/position extraction as FRESH_EXTRACTION, folded
/// together with the prior verification's baseline.
#[derive(Debug, Clone)]
pub struct HistoricalEnhancementResult {
    /// The extracted state, with aggregates already recomputed.
    pub state: ExtractedState,
    /// `true` if the canonical-6×7 fallback was used for `state.machine_structure`.
    pub fallback_used: bool,
    /// The prior verification's state, unmodified.
    pub historical_baseline: BaselineData,
    /// Whether this turn's response visually confirmed the baseline.
    pub visual_confirmation: bool,
    /// `historical_baseline` merged with this turn's confirmation.
    pub enhanced_baseline: EnhancedBaseline,
    /// Row ids the prior verification flagged as empty or discrepant.
    pub focus_areas: Vec<String>,
    /// Problems carried forward from the prior verification's outcome.
    pub known_issues: Vec<String>,
}

fn row_id_from_position(position: &str) -> String {
    position.chars().take_while(|c| c.is_ascii_alphabetic()).collect()
}

fn focus_areas_from_summary(summary: &vvw_core::VerificationSummary) -> Vec<String> {
    let mut rows: Vec<String> = summary
        .empty_positions_in_checking
        .iter()
        .chain(summary.discrepant_positions.iter())
        .map(|p| row_id_from_position(p))
        .filter(|r| !r.is_empty())
        .collect();
    rows.sort();
    rows.dedup();
    rows
}

fn known_issues_from_summary(summary: &vvw_core::VerificationSummary) -> Vec<String> {
    let mut issues = Vec::new();
    if !summary.discrepant_positions.is_empty() {
        issues.push("incorrect_products".to_string());
    }
    if !summary.empty_positions_in_checking.is_empty() {
        issues.push("empty_rows".to_string());
    }
    issues
}

/// Run the HISTORICAL_ENHANCEMENT parse (§4.7.2): the response is parsed as
/// *visual confirmation* keyed by position, using the same row/position
/// extraction as FRESH_EXTRACTION, then folded together with
/// `previous_summary` into `focusAreas` (rows the prior run flagged empty
/// or discrepant) and `knownIssues` (problems the prior run's outcome
/// carries forward).
///
/// `enhancement_timestamp` is supplied by the caller rather than read from
/// the clock here, keeping this function a pure transform of its inputs
/// like the rest of this crate.
#[must_use]
pub fn parse_historical_enhancement(
    raw_response: &str,
    previous_verification_id: Option<&str>,
    previous_summary: Option<&vvw_core::VerificationSummary>,
    enhancement_timestamp: &str,
) -> HistoricalEnhancementResult {
    let extraction = parse_fresh_extraction(raw_response);
    let visual_confirmation = !extraction.state.row_states.is_empty();

    let (focus_areas, known_issues) = match previous_summary {
        Some(summary) => (focus_areas_from_summary(summary), known_issues_from_summary(summary)),
        None => (Vec::new(), Vec::new()),
    };

    let historical_baseline = BaselineData {
        previous_verification_id: previous_verification_id.map(str::to_string),
        previous_verification_outcome: previous_summary.map(|s| format!("{:?}", s.verification_outcome)),
        previous_discrepant_positions: previous_summary.map(|s| s.discrepant_positions.clone()).unwrap_or_default(),
        previous_empty_positions: previous_summary.map(|s| s.empty_positions_in_checking.clone()).unwrap_or_default(),
    };

    let enhanced_baseline = EnhancedBaseline {
        baseline_data: historical_baseline.clone(),
        visual_confirmation,
        enhancement_timestamp: enhancement_timestamp.to_string(),
    };

    HistoricalEnhancementResult {
        state: extraction.state,
        fallback_used: extraction.fallback_used,
        historical_baseline,
        visual_confirmation,
        enhanced_baseline,
        focus_areas,
        known_issues,
    }
}

/// The result of parsing a VALIDATION_FLOW response, which confirms or
/// disputes a pre-supplied structure rather than deriving one from scratch
/// (§4.7.2 VALIDATION_FLOW).
#[derive(Debug, Clone, Default)]
pub struct ValidationFlowResult {
    /// `true` if the model's response affirms the supplied structure.
    pub structure_confirmed: bool,
    /// Free-text observations collected from the response.
    pub observations: Vec<String>,
}

static STRUCTURE_CONFIRMED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)structure\s*confirmed\s*:?\s*(true|yes|confirmed)").expect("structure confirmed regex is valid")
});

/// Parse a VALIDATION_FLOW response (§4.7.2): looks for an explicit
/// confirmation marker and collects observations, without re-deriving a
/// [`MachineStructure`].
#[must_use]
pub fn parse_validation_flow(raw_response: &str) -> ValidationFlowResult {
    let separated = separate_content(raw_response);
    ValidationFlowResult {
        structure_confirmed: STRUCTURE_CONFIRMED_RE.is_match(&separated.main),
        observations: extract_observations(&separated.main),
    }
}

fn overall_status_from_rows(state: &ExtractedState) -> String {
    if state.row_states.is_empty() {
        return "unknown".to_string();
    }
    if state.total_filled_count == 0 {
        "empty".to_string()
    } else if state.total_empty_count == 0 {
        "full".to_string()
    } else {
        "partial".to_string()
    }
}

/// Parsing never raises for malformed input on its own; this exists only
/// for boundary checks that wrap parsing with an explicit precondition
/// (e.g. rejecting an empty response before it reaches the parser).
///
/// # Errors
///
/// Returns [`ErrorCode::ParsingError`] if `raw_response` is empty or
/// whitespace-only.
pub fn require_non_empty(raw_response: &str) -> Result<(), WorkflowError> {
    if raw_response.trim().is_empty() {
        return Err(WorkflowError::new(ErrorCode::ParsingError, "model response is empty"));
    }
    Ok(())
}
