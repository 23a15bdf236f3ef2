//! The final verification result written by the Finalizer (§3, §4.9):
//! [`VerificationSummary`].

use serde::{Deserialize, Serialize};

/// Overall outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    /// No discrepancies found between the two turns' extracted states.
    Matched,
    /// At least one discrepancy was found.
    Discrepant,
    /// The workflow could not reach a conclusion (e.g. unparseable
    /// responses on both turns, or zero positions to check).
    Inconclusive,
}

/// The durable, caller-facing result of a completed verification (§3, §4.9
/// `BuildVerificationSummary`).
///
/// `overall_accuracy` and `overall_confidence` are pre-formatted strings
/// (`"NN% (k/T)"` and `"NN%"`), matching the wire contract exactly — they
/// are not left as floats for a caller to format inconsistently.
///
/// *Invariant*: `discrepant_positions` is non-empty only when
/// `verification_outcome == Discrepant`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    /// The verification this summary belongs to.
    pub verification_id: String,
    /// Overall outcome.
    pub verification_outcome: VerificationOutcome,
    /// Total positions considered (defaults to 60 when undeliverable, per
    /// §4.9).
    pub total_positions_checked: u32,
    /// Positions where the final extracted state matched expectations.
    pub correct_positions: u32,
    /// Positions where the final extracted state disagreed.
    #[serde(default)]
    pub discrepant_positions: Vec<String>,
    /// Positions observed empty in the checking image.
    #[serde(default)]
    pub empty_positions_in_checking: Vec<String>,
    /// `"<round(accuracy*100)>% (<correctPositions>/<totalPositionsChecked>)"`.
    pub overall_accuracy: String,
    /// `"<round(confidence*100)>%"`.
    pub overall_confidence: String,
}

/// Default total position count used when the real figure could not be
/// determined (§4.9, "defaulting missing fields").
pub const DEFAULT_TOTAL_POSITIONS: u32 = 60;

impl VerificationSummary {
    /// Build a summary from raw counts, deriving the outcome and
    /// pre-formatting the accuracy/confidence strings.
    ///
    /// `total_positions_checked` should already have
    /// [`DEFAULT_TOTAL_POSITIONS`] substituted by the caller if the true
    /// count was undeliverable.
    #[must_use]
    pub fn build(
        verification_id: impl Into<String>,
        total_positions_checked: u32,
        discrepant_positions: Vec<String>,
        empty_positions_in_checking: Vec<String>,
        confidence: f64,
    ) -> Self {
        let correct_positions =
            total_positions_checked.saturating_sub(discrepant_positions.len() as u32);
        let outcome = if total_positions_checked == 0 {
            VerificationOutcome::Inconclusive
        } else if discrepant_positions.is_empty() {
            VerificationOutcome::Matched
        } else {
            VerificationOutcome::Discrepant
        };
        let accuracy_pct = if total_positions_checked == 0 {
            0.0
        } else {
            f64::from(correct_positions) / f64::from(total_positions_checked) * 100.0
        };
        Self {
            verification_id: verification_id.into(),
            verification_outcome: outcome,
            total_positions_checked,
            correct_positions,
            overall_accuracy: format!(
                "{}% ({}/{})",
                accuracy_pct.round() as i64,
                correct_positions,
                total_positions_checked
            ),
            overall_confidence: format!("{}%", (confidence * 100.0).round() as i64),
            discrepant_positions,
            empty_positions_in_checking,
        }
    }

    /// `true` if the invariants documented on the type hold.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.verification_outcome == VerificationOutcome::Discrepant
            || self.discrepant_positions.is_empty()
    }
}
