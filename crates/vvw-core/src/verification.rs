//! Verification identity and context types: [`VerificationContext`],
//! verification-id allocation, and the durable-record bookkeeping types
//! ([`StatusTransition`], [`ProcessingMetrics`], [`TrackedError`]).

use crate::status::WorkflowStatus;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vvw_error::{ErrorCode, WorkflowError};

/// How a verification run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    /// Compare current image against a reference/planogram layout.
    LayoutVsChecking,
    /// Compare current image against the most recent prior checking image.
    PreviousVsCurrent,
}

impl VerificationType {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayoutVsChecking => "LAYOUT_VS_CHECKING",
            Self::PreviousVsCurrent => "PREVIOUS_VS_CURRENT",
        }
    }
}

/// Which of the three Turn-1 response-processing paths applies (§4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingPath {
    /// `LAYOUT_VS_CHECKING`: confirm/dispute a pre-supplied structure.
    ValidationFlow,
    /// `PREVIOUS_VS_CURRENT` with historical context available: extract,
    /// informed by what changed since the prior verification.
    HistoricalEnhancement,
    /// `PREVIOUS_VS_CURRENT` with no usable historical context: extract
    /// from scratch.
    FreshExtraction,
}

/// Select the Turn-1 response-processing path (§4.7.1).
///
/// `LAYOUT_VS_CHECKING` always takes [`ProcessingPath::ValidationFlow`].
/// `PREVIOUS_VS_CURRENT` takes [`ProcessingPath::HistoricalEnhancement`]
/// when `historical_context_present` is `true`, else
/// [`ProcessingPath::FreshExtraction`].
#[must_use]
pub fn select_processing_path(
    verification_type: VerificationType,
    historical_context_present: bool,
) -> ProcessingPath {
    match verification_type {
        VerificationType::LayoutVsChecking => ProcessingPath::ValidationFlow,
        VerificationType::PreviousVsCurrent if historical_context_present => {
            ProcessingPath::HistoricalEnhancement
        }
        VerificationType::PreviousVsCurrent => ProcessingPath::FreshExtraction,
    }
}

/// Allocate a new verification id in the canonical form
/// `verif-YYYYMMDDHHMMSS-xxxx`, where `xxxx` is four random lowercase hex
/// digits.
///
/// The timestamp segment also determines the date partition
/// (`YYYY/MM/DD/<verificationId>/`) every blob for this run is stored
/// under.
#[must_use]
pub fn allocate_verification_id() -> String {
    let now = chrono::Utc::now();
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..4).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
    };
    format!("verif-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// The `YYYY/MM/DD` date partition a verification id's blobs live under,
/// derived from the timestamp segment embedded in the id itself.
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if `verification_id` is not in the
/// canonical `verif-YYYYMMDDHHMMSS-xxxx` form.
pub fn date_partition(verification_id: &str) -> Result<String, WorkflowError> {
    let digits = verification_id
        .strip_prefix("verif-")
        .and_then(|rest| rest.split('-').next())
        .filter(|d| d.len() == 14 && d.chars().all(|c| c.is_ascii_digit()));
    let Some(digits) = digits else {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!("`{verification_id}` is not a canonical verification id"),
        ));
    };
    Ok(format!("{}/{}/{}", &digits[0..4], &digits[4..6], &digits[6..8]))
}

/// Immutable context describing a single verification request (§3,
/// `VerificationContext`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContext {
    /// Immutable verification identifier.
    pub verification_id: String,
    /// The comparison mode requested.
    pub verification_type: VerificationType,
    /// Vending machine identifier.
    pub vending_machine_id: String,
    /// Key of the "checking" (current) image in the images bucket.
    pub checking_image_key: String,
    /// Key of the reference image, required only for `LAYOUT_VS_CHECKING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image_key: Option<String>,
    /// Arbitrary caller-supplied metadata, carried through unmodified.
    #[serde(default)]
    pub request_metadata: BTreeMap<String, serde_json::Value>,
}

impl VerificationContext {
    /// Enforce the cross-field invariant: `LAYOUT_VS_CHECKING` requires
    /// `reference_image_key`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::MissingField`] when the reference image is
    /// absent for a layout comparison.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.verification_type == VerificationType::LayoutVsChecking
            && self.reference_image_key.is_none()
        {
            return Err(WorkflowError::missing_field("referenceImageKey")
                .with_verification_id(self.verification_id.clone()));
        }
        Ok(())
    }
}

/// One recorded status change, appended to a durable record's
/// `statusHistory` (ambient addition — not part of the wire envelope, kept
/// only in the record store).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    /// Status entered.
    pub status: WorkflowStatus,
    /// RFC3339 timestamp the transition was recorded at.
    pub timestamp: String,
    /// Stage that performed the transition (e.g. `"fetcher"`).
    pub stage: String,
}

/// Per-stage timing and retry bookkeeping accumulated over a run (ambient
/// addition).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    /// Wall-clock duration of each stage, in milliseconds, keyed by stage
    /// name.
    #[serde(default)]
    pub stage_durations_ms: BTreeMap<String, u64>,
    /// Number of retry attempts consumed by each stage.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
}

impl ProcessingMetrics {
    /// Record a stage's duration, overwriting any prior value (stages are
    /// not expected to run twice except under replay).
    pub fn record_duration(&mut self, stage: impl Into<String>, millis: u64) {
        self.stage_durations_ms.insert(stage.into(), millis);
    }

    /// Increment the retry counter for `stage`.
    pub fn record_retry(&mut self, stage: impl Into<String>) {
        *self.retry_counts.entry(stage.into()).or_insert(0) += 1;
    }
}

/// One error recorded against a run, appended to a durable record's
/// `errorTracking` (ambient addition).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedError {
    /// Stage the error originated in.
    pub stage: String,
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the error was retryable.
    pub retryable: bool,
    /// RFC3339 timestamp the error was recorded at.
    pub timestamp: String,
}

impl From<(&str, &WorkflowError, String)> for TrackedError {
    fn from((stage, err, timestamp): (&str, &WorkflowError, String)) -> Self {
        Self {
            stage: stage.to_string(),
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            retryable: err.retryable,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_match_canonical_shape() {
        let id = allocate_verification_id();
        assert!(id.starts_with("verif-"));
        let rest = &id["verif-".len()..];
        let mut parts = rest.split('-');
        let ts = parts.next().unwrap();
        let suffix = parts.next().unwrap();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn date_partition_derives_from_id_timestamp() {
        let partition = date_partition("verif-20250605074028-f5c4").unwrap();
        assert_eq!(partition, "2025/06/05");
    }

    #[test]
    fn date_partition_rejects_malformed_id() {
        assert!(date_partition("not-a-verification-id").is_err());
    }

    #[test]
    fn layout_vs_checking_requires_reference_image() {
        let ctx = VerificationContext {
            verification_id: "verif-1".into(),
            verification_type: VerificationType::LayoutVsChecking,
            vending_machine_id: "vm-1".into(),
            checking_image_key: "checking.jpg".into(),
            reference_image_key: None,
            request_metadata: BTreeMap::new(),
        };
        let err = ctx.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingField);
    }

    #[test]
    fn previous_vs_current_does_not_require_reference_image() {
        let ctx = VerificationContext {
            verification_id: "verif-1".into(),
            verification_type: VerificationType::PreviousVsCurrent,
            vending_machine_id: "vm-1".into(),
            checking_image_key: "checking.jpg".into(),
            reference_image_key: None,
            request_metadata: BTreeMap::new(),
        };
        ctx.validate().unwrap();
    }

    #[test]
    fn select_processing_path_dispatches_the_three_routes() {
        assert_eq!(
            select_processing_path(VerificationType::LayoutVsChecking, false),
            ProcessingPath::ValidationFlow
        );
        assert_eq!(
            select_processing_path(VerificationType::LayoutVsChecking, true),
            ProcessingPath::ValidationFlow
        );
        assert_eq!(
            select_processing_path(VerificationType::PreviousVsCurrent, true),
            ProcessingPath::HistoricalEnhancement
        );
        assert_eq!(
            select_processing_path(VerificationType::PreviousVsCurrent, false),
            ProcessingPath::FreshExtraction
        );
    }

    #[test]
    fn processing_metrics_record_duration_and_retry() {
        let mut metrics = ProcessingMetrics::default();
        metrics.record_duration("fetcher", 120);
        metrics.record_retry("fetcher");
        metrics.record_retry("fetcher");
        assert_eq!(metrics.stage_durations_ms.get("fetcher"), Some(&120));
        assert_eq!(metrics.retry_counts.get("fetcher"), Some(&2));
    }
}
