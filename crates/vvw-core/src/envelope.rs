//! The in-band envelope shuttled between stages (§3 and §6 of the workflow
//! spec), plus the category→file-name mapping and the tolerant
//! [`EnvelopeInput::normalize`] loader.

use crate::status::WorkflowStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vvw_error::{ErrorCode, WorkflowError};

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A content pointer into the object store: `{ bucket, key, size }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Size of the referenced blob in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Category → file-name mapping
// ---------------------------------------------------------------------------

/// The fixed blob categories named in §3, plus the open-ended per-stage
/// error category (`errors_<stage>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceCategory {
    /// `processing/initialization.json`
    ProcessingInitialization,
    /// `images/metadata.json`
    ImagesMetadata,
    /// `processing/layout-metadata.json`
    ProcessingLayoutMetadata,
    /// `processing/historical-context.json`
    ProcessingHistoricalContext,
    /// `prompts/system.json`
    PromptsSystem,
    /// `prompts/turn1.json`
    PromptsTurn1,
    /// `prompts/turn2.json`
    PromptsTurn2,
    /// `responses/turn1-raw.json`
    ResponsesTurn1Raw,
    /// `responses/turn1-processed.json`
    ResponsesTurn1Processed,
    /// `responses/turn2-raw.json`
    ResponsesTurn2Raw,
    /// `responses/turn2-processed.json`
    ResponsesTurn2Processed,
    /// `results/verificationSummary.json`
    ResultsVerificationSummary,
    /// `errors/<stage>.json`, appended on failure.
    Errors(String),
}

impl ReferenceCategory {
    /// The envelope reference key this category is registered under (e.g.
    /// `"processing_initialization"`, `"errors_fetcher"`).
    #[must_use]
    pub fn reference_key(&self) -> String {
        match self {
            Self::ProcessingInitialization => "processing_initialization".to_string(),
            Self::ImagesMetadata => "images_metadata".to_string(),
            Self::ProcessingLayoutMetadata => "processing_layout_metadata".to_string(),
            Self::ProcessingHistoricalContext => "processing_historical_context".to_string(),
            Self::PromptsSystem => "prompts_system".to_string(),
            Self::PromptsTurn1 => "prompts_turn1".to_string(),
            Self::PromptsTurn2 => "prompts_turn2".to_string(),
            Self::ResponsesTurn1Raw => "responses_turn1_raw".to_string(),
            Self::ResponsesTurn1Processed => "responses_turn1_processed".to_string(),
            Self::ResponsesTurn2Raw => "responses_turn2_raw".to_string(),
            Self::ResponsesTurn2Processed => "responses_turn2_processed".to_string(),
            Self::ResultsVerificationSummary => "results_verification_summary".to_string(),
            Self::Errors(stage) => format!("errors_{stage}"),
        }
    }

    /// The file name (relative to the verification's date partition) this
    /// category is stored under.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::ProcessingInitialization => "processing/initialization.json".to_string(),
            Self::ImagesMetadata => "images/metadata.json".to_string(),
            Self::ProcessingLayoutMetadata => "processing/layout-metadata.json".to_string(),
            Self::ProcessingHistoricalContext => "processing/historical-context.json".to_string(),
            Self::PromptsSystem => "prompts/system.json".to_string(),
            Self::PromptsTurn1 => "prompts/turn1.json".to_string(),
            Self::PromptsTurn2 => "prompts/turn2.json".to_string(),
            Self::ResponsesTurn1Raw => "responses/turn1-raw.json".to_string(),
            Self::ResponsesTurn1Processed => "responses/turn1-processed.json".to_string(),
            Self::ResponsesTurn2Raw => "responses/turn2-raw.json".to_string(),
            Self::ResponsesTurn2Processed => "responses/turn2-processed.json".to_string(),
            Self::ResultsVerificationSummary => "results/verificationSummary.json".to_string(),
            Self::Errors(stage) => format!("errors/{stage}.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The in-band message passed between workflow stages.
///
/// *Invariant*: `verification_id` is immutable once set; `references` keys
/// are never rebound to a different `(bucket, key)`; `status` advances
/// monotonically per [`WorkflowStatus::can_advance_to`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Immutable verification identifier.
    #[serde(rename = "verificationId")]
    pub verification_id: String,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// Flat, stage-appended reference map (wire key: `s3References`).
    #[serde(rename = "s3References", default)]
    pub references: BTreeMap<String, Reference>,
    /// Flat key/value scratchpad (stage-appended, never deleted).
    #[serde(default)]
    pub summary: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Create a freshly initialized envelope for a new verification id.
    #[must_use]
    pub fn new(verification_id: impl Into<String>) -> Self {
        Self {
            verification_id: verification_id.into(),
            status: WorkflowStatus::Initialized,
            references: BTreeMap::new(),
            summary: BTreeMap::new(),
        }
    }

    /// Advance `status`, rejecting non-monotonic transitions.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] if `next` is not reachable from
    /// the current status.
    pub fn advance_status(&mut self, next: WorkflowStatus) -> Result<(), WorkflowError> {
        if !self.status.can_advance_to(next) {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!("illegal status transition: {} -> {next}", self.status),
            )
            .with_verification_id(self.verification_id.clone()));
        }
        self.status = next;
        Ok(())
    }

    /// Register a reference under `category`'s key, enforcing the
    /// no-rebind invariant: re-registering the same key with a different
    /// `(bucket, key)` is rejected; re-registering with an identical
    /// `(bucket, key)` (e.g. idempotent replays) is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] on an attempted rebind.
    pub fn set_reference(
        &mut self,
        category: &ReferenceCategory,
        reference: Reference,
    ) -> Result<(), WorkflowError> {
        let key = category.reference_key();
        if let Some(existing) = self.references.get(&key) {
            if existing.bucket != reference.bucket || existing.key != reference.key {
                return Err(WorkflowError::new(
                    ErrorCode::ValidationError,
                    format!("reference key `{key}` cannot be rebound to a different (bucket, key)"),
                )
                .with_verification_id(self.verification_id.clone())
                .with_detail("key", key.clone()));
            }
        }
        self.references.insert(key, reference);
        Ok(())
    }

    /// Look up a reference by category.
    #[must_use]
    pub fn get_reference(&self, category: &ReferenceCategory) -> Option<&Reference> {
        self.references.get(&category.reference_key())
    }

    /// Reference keys that signal an inherited error from an earlier stage:
    /// any key containing the substring `"error"` (case-insensitive), or a
    /// status that is already [`WorkflowStatus::VerificationFailed`].
    #[must_use]
    pub fn inherited_error_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .references
            .keys()
            .filter(|k| k.to_ascii_lowercase().contains("error"))
            .cloned()
            .collect();
        if self.status == WorkflowStatus::VerificationFailed {
            sources.push("status".to_string());
        }
        sources
    }
}

// ---------------------------------------------------------------------------
// EnvelopeInput — the tolerant loader
// ---------------------------------------------------------------------------

/// Tagged-sum input accepted by [`EnvelopeInput::normalize`] (a.k.a.
/// `LoadEnvelope` in §4.1): a raw JSON value, a raw byte blob, or a raw
/// string — the only place that tolerates input-shape variance.
#[derive(Debug, Clone)]
pub enum EnvelopeInput {
    /// Already-parsed JSON (e.g. a Step-Functions-passed object).
    Value(serde_json::Value),
    /// Raw UTF-8 JSON bytes.
    Bytes(Vec<u8>),
    /// Raw JSON text.
    Str(String),
}

impl EnvelopeInput {
    /// Normalize any accepted input shape into the canonical [`Envelope`].
    ///
    /// Accepts both the flat wire shape (`s3References.<refKey>`) and the
    /// nested shape (`s3References.<category>.<refName>`), flattening the
    /// latter into the former.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] if `verificationId` is absent,
    /// or [`ErrorCode::ParsingError`] if the input is not valid JSON.
    pub fn normalize(self) -> Result<Envelope, WorkflowError> {
        let value = match self {
            Self::Value(v) => v,
            Self::Bytes(b) => serde_json::from_slice(&b).map_err(|e| {
                WorkflowError::new(ErrorCode::ParsingError, format!("invalid envelope JSON bytes: {e}"))
            })?,
            Self::Str(s) => serde_json::from_str(&s).map_err(|e| {
                WorkflowError::new(ErrorCode::ParsingError, format!("invalid envelope JSON string: {e}"))
            })?,
        };

        let obj = value.as_object().ok_or_else(|| {
            WorkflowError::new(ErrorCode::ValidationError, "envelope must be a JSON object")
        })?;

        let verification_id = obj
            .get("verificationId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkflowError::missing_field("verificationId"))?
            .to_string();

        let status = match obj.get("status").and_then(|v| v.as_str()) {
            Some(s) => serde_json::from_value(serde_json::Value::String(s.to_string()))
                .map_err(|e| {
                    WorkflowError::new(ErrorCode::ValidationError, format!("unrecognised status `{s}`: {e}"))
                        .with_verification_id(verification_id.clone())
                })?,
            None => WorkflowStatus::Initialized,
        };

        let references = flatten_references(obj.get("s3References"));

        let summary: BTreeMap<String, serde_json::Value> = obj
            .get("summary")
            .and_then(|v| v.as_object())
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();

        Ok(Envelope {
            verification_id,
            status,
            references,
            summary,
        })
    }
}

/// Flatten either the flat `{ refKey: Reference }` shape or the nested
/// `{ category: { refName: Reference } }` shape into a single flat map.
///
/// A value is treated as a `Reference` if it is a JSON object containing a
/// `"bucket"` key; otherwise (for an object without `"bucket"`) each of its
/// entries is treated as a nested category map and recursed into one level.
fn flatten_references(value: Option<&serde_json::Value>) -> BTreeMap<String, Reference> {
    let mut out = BTreeMap::new();
    let Some(obj) = value.and_then(|v| v.as_object()) else {
        return out;
    };
    for (key, val) in obj {
        if let Some(inner) = val.as_object() {
            if inner.contains_key("bucket") {
                if let Ok(r) = serde_json::from_value::<Reference>(val.clone()) {
                    out.insert(key.clone(), r);
                }
                continue;
            }
            // Nested shape: s3References.<category>.<refName>
            for (ref_name, ref_val) in inner {
                if let Ok(r) = serde_json::from_value::<Reference>(ref_val.clone()) {
                    out.insert(ref_name.clone(), r);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_file_names_match_spec_layout() {
        assert_eq!(
            ReferenceCategory::ProcessingInitialization.file_name(),
            "processing/initialization.json"
        );
        assert_eq!(
            ReferenceCategory::ResultsVerificationSummary.file_name(),
            "results/verificationSummary.json"
        );
        assert_eq!(
            ReferenceCategory::Errors("fetcher".to_string()).file_name(),
            "errors/fetcher.json"
        );
        assert_eq!(
            ReferenceCategory::Errors("fetcher".to_string()).reference_key(),
            "errors_fetcher"
        );
    }

    #[test]
    fn set_reference_rejects_rebind_to_different_key() {
        let mut env = Envelope::new("verif-20250605074028-f5c4");
        env.set_reference(
            &ReferenceCategory::ImagesMetadata,
            Reference { bucket: "state".into(), key: "a".into(), size: 10 },
        )
        .unwrap();
        let err = env
            .set_reference(
                &ReferenceCategory::ImagesMetadata,
                Reference { bucket: "state".into(), key: "b".into(), size: 20 },
            )
            .unwrap_err();
        assert_eq!(err.code, vvw_error::ErrorCode::ValidationError);
    }

    #[test]
    fn set_reference_allows_idempotent_replay() {
        let mut env = Envelope::new("verif-20250605074028-f5c4");
        let r = Reference { bucket: "state".into(), key: "a".into(), size: 10 };
        env.set_reference(&ReferenceCategory::ImagesMetadata, r.clone()).unwrap();
        env.set_reference(&ReferenceCategory::ImagesMetadata, r).unwrap();
    }

    #[test]
    fn advance_status_rejects_non_monotonic_transition() {
        let mut env = Envelope::new("verif-1");
        env.advance_status(WorkflowStatus::VerificationInitialized).unwrap();
        let err = env.advance_status(WorkflowStatus::Initialized).unwrap_err();
        assert_eq!(err.code, vvw_error::ErrorCode::ValidationError);
    }

    #[test]
    fn normalize_flat_shape() {
        let value = json!({
            "verificationId": "verif-20250605074028-f5c4",
            "status": "IMAGES_FETCHED",
            "s3References": {
                "images_metadata": {"bucket": "state", "key": "2025/06/05/verif-1/images/metadata.json", "size": 512}
            },
            "summary": {"note": "ok"}
        });
        let env = EnvelopeInput::Value(value).normalize().unwrap();
        assert_eq!(env.verification_id, "verif-20250605074028-f5c4");
        assert_eq!(env.status, WorkflowStatus::ImagesFetched);
        assert!(env.references.contains_key("images_metadata"));
        assert_eq!(env.summary.get("note").unwrap(), "ok");
    }

    #[test]
    fn normalize_nested_shape_flattens_into_canonical_references() {
        let value = json!({
            "verificationId": "verif-1",
            "status": "INITIALIZED",
            "s3References": {
                "processing": {
                    "initialization": {"bucket": "state", "key": "p/init.json", "size": 100}
                },
                "images": {
                    "metadata": {"bucket": "state", "key": "i/meta.json", "size": 50}
                }
            }
        });
        let env = EnvelopeInput::Value(value).normalize().unwrap();
        assert_eq!(env.references.len(), 2);
        assert!(env.references.contains_key("initialization"));
        assert!(env.references.contains_key("metadata"));
    }

    #[test]
    fn normalize_from_bytes_and_string() {
        let raw = r#"{"verificationId":"verif-1","status":"INITIALIZED"}"#;
        let from_bytes = EnvelopeInput::Bytes(raw.as_bytes().to_vec()).normalize().unwrap();
        let from_str = EnvelopeInput::Str(raw.to_string()).normalize().unwrap();
        assert_eq!(from_bytes.verification_id, from_str.verification_id);
    }

    #[test]
    fn normalize_fails_without_verification_id() {
        let value = json!({"status": "INITIALIZED"});
        let err = EnvelopeInput::Value(value).normalize().unwrap_err();
        assert_eq!(err.code, vvw_error::ErrorCode::MissingField);
    }

    #[test]
    fn inherited_error_sources_detects_error_substring_keys() {
        let mut env = Envelope::new("verif-1");
        env.references.insert(
            "errors_fetcher".to_string(),
            Reference { bucket: "b".into(), key: "k".into(), size: 1 },
        );
        assert_eq!(env.inherited_error_sources(), vec!["errors_fetcher".to_string()]);
    }

    #[test]
    fn inherited_error_sources_detects_failed_status() {
        let mut env = Envelope::new("verif-1");
        env.status = WorkflowStatus::VerificationFailed;
        assert!(env.inherited_error_sources().contains(&"status".to_string()));
    }
}
