//! Unified error taxonomy, retry classification, and logging redaction for
//! the vending-machine visual-verification workflow.
//!
//! Every stage error carries a stable [`ErrorCode`], a human-readable
//! message, a [`Severity`], a `retryable` flag, an optional
//! `verification_id`, and arbitrary structured `details`. [`classify`] (and
//! its per-service siblings [`classify_s3`], [`classify_dynamodb`],
//! [`classify_bedrock`]) map native error text onto this taxonomy in one
//! place so retry policy never needs a per-call try/catch ladder.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity of a workflow error, for alerting/triage purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational; unlikely to need operator attention.
    Low,
    /// Worth noting; no immediate action required.
    Medium,
    /// Likely needs attention; workflow outcome is affected.
    High,
    /// Requires immediate attention; data integrity or availability at risk.
    Critical,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable top-level error class.
///
/// Matches §4.2 of the workflow spec. `S3_ERROR`, `DYNAMODB_ERROR`, and
/// `BEDROCK_ERROR` carry a more specific sub-code in [`WorkflowError::details`]
/// under the `"sub_code"` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input; never retryable.
    ValidationError,
    /// Specialization of [`ErrorCode::ValidationError`]: a required field is absent.
    MissingField,
    /// JSON/markdown could not be lifted to the expected schema.
    ParsingError,
    /// Object-store I/O failure.
    S3Error,
    /// Record-store I/O failure.
    DynamoDbError,
    /// Multimodal inference failure.
    BedrockError,
    /// A deadline expired.
    TimeoutError,
    /// Catch-all for unexpected internal errors.
    InternalError,
}

impl ErrorCode {
    /// Stable `&'static str` representation (e.g. `"VALIDATION_ERROR"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::MissingField => "MISSING_FIELD",
            Self::ParsingError => "PARSING_ERROR",
            Self::S3Error => "S3_ERROR",
            Self::DynamoDbError => "DYNAMODB_ERROR",
            Self::BedrockError => "BEDROCK_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Default severity for this class, absent any more specific override.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::ValidationError | Self::MissingField => Severity::Low,
            Self::ParsingError | Self::TimeoutError => Severity::Medium,
            Self::S3Error | Self::DynamoDbError | Self::BedrockError => Severity::Medium,
            Self::InternalError => Severity::Critical,
        }
    }

    /// `true` if this class is retryable by default when no sub-code says
    /// otherwise (used only for [`ErrorCode::TimeoutError`], which is always
    /// retryable; every other class requires sub-code classification).
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::TimeoutError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sub-codes
// ---------------------------------------------------------------------------

/// Sub-codes for [`ErrorCode::S3Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum S3SubCode {
    /// Request was throttled.
    Throttling,
    /// Service temporarily unavailable.
    ServiceUnavailable,
    /// Service returned an internal server error.
    InternalServerError,
    /// Object does not exist.
    NoSuchKey,
    /// Bucket does not exist.
    NoSuchBucket,
    /// Anything not otherwise recognised.
    Unknown,
}

impl S3SubCode {
    /// Whether this sub-code is transient and safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttling | Self::ServiceUnavailable | Self::InternalServerError
        )
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttling => "THROTTLING",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NoSuchKey => "NO_SUCH_KEY",
            Self::NoSuchBucket => "NO_SUCH_BUCKET",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Sub-codes for [`ErrorCode::DynamoDbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DynamoDbSubCode {
    /// Request shape failed service-side validation.
    ValidationException,
    /// A conditional write's condition was not met.
    ConditionalCheckFailed,
    /// Provisioned throughput exceeded.
    ThroughputExceeded,
    /// The requested item/table does not exist.
    ResourceNotFound,
    /// Request was throttled.
    ThrottlingException,
    /// Service returned an internal server error.
    InternalServerError,
    /// Anything not otherwise recognised.
    Unknown,
}

impl DynamoDbSubCode {
    /// Whether this sub-code is transient and safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ThroughputExceeded | Self::ThrottlingException | Self::InternalServerError
        )
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationException => "VALIDATION_EXCEPTION",
            Self::ConditionalCheckFailed => "CONDITIONAL_CHECK_FAILED",
            Self::ThroughputExceeded => "THROUGHPUT_EXCEEDED",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::ThrottlingException => "THROTTLING_EXCEPTION",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Sub-codes for [`ErrorCode::BedrockError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BedrockSubCode {
    /// Request was throttled.
    ThrottlingException,
    /// Model/service temporarily unavailable.
    ServiceUnavailable,
    /// Request shape failed service-side validation.
    ValidationException,
    /// Caller lacks permission to invoke the model.
    AccessDenied,
    /// Model took too long to respond.
    ModelTimeout,
    /// Anything not otherwise recognised.
    Unknown,
}

impl BedrockSubCode {
    /// Whether this sub-code is transient and safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ThrottlingException | Self::ServiceUnavailable | Self::ModelTimeout
        )
    }

    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThrottlingException => "THROTTLING_EXCEPTION",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ValidationException => "VALIDATION_EXCEPTION",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::ModelTimeout => "MODEL_TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// A unified workflow error.
pub struct WorkflowError {
    /// Top-level error class.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the step-function engine may retry the stage.
    pub retryable: bool,
    /// Severity for triage/alerting.
    pub severity: Severity,
    /// The verification this error pertains to, if known.
    pub verification_id: Option<String>,
    /// Arbitrary structured context (e.g. `"sub_code"`, `"resource"`).
    pub details: BTreeMap<String, serde_json::Value>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WorkflowError {
    /// Create a new error with the given code and message.
    ///
    /// `retryable` and `severity` are seeded from [`ErrorCode::default_retryable`]
    /// and [`ErrorCode::default_severity`]; use [`Self::retryable`] /
    /// [`Self::severity`] to override, or construct via [`classify`] for
    /// sub-code-aware classification.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.default_retryable(),
            severity: code.default_severity(),
            code,
            message: message.into(),
            verification_id: None,
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Override the retryable flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Override the severity.
    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach the verification id this error pertains to.
    #[must_use]
    pub fn with_verification_id(mut self, id: impl Into<String>) -> Self {
        self.verification_id = Some(id.into());
        self
    }

    /// Attach a key-value pair to `details`. Serialization failures are
    /// silently skipped, matching the teacher taxonomy's builder behavior.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// A `MISSING_FIELD` convenience constructor.
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::new(ErrorCode::MissingField, format!("missing required field: {field}"))
            .with_detail("field", field)
    }
}

impl fmt::Debug for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("WorkflowError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        d.field("retryable", &self.retryable);
        d.field("severity", &self.severity);
        if let Some(ref id) = self.verification_id {
            d.field("verification_id", id);
        }
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if let Some(ref id) = self.verification_id {
            write!(f, " (verification_id={id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serialisable snapshot of a [`WorkflowError`] (without the opaque source),
/// suitable for `errors/<stage>.json` and the durable record's
/// `errorTracking` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowErrorDto {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether the engine may retry.
    pub retryable: bool,
    /// Severity.
    pub severity: Severity,
    /// Verification id, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,
    /// Structured context.
    pub details: BTreeMap<String, serde_json::Value>,
    /// String form of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&WorkflowError> for WorkflowErrorDto {
    fn from(err: &WorkflowError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            retryable: err.retryable,
            severity: err.severity,
            verification_id: err.verification_id.clone(),
            details: err.details.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry classification
// ---------------------------------------------------------------------------

/// Classify a native S3-style error string into a sub-code and retryability.
///
/// Detects substrings the way real AWS SDK errors render in their `Display`
/// impl (`"ThrottlingException"`, `"SlowDown"`, `"ServiceUnavailable"`, ...).
#[must_use]
pub fn classify_s3(native_err: &str) -> (S3SubCode, bool) {
    let lower = native_err.to_ascii_lowercase();
    let sub = if lower.contains("throttl") || lower.contains("slowdown") {
        S3SubCode::Throttling
    } else if lower.contains("serviceunavailable") || lower.contains("service unavailable") {
        S3SubCode::ServiceUnavailable
    } else if lower.contains("internalerror") || lower.contains("internal server error") {
        S3SubCode::InternalServerError
    } else if lower.contains("nosuchkey") {
        S3SubCode::NoSuchKey
    } else if lower.contains("nosuchbucket") {
        S3SubCode::NoSuchBucket
    } else {
        S3SubCode::Unknown
    };
    let retryable = sub.is_retryable();
    (sub, retryable)
}

/// Classify a native DynamoDB-style error string into a sub-code and
/// retryability.
#[must_use]
pub fn classify_dynamodb(native_err: &str) -> (DynamoDbSubCode, bool) {
    let lower = native_err.to_ascii_lowercase();
    let sub = if lower.contains("validationexception") {
        DynamoDbSubCode::ValidationException
    } else if lower.contains("conditionalcheckfailed") {
        DynamoDbSubCode::ConditionalCheckFailed
    } else if lower.contains("provisionedthroughputexceeded") || lower.contains("throughputexceeded")
    {
        DynamoDbSubCode::ThroughputExceeded
    } else if lower.contains("resourcenotfound") {
        DynamoDbSubCode::ResourceNotFound
    } else if lower.contains("throttlingexception") || lower.contains("throttl") {
        DynamoDbSubCode::ThrottlingException
    } else if lower.contains("internalservererror") || lower.contains("internal server error") {
        DynamoDbSubCode::InternalServerError
    } else {
        DynamoDbSubCode::Unknown
    };
    let retryable = sub.is_retryable();
    (sub, retryable)
}

/// Classify a native Bedrock-style error string into a sub-code and
/// retryability.
#[must_use]
pub fn classify_bedrock(native_err: &str) -> (BedrockSubCode, bool) {
    let lower = native_err.to_ascii_lowercase();
    let sub = if lower.contains("throttlingexception") || lower.contains("throttl") {
        BedrockSubCode::ThrottlingException
    } else if lower.contains("serviceunavailable") || lower.contains("service unavailable") {
        BedrockSubCode::ServiceUnavailable
    } else if lower.contains("validationexception") {
        BedrockSubCode::ValidationException
    } else if lower.contains("accessdenied") {
        BedrockSubCode::AccessDenied
    } else if lower.contains("timeout") {
        BedrockSubCode::ModelTimeout
    } else {
        BedrockSubCode::Unknown
    };
    let retryable = sub.is_retryable();
    (sub, retryable)
}

/// Which service a native error string should be classified against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHint {
    /// Object store (S3-like).
    S3,
    /// Record store (DynamoDB-like).
    DynamoDb,
    /// Multimodal inference endpoint (Bedrock-like).
    Bedrock,
}

/// Promote a native error string to a [`WorkflowError`], given which service
/// produced it.
///
/// Unknown sub-codes default to **non-retryable**, per the taxonomy's
/// wrapping rule: "unknown errors default to non-retryable to avoid
/// amplifying bugs into storms".
#[must_use]
pub fn classify(service: ServiceHint, native_err: &str) -> WorkflowError {
    match service {
        ServiceHint::S3 => {
            let (sub, retryable) = classify_s3(native_err);
            WorkflowError::new(ErrorCode::S3Error, native_err)
                .retryable(retryable)
                .with_detail("sub_code", sub.as_str())
        }
        ServiceHint::DynamoDb => {
            let (sub, retryable) = classify_dynamodb(native_err);
            WorkflowError::new(ErrorCode::DynamoDbError, native_err)
                .retryable(retryable)
                .with_detail("sub_code", sub.as_str())
        }
        ServiceHint::Bedrock => {
            let (sub, retryable) = classify_bedrock(native_err);
            WorkflowError::new(ErrorCode::BedrockError, native_err)
                .retryable(retryable)
                .with_detail("sub_code", sub.as_str())
        }
    }
}

// ---------------------------------------------------------------------------
// Logging redaction
// ---------------------------------------------------------------------------

/// Redact a URL-shaped field for structured log lines, per §4.2's logging
/// rule: present URLs become `"[URL_PROVIDED]"`, empty/absent ones become
/// `"[EMPTY]"`.
#[must_use]
pub fn redact_url(url: Option<&str>) -> &'static str {
    match url {
        Some(u) if !u.trim().is_empty() => "[URL_PROVIDED]",
        _ => "[EMPTY]",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_details() {
        let err = WorkflowError::new(ErrorCode::InternalError, "boom");
        assert_eq!(err.to_string(), "[INTERNAL_ERROR] boom");
    }

    #[test]
    fn display_with_verification_id() {
        let err = WorkflowError::new(ErrorCode::TimeoutError, "deadline exceeded")
            .with_verification_id("verif-20250605074028-f5c4");
        let s = err.to_string();
        assert!(s.contains("TIMEOUT_ERROR"));
        assert!(s.contains("verif-20250605074028-f5c4"));
    }

    #[test]
    fn validation_error_never_retryable_by_default() {
        let err = WorkflowError::new(ErrorCode::ValidationError, "bad url");
        assert!(!err.retryable);
        let err = WorkflowError::new(ErrorCode::MissingField, "bad url");
        assert!(!err.retryable);
    }

    #[test]
    fn timeout_error_is_always_retryable_by_default() {
        let err = WorkflowError::new(ErrorCode::TimeoutError, "deadline");
        assert!(err.retryable);
    }

    #[test]
    fn s3_throttling_is_retryable() {
        let (sub, retryable) = classify_s3("ThrottlingException: Rate exceeded");
        assert_eq!(sub, S3SubCode::Throttling);
        assert!(retryable);
    }

    #[test]
    fn s3_no_such_key_is_not_retryable() {
        let (sub, retryable) = classify_s3("NoSuchKey: the specified key does not exist");
        assert_eq!(sub, S3SubCode::NoSuchKey);
        assert!(!retryable);
    }

    #[test]
    fn dynamodb_sub_codes_match_spec_table() {
        assert!(!classify_dynamodb("ValidationException").1);
        assert!(!classify_dynamodb("ConditionalCheckFailedException").1);
        assert!(classify_dynamodb("ProvisionedThroughputExceededException").1);
        assert!(!classify_dynamodb("ResourceNotFoundException").1);
        assert!(classify_dynamodb("ThrottlingException").1);
        assert!(classify_dynamodb("InternalServerError").1);
    }

    #[test]
    fn bedrock_throttling_is_retryable_access_denied_is_not() {
        assert!(classify_bedrock("ThrottlingException").1);
        assert!(!classify_bedrock("AccessDeniedException").1);
    }

    #[test]
    fn unknown_native_error_defaults_non_retryable() {
        let (sub, retryable) = classify_s3("some never before seen error string");
        assert_eq!(sub, S3SubCode::Unknown);
        assert!(!retryable);
        let (sub, retryable) = classify_dynamodb("totally novel failure");
        assert_eq!(sub, DynamoDbSubCode::Unknown);
        assert!(!retryable);
        let (sub, retryable) = classify_bedrock("mystery failure");
        assert_eq!(sub, BedrockSubCode::Unknown);
        assert!(!retryable);
    }

    #[test]
    fn classify_promotes_to_workflow_error_with_sub_code_detail() {
        let err = classify(ServiceHint::DynamoDb, "ThrottlingException: too many requests");
        assert_eq!(err.code, ErrorCode::DynamoDbError);
        assert!(err.retryable);
        assert_eq!(
            err.details.get("sub_code").and_then(|v| v.as_str()),
            Some("THROTTLING_EXCEPTION")
        );
    }

    #[test]
    fn redact_url_rules() {
        assert_eq!(redact_url(Some("s3://bucket/key.png")), "[URL_PROVIDED]");
        assert_eq!(redact_url(Some("")), "[EMPTY]");
        assert_eq!(redact_url(Some("   ")), "[EMPTY]");
        assert_eq!(redact_url(None), "[EMPTY]");
    }

    #[test]
    fn dto_round_trip_drops_source_but_keeps_message() {
        let err = WorkflowError::new(ErrorCode::ParsingError, "bad markdown")
            .with_detail("stage", "turn1_response_processor");
        let dto = WorkflowErrorDto::from(&err);
        let json = serde_json::to_string(&dto).unwrap();
        let back: WorkflowErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dto);
        assert_eq!(back.message, "bad markdown");
    }

    #[test]
    fn missing_field_constructor_sets_detail() {
        let err = WorkflowError::missing_field("layoutId");
        assert_eq!(err.code, ErrorCode::MissingField);
        assert_eq!(err.details.get("field").and_then(|v| v.as_str()), Some("layoutId"));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }
}
