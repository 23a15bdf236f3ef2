//! The Initializer (C3, §4.3): validate the incoming request, allocate a
//! verification id, and write the first durable record and envelope.

use std::collections::BTreeMap;
use vvw_core::{
    allocate_verification_id, Envelope, ReferenceCategory, StatusTransition, VerificationContext,
    VerificationType, WorkflowStatus,
};
use vvw_error::{ErrorCode, WorkflowError};
use vvw_records::{RecordStore, VerificationRecord};
use vvw_store::ObjectStore;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// The caller-supplied request this stage validates and bootstraps from.
#[derive(Debug, Clone)]
pub struct InitializationRequest {
    /// Caller-supplied verification id, for idempotent replay. When
    /// absent, a fresh id is allocated.
    pub verification_id: Option<String>,
    /// Vending machine identifier.
    pub vending_machine_id: String,
    /// Comparison mode.
    pub verification_type: VerificationType,
    /// `s3://` URL of the current ("checking") image.
    pub checking_image_url: String,
    /// `s3://` URL of the reference image, required for `LAYOUT_VS_CHECKING`.
    pub reference_image_url: Option<String>,
    /// Layout id, for `LAYOUT_VS_CHECKING`.
    pub layout_id: Option<i64>,
    /// Layout prefix, for `LAYOUT_VS_CHECKING`.
    pub layout_prefix: Option<String>,
    /// Prior verification id, for `PREVIOUS_VS_CURRENT`.
    pub previous_verification_id: Option<String>,
    /// Whether the (out-of-scope) notification bus should be notified.
    pub notification_enabled: bool,
}

/// Split an `s3://bucket/key` URL into its parts, requiring a recognized
/// image extension on the key (§4.3 "validate S3 URLs + extensions").
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if the scheme, bucket, key, or
/// extension is malformed.
pub fn parse_s3_url(url: &str) -> Result<(String, String), WorkflowError> {
    let rest = url.strip_prefix("s3://").ok_or_else(|| {
        WorkflowError::new(ErrorCode::ValidationError, format!("`{url}` is not an s3:// URL"))
    })?;
    let (bucket, key) = rest.split_once('/').ok_or_else(|| {
        WorkflowError::new(ErrorCode::ValidationError, format!("`{url}` has no key component"))
    })?;
    if bucket.is_empty() || key.is_empty() {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!("`{url}` has an empty bucket or key"),
        ));
    }
    let extension = key.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!("`{key}` does not have a recognized image extension"),
        ));
    }
    Ok((bucket.to_string(), key.to_string()))
}

fn envelope_for_status(verification_id: &str, status: WorkflowStatus) -> Result<Envelope, WorkflowError> {
    let mut envelope = Envelope::new(verification_id);
    if status != WorkflowStatus::Initialized {
        envelope.advance_status(status)?;
    }
    Ok(envelope)
}

/// Run the Initializer (§4.3): parse and existence-check the supplied
/// image/layout references, allocate (or reuse) a verification id, and
/// persist the initial [`VerificationContext`] and [`VerificationRecord`].
///
/// Idempotent: when `request.verification_id` is supplied and a record
/// already exists for it, that record (and a reconstructed envelope) is
/// returned without re-running the existence checks or re-writing state.
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if a URL is malformed, a
/// referenced image or layout does not exist, or `LAYOUT_VS_CHECKING` is
/// missing its reference image.
pub async fn initialize(
    request: InitializationRequest,
    objects: &dyn ObjectStore,
    records: &dyn RecordStore,
) -> Result<(Envelope, VerificationRecord), WorkflowError> {
    if let Some(id) = &request.verification_id {
        if let Some(existing) = records.get_verification(id).await? {
            let envelope = envelope_for_status(id, existing.status)?;
            return Ok((envelope, existing));
        }
    }

    let (checking_bucket, checking_key) = parse_s3_url(&request.checking_image_url)?;
    let reference_parts = request
        .reference_image_url
        .as_deref()
        .map(parse_s3_url)
        .transpose()?;

    if request.verification_type == VerificationType::LayoutVsChecking && reference_parts.is_none() {
        return Err(WorkflowError::missing_field("referenceImageUrl"));
    }

    let verification_id = request.verification_id.clone().unwrap_or_else(allocate_verification_id);

    // §5: resource checks run fanned out, not gated one after another.
    let checking_ref = vvw_core::Reference { bucket: checking_bucket, key: checking_key.clone(), size: 0 };
    let checking_fut = objects.exists(&checking_ref);

    let reference_fut = async {
        match &reference_parts {
            Some((bucket, key)) => {
                let reference_ref = vvw_core::Reference { bucket: bucket.clone(), key: key.clone(), size: 0 };
                objects.exists(&reference_ref).await
            }
            None => Ok(true),
        }
    };

    let layout_fut = async {
        match (request.layout_id, &request.layout_prefix) {
            (Some(layout_id), Some(layout_prefix)) => {
                Ok(records.get_layout(layout_id, layout_prefix).await?.is_some())
            }
            _ => Ok(true),
        }
    };

    let (checking_res, reference_res, layout_res) = tokio::join!(checking_fut, reference_fut, layout_fut);

    if let Err(e) = &checking_res {
        tracing::error!(error = %e, "checking image existence check failed");
    }
    if let Err(e) = &reference_res {
        tracing::error!(error = %e, "reference image existence check failed");
    }
    if let Err(e) = &layout_res {
        tracing::error!(error = %e, "layout existence check failed");
    }

    if !checking_res? {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!("checking image `{}` does not exist", request.checking_image_url),
        )
        .with_verification_id(verification_id.clone()));
    }
    if !reference_res? {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!("reference image `{}` does not exist", request.reference_image_url.as_deref().unwrap_or("")),
        )
        .with_verification_id(verification_id.clone()));
    }
    if !layout_res? {
        return Err(WorkflowError::new(
            ErrorCode::ValidationError,
            format!(
                "layout `{}/{}` does not exist",
                request.layout_id.unwrap_or_default(),
                request.layout_prefix.as_deref().unwrap_or("")
            ),
        )
        .with_verification_id(verification_id.clone()));
    }

    let context = VerificationContext {
        verification_id: verification_id.clone(),
        verification_type: request.verification_type,
        vending_machine_id: request.vending_machine_id.clone(),
        checking_image_key: checking_key,
        reference_image_key: reference_parts.map(|(_, key)| key),
        request_metadata: BTreeMap::new(),
    };
    context.validate()?;

    let mut envelope = Envelope::new(&verification_id);
    envelope.advance_status(WorkflowStatus::VerificationInitialized)?;
    vvw_store::save_to_envelope(objects, &mut envelope, &ReferenceCategory::ProcessingInitialization, &context)
        .await?;

    let now = chrono::Utc::now().to_rfc3339();
    let record = VerificationRecord {
        verification_id: verification_id.clone(),
        verification_at: now.clone(),
        verification_type: request.verification_type,
        reference_image_url: request.reference_image_url.clone().unwrap_or_default(),
        checking_image_url: request.checking_image_url.clone(),
        vending_machine_id: request.vending_machine_id,
        layout_id: request.layout_id,
        layout_prefix: request.layout_prefix,
        previous_verification_id: request.previous_verification_id,
        notification_enabled: request.notification_enabled,
        status: WorkflowStatus::VerificationInitialized,
        last_updated_at: now.clone(),
        current_status: None,
        verification_status: None,
        status_history: vec![StatusTransition {
            status: WorkflowStatus::VerificationInitialized,
            timestamp: now,
            stage: "initializer".to_string(),
        }],
        processing_metrics: vvw_core::ProcessingMetrics::default(),
        error_tracking: vec![],
    };
    records.upsert_verification(record.clone()).await?;

    Ok((envelope, record))
}
