//! The Image & Context Fetcher (C4, §4.4): concurrent fan-out over the
//! checking image, the reference image (if any), the layout row (if any),
//! and the historical context builder.
//!
//! Per §9's parallel fan-out design note, the four lookups run
//! concurrently via `tokio::join!` rather than `try_join!` — every branch
//! is logged on failure before the first error (by priority, not
//! completion order) is returned, so a caller investigating a failed run
//! sees every collaborator that misbehaved, not just the one that lost the
//! race.

use vvw_config::WorkflowConfig;
use vvw_core::{Envelope, Reference, ReferenceCategory, VerificationContext, VerificationType, WorkflowStatus};
use vvw_error::WorkflowError;
use vvw_records::{LayoutRecord, RecordStore, VerificationRecord};
use vvw_store::ObjectStore;

use crate::historical::{self, HistoricalContext};

/// Metadata about one fetched image (§4.4's HEAD-response contract:
/// `{width?, height?, size, contentType, etag}` — only `width`/`height` are
/// optional, since a HEAD check never decodes the image body).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Bucket the image was fetched from.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Pixel width, when known. Never populated by a HEAD check alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Pixel height, when known. Never populated by a HEAD check alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Size in bytes.
    pub size: u64,
    /// MIME type reported by the object store.
    pub content_type: String,
    /// Object store's content fingerprint.
    pub etag: String,
    /// Image encoding inferred from the key's extension (`"jpeg"` or `"png"`).
    pub format: String,
}

/// The combined metadata for both images in a verification (§4.4
/// `ImagesMetadata`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesMetadata {
    /// The current ("checking") image.
    pub checking_image: ImageMetadata,
    /// The reference/planogram image, for `LAYOUT_VS_CHECKING`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<ImageMetadata>,
}

/// Infer an image's wire-contract format (`"jpeg"` or `"png"`) from its key
/// extension, normalizing `"jpg"` to `"jpeg"` (§4.6 "Request shape").
#[must_use]
pub fn infer_image_format(key: &str) -> String {
    match key.rsplit('.').next().unwrap_or_default().to_ascii_lowercase().as_str() {
        "png" => "png".to_string(),
        _ => "jpeg".to_string(),
    }
}

/// Run the Fetcher (§4.4): load both images, the layout row (for
/// `LAYOUT_VS_CHECKING`), and the historical context (for
/// `PREVIOUS_VS_CURRENT`), then register their metadata on `envelope` and
/// advance it to [`WorkflowStatus::ImagesFetched`].
///
/// # Errors
///
/// Returns the first of any fetch failure, in `checking image` > `reference
/// image` > `layout` > `historical context` priority order — every failure
/// is logged via `tracing::error!` regardless of priority.
pub async fn fetch(
    envelope: &mut Envelope,
    context: &VerificationContext,
    record: &VerificationRecord,
    config: &WorkflowConfig,
    objects: &dyn ObjectStore,
    records: &dyn RecordStore,
) -> Result<(HistoricalContext, Option<LayoutRecord>), WorkflowError> {
    record_inherited_errors(envelope);

    let checking_reference = Reference {
        bucket: config.checking_bucket.clone(),
        key: context.checking_image_key.clone(),
        size: 0,
    };
    let checking_fut = objects.head(&checking_reference);

    let reference_fut = async {
        match &context.reference_image_key {
            Some(key) => {
                let reference = Reference { bucket: config.reference_bucket.clone(), key: key.clone(), size: 0 };
                objects.head(&reference).await.map(Some)
            }
            None => Ok(None),
        }
    };

    let layout_fut = async {
        match (record.layout_id, &record.layout_prefix) {
            (Some(id), Some(prefix)) => records.get_layout(id, prefix).await,
            _ => Ok(None),
        }
    };

    let historical_fut = historical::build_historical_context(
        &context.verification_id,
        context.verification_type,
        &record.reference_image_url,
        config,
        records,
        objects,
    );

    let (checking_res, reference_res, layout_res, historical_res) =
        tokio::join!(checking_fut, reference_fut, layout_fut, historical_fut);

    if let Err(e) = &checking_res {
        tracing::error!(error = %e, "checking image fetch failed");
    }
    if let Err(e) = &reference_res {
        tracing::error!(error = %e, "reference image fetch failed");
    }
    if let Err(e) = &layout_res {
        tracing::error!(error = %e, "layout fetch failed");
    }
    if let Err(e) = &historical_res {
        tracing::error!(error = %e, "historical context build failed");
    }

    let checking_head = checking_res?;
    let reference_head = reference_res?;
    let layout = layout_res?;
    let historical_context = historical_res?;

    let images_metadata = ImagesMetadata {
        checking_image: ImageMetadata {
            bucket: config.checking_bucket.clone(),
            key: context.checking_image_key.clone(),
            width: None,
            height: None,
            size: checking_head.size,
            content_type: checking_head.content_type,
            etag: checking_head.etag,
            format: infer_image_format(&context.checking_image_key),
        },
        reference_image: match (&context.reference_image_key, reference_head) {
            (Some(key), Some(head)) => Some(ImageMetadata {
                bucket: config.reference_bucket.clone(),
                key: key.clone(),
                width: None,
                height: None,
                size: head.size,
                content_type: head.content_type,
                etag: head.etag,
                format: infer_image_format(key),
            }),
            _ => None,
        },
    };

    vvw_store::save_to_envelope(objects, envelope, &ReferenceCategory::ImagesMetadata, &images_metadata).await?;

    if let Some(layout) = &layout {
        vvw_store::save_to_envelope(objects, envelope, &ReferenceCategory::ProcessingLayoutMetadata, layout).await?;
    }

    if historical_context.present {
        vvw_store::save_to_envelope(
            objects,
            envelope,
            &ReferenceCategory::ProcessingHistoricalContext,
            &historical_context,
        )
        .await?;
    }

    envelope.advance_status(WorkflowStatus::ImagesFetched)?;

    Ok((historical_context, layout))
}

/// Inspect `envelope` on entry for inherited error references or a failed
/// status (§4.4 "Inherited errors"), recording `hasInheritedErrors` with
/// sources and a timestamp in `envelope.summary` when any are found. The
/// stage still proceeds normally afterward — best-effort forwarding, not a
/// hard failure.
fn record_inherited_errors(envelope: &mut Envelope) {
    let sources = envelope.inherited_error_sources();
    if sources.is_empty() {
        return;
    }
    tracing::warn!(verification_id = %envelope.verification_id, sources = ?sources, "inherited errors detected on entry");
    envelope.summary.insert("hasInheritedErrors".to_string(), serde_json::json!(true));
    envelope.summary.insert("inheritedErrorSources".to_string(), serde_json::json!(sources));
    envelope
        .summary
        .insert("inheritedErrorsDetectedAt".to_string(), serde_json::json!(chrono::Utc::now().to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vvw_core::MachineStructure;
    use vvw_records::FilesystemRecordStore;
    use vvw_store::FilesystemObjectStore;

    fn context(verification_type: VerificationType, reference_image_key: Option<String>) -> VerificationContext {
        VerificationContext {
            verification_id: "verif-20250605074028-f5c4".to_string(),
            verification_type,
            vending_machine_id: "vm-1".to_string(),
            checking_image_key: "b.jpg".to_string(),
            reference_image_key,
            request_metadata: BTreeMap::new(),
        }
    }

    fn record(layout_id: Option<i64>, layout_prefix: Option<String>, previous_id: Option<String>) -> VerificationRecord {
        VerificationRecord {
            verification_id: "verif-20250605074028-f5c4".to_string(),
            verification_at: "2025-06-05T07:40:28Z".to_string(),
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: String::new(),
            checking_image_url: "s3://checking/b.jpg".to_string(),
            vending_machine_id: "vm-1".to_string(),
            layout_id,
            layout_prefix,
            previous_verification_id: previous_id,
            notification_enabled: false,
            status: WorkflowStatus::VerificationInitialized,
            last_updated_at: "2025-06-05T07:40:28Z".to_string(),
            current_status: None,
            verification_status: None,
            status_history: vec![],
            processing_metrics: vvw_core::ProcessingMetrics::default(),
            error_tracking: vec![],
        }
    }

    #[tokio::test]
    async fn fetches_layout_vs_checking_with_layout_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let checking_store = FilesystemObjectStore::new(dir.path(), "checking");
        checking_store.put_bytes("", "b.jpg", b"checking-bytes".to_vec()).await.unwrap();
        let state_store = FilesystemObjectStore::new(dir.path(), "state");
        let records = FilesystemRecordStore::new(dir.path().join("records"));
        records
            .put_layout(&LayoutRecord {
                layout_id: 41927,
                layout_prefix: "54mf04d1".to_string(),
                machine_structure: MachineStructure::canonical_6x7(),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        struct Combined {
            checking: FilesystemObjectStore,
            state: FilesystemObjectStore,
        }
        #[async_trait::async_trait]
        impl ObjectStore for Combined {
            async fn put_bytes(&self, p: &str, k: &str, b: Vec<u8>) -> Result<Reference, WorkflowError> {
                self.state.put_bytes(p, k, b).await
            }
            async fn get_bytes(&self, r: &Reference) -> Result<Vec<u8>, WorkflowError> {
                self.checking.get_bytes(r).await
            }
        }
        let objects = Combined { checking: checking_store, state: state_store };

        let mut envelope = Envelope::new("verif-20250605074028-f5c4");
        envelope.advance_status(WorkflowStatus::VerificationInitialized).unwrap();

        let context = context(VerificationType::LayoutVsChecking, None);
        let record = record(Some(41927), Some("54mf04d1".to_string()), None);
        let config = WorkflowConfig::default();

        let (historical, layout) = fetch(&mut envelope, &context, &record, &config, &objects, &records)
            .await
            .unwrap();
        assert_eq!(envelope.status, WorkflowStatus::ImagesFetched);
        assert!(!historical.present);
        assert!(layout.is_some());
        assert!(envelope.get_reference(&ReferenceCategory::ImagesMetadata).is_some());
        assert!(envelope.get_reference(&ReferenceCategory::ProcessingLayoutMetadata).is_some());
    }

    #[test]
    fn infers_format_from_extension() {
        assert_eq!(infer_image_format("a/b.PNG"), "png");
        assert_eq!(infer_image_format("a/b.jpg"), "jpeg");
        assert_eq!(infer_image_format("a/b.jpeg"), "jpeg");
    }
}
