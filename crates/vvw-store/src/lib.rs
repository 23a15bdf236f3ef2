//! The state-envelope store (C1): atomic typed-JSON put, raw get, and
//! envelope-aware save, grounded on the file-per-key persistence pattern
//! used elsewhere in this workspace for durable records.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::instrument;
use vvw_core::{Envelope, Reference, ReferenceCategory};
use vvw_error::{ErrorCode, ServiceHint, WorkflowError};

/// HEAD-response metadata for one object (§4.4: `{width?, height?, size,
/// contentType, etag}` — only `width`/`height` are optional, decoded lazily
/// by the caller from the bytes it separately reads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// Size in bytes.
    pub size: u64,
    /// MIME type, inferred from the key's extension.
    pub content_type: String,
    /// Opaque content fingerprint, stable across reads of the same bytes.
    pub etag: String,
}

/// Infer a MIME type from an object key's extension, for [`ObjectHead`].
#[must_use]
pub fn infer_content_type(key: &str) -> String {
    match key.rsplit('.').next().unwrap_or_default().to_ascii_lowercase().as_str() {
        "png" => "image/png".to_string(),
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "json" => "application/json".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

/// Derive a stable etag from an object's bytes via a non-cryptographic
/// hash — good enough for change-detection, not for content addressing.
#[must_use]
pub fn etag_for_bytes(bytes: &[u8]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Pluggable blob storage. Implementations are full-object-replace: a
/// `put_bytes` either lands entirely or the prior value remains visible —
/// no partial writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `<bucket>/<partition>/<key>` and return the
    /// resulting reference.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::S3Error`] on I/O failure.
    async fn put_bytes(
        &self,
        partition: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<Reference, WorkflowError>;

    /// Read the full byte body of `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::S3Error`] if the object is missing or
    /// unreadable.
    async fn get_bytes(&self, reference: &Reference) -> Result<Vec<u8>, WorkflowError>;

    /// Check whether `reference` exists, without necessarily reading its
    /// body (the Initializer's and Fetcher's existence-check calls, §4.3,
    /// §4.4).
    ///
    /// The default implementation delegates to [`Self::get_bytes`] and
    /// discards the body; implementations backed by a real object store
    /// should override this with a cheaper HEAD-style call.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::S3Error`] for any failure other than
    /// not-found.
    async fn exists(&self, reference: &Reference) -> Result<bool, WorkflowError> {
        match self.get_bytes(reference).await {
            Ok(_) => Ok(true),
            Err(e) if e.code == ErrorCode::S3Error && e.message.contains("NoSuchKey") => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// HEAD `reference`: size, content type, and etag, without necessarily
    /// reading the full body into a caller-visible buffer (§4.4's image
    /// HEAD checks).
    ///
    /// The default implementation delegates to [`Self::get_bytes`] and
    /// derives `content_type`/`etag` from the result; implementations
    /// backed by a real object store should override this with a native
    /// HEAD call.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::S3Error`] if the object is missing or
    /// unreadable.
    async fn head(&self, reference: &Reference) -> Result<ObjectHead, WorkflowError> {
        let bytes = self.get_bytes(reference).await?;
        Ok(ObjectHead {
            size: bytes.len() as u64,
            content_type: infer_content_type(&reference.key),
            etag: etag_for_bytes(&bytes),
        })
    }
}

/// Content-addressed, filesystem-backed [`ObjectStore`] used for local
/// development, tests, and the local CLI driver.
#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FilesystemObjectStore {
    /// Create a store rooted at `root`, namespaced under a single logical
    /// `bucket` (a subdirectory, not a physical bucket).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn path_for(&self, partition: &str, key: &str) -> PathBuf {
        self.root.join(&self.bucket).join(partition).join(key)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, partition, key))]
    async fn put_bytes(
        &self,
        partition: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<Reference, WorkflowError> {
        let path = self.path_for(partition, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                vvw_error::classify(ServiceHint::S3, &format!("InternalError: create dir: {e}"))
            })?;
        }
        let size = bytes.len() as u64;
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            vvw_error::classify(ServiceHint::S3, &format!("InternalError: write object: {e}"))
        })?;
        Ok(Reference {
            bucket: self.bucket.clone(),
            key: format!("{partition}/{key}"),
            size,
        })
    }

    #[instrument(skip(self), fields(bucket = %reference.bucket, key = %reference.key))]
    async fn get_bytes(&self, reference: &Reference) -> Result<Vec<u8>, WorkflowError> {
        let path = self.root.join(&reference.bucket).join(&reference.key);
        tokio::fs::read(&path).await.map_err(|e| {
            let native = if e.kind() == std::io::ErrorKind::NotFound {
                format!("NoSuchKey: {}", reference.key)
            } else {
                format!("InternalError: read object: {e}")
            };
            vvw_error::classify(ServiceHint::S3, &native)
                .with_detail("key", reference.key.clone())
        })
    }
}

/// `StoreJSON(partition, key, value) -> Reference`: serialize `value` as
/// canonical JSON and write it under `<bucket>/<partition>/<key>`.
///
/// # Errors
///
/// Returns [`ErrorCode::S3Error`] on I/O failure.
pub async fn store_json(
    store: &dyn ObjectStore,
    partition: &str,
    key: &str,
    value: &impl Serialize,
) -> Result<Reference, WorkflowError> {
    let bytes = serde_json::to_vec(value).map_err(|e| {
        WorkflowError::new(ErrorCode::ParsingError, format!("failed to serialize {key}: {e}"))
    })?;
    store.put_bytes(partition, key, bytes).await
}

/// `Retrieve(ref) -> bytes`.
///
/// # Errors
///
/// Returns [`ErrorCode::S3Error`] if the object is missing.
pub async fn retrieve(store: &dyn ObjectStore, reference: &Reference) -> Result<Vec<u8>, WorkflowError> {
    store.get_bytes(reference).await
}

/// `RetrieveJSON(ref) -> T`: [`retrieve`] then JSON-parse.
///
/// # Errors
///
/// Returns [`ErrorCode::S3Error`] if the I/O fails, or
/// [`ErrorCode::ParsingError`] if the body is not valid JSON for `T`.
pub async fn retrieve_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    reference: &Reference,
) -> Result<T, WorkflowError> {
    let bytes = retrieve(store, reference).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        WorkflowError::new(
            ErrorCode::ParsingError,
            format!("failed to parse object at `{}`: {e}", reference.key),
        )
    })
}

/// `SaveToEnvelope(env, category, value)`: compute the verification's date
/// partition, store `value` under `category`'s file name, and register the
/// resulting reference on `env`.
///
/// # Errors
///
/// Returns [`ErrorCode::S3Error`] on I/O failure, or
/// [`ErrorCode::ValidationError`] if the reference would rebind an
/// existing key to a different `(bucket, key)`.
pub async fn save_to_envelope(
    store: &dyn ObjectStore,
    env: &mut Envelope,
    category: &ReferenceCategory,
    value: &impl Serialize,
) -> Result<Reference, WorkflowError> {
    let partition = format!(
        "{}/{}",
        vvw_core::date_partition(&env.verification_id)?,
        env.verification_id
    );
    let reference = store_json(store, &partition, &category.file_name(), value).await?;
    env.set_reference(category, reference.clone())?;
    Ok(reference)
}

/// Join `partition` and a relative `key` the way [`FilesystemObjectStore`]
/// lays out paths, for callers that need to predict a key without writing
/// (e.g. the historical-context lookup's URL-construction fallback, §4.5).
#[must_use]
pub fn joined_key(partition: &str, key: &str) -> String {
    Path::new(partition).join(key).to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vvw_core::WorkflowStatus;

    #[tokio::test]
    async fn store_then_retrieve_round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "state");
        let value = serde_json::json!({"hello": "world"});
        let reference = store_json(&store, "2025/06/05/verif-1", "images/metadata.json", &value)
            .await
            .unwrap();
        assert_eq!(reference.bucket, "state");
        assert_eq!(reference.key, "2025/06/05/verif-1/images/metadata.json");

        let round_tripped: serde_json::Value = retrieve_json(&store, &reference).await.unwrap();
        assert_eq!(round_tripped, value);
    }

    #[tokio::test]
    async fn retrieve_missing_object_is_s3_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "state");
        let reference = Reference { bucket: "state".into(), key: "nope.json".into(), size: 0 };
        let err = retrieve(&store, &reference).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::S3Error);
    }

    #[tokio::test]
    async fn save_to_envelope_registers_reference_under_date_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "state");
        let mut env = Envelope::new("verif-20250605074028-f5c4");
        env.advance_status(WorkflowStatus::VerificationInitialized).unwrap();

        let ctx = serde_json::json!({"verificationId": env.verification_id});
        let reference = save_to_envelope(
            &store,
            &mut env,
            &ReferenceCategory::ProcessingInitialization,
            &ctx,
        )
        .await
        .unwrap();

        assert!(reference.key.starts_with("2025/06/05/verif-20250605074028-f5c4/"));
        assert_eq!(
            env.get_reference(&ReferenceCategory::ProcessingInitialization),
            Some(&reference)
        );
    }

    #[tokio::test]
    async fn exists_distinguishes_missing_from_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "state");
        let reference = store.put_bytes("p", "present.json", b"{}".to_vec()).await.unwrap();
        assert!(store.exists(&reference).await.unwrap());

        let missing = Reference { bucket: "state".into(), key: "p/absent.json".into(), size: 0 };
        assert!(!store.exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn retrieve_json_with_wrong_shape_is_parsing_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path(), "state");
        let reference = store
            .put_bytes("p", "not-json.json", b"not json at all".to_vec())
            .await
            .unwrap();
        let err = retrieve_json::<serde_json::Value>(&store, &reference).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ParsingError);
    }
}
