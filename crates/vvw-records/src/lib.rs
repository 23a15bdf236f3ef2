//! Record-store abstraction: the durable verification record, the
//! conversation-history table, and the layout table (§6), behind a
//! `RecordStore` trait with a filesystem-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::instrument;
use vvw_core::{MachineStructure, ProcessingMetrics, StatusTransition, TrackedError, VerificationType, WorkflowStatus};
use vvw_error::{ErrorCode, ServiceHint, WorkflowError};

/// AI-reported or workflow-fallback verdict for a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// The AI found no discrepancies.
    Correct,
    /// The AI found at least one discrepancy.
    Incorrect,
    /// Workflow-completion fallback: the workflow finished but the verdict
    /// could not be parsed from the model response. Not a synonym of
    /// [`Self::Correct`] (§9 Open Question).
    Success,
}

/// The durable verification record: created once by the Initializer,
/// updated by the Finalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    /// Partition key.
    pub verification_id: String,
    /// Sort key: RFC3339 timestamp set once at initialization and never
    /// overwritten (§9 Open Question: `verificationAt` is fixed at init
    /// time so the durable key stays stable).
    pub verification_at: String,
    /// Comparison mode.
    pub verification_type: VerificationType,
    /// Reference image URL.
    pub reference_image_url: String,
    /// Checking image URL.
    pub checking_image_url: String,
    /// Vending machine identifier.
    pub vending_machine_id: String,
    /// Layout id, for `LAYOUT_VS_CHECKING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix, for `LAYOUT_VS_CHECKING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Prior verification id, for `PREVIOUS_VS_CURRENT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    /// Whether the (out-of-scope) notification bus should be notified.
    pub notification_enabled: bool,
    /// Workflow status.
    pub status: WorkflowStatus,
    /// Last-updated timestamp (RFC3339).
    pub last_updated_at: String,
    /// Terminal copy of `status`, set by the Finalizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<WorkflowStatus>,
    /// AI-reported or fallback verdict, set by the Finalizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    /// Appended on every status advance.
    #[serde(default)]
    pub status_history: Vec<StatusTransition>,
    /// Best-effort per-stage timing/retry bookkeeping.
    #[serde(default)]
    pub processing_metrics: ProcessingMetrics,
    /// Structured errors recorded against this run.
    #[serde(default)]
    pub error_tracking: Vec<TrackedError>,
}

/// One row of the conversation-history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    /// Partition key.
    pub verification_id: String,
    /// Sort key: RFC3339 timestamp.
    pub conversation_at: String,
    /// Turn status (e.g. `"TURN1_COMPLETED"`, `"WORKFLOW_COMPLETED"`).
    pub turn_status: String,
}

/// One row of the layout table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRecord {
    /// Partition key.
    pub layout_id: i64,
    /// Sort key.
    pub layout_prefix: String,
    /// The machine's physical structure.
    pub machine_structure: MachineStructure,
    /// Arbitrary additional layout metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The record store: verification, conversation-history, and layout
/// tables (§6).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up a verification record by id. Returns the most recent
    /// (highest `verification_at`) record for that id, if any.
    async fn get_verification(
        &self,
        verification_id: &str,
    ) -> Result<Option<VerificationRecord>, WorkflowError>;

    /// Create-if-absent, update-if-present. Re-running with an identical
    /// record is a no-op success (§4.3 Idempotency; §4.9 Idempotency).
    async fn upsert_verification(&self, record: VerificationRecord) -> Result<(), WorkflowError>;

    /// The most recent conversation-history row for `verification_id`,
    /// sorted descending by `conversation_at`.
    async fn latest_conversation(
        &self,
        verification_id: &str,
    ) -> Result<Option<ConversationRecord>, WorkflowError>;

    /// Update the `turn_status` of the conversation row discovered via
    /// [`Self::latest_conversation`] (the finalizer does not know the
    /// exact `conversation_at` in advance, per §9).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] if no conversation row
    /// exists for `verification_id`.
    async fn update_conversation_status(
        &self,
        verification_id: &str,
        turn_status: &str,
    ) -> Result<(), WorkflowError>;

    /// Look up a layout by composite key.
    async fn get_layout(
        &self,
        layout_id: i64,
        layout_prefix: &str,
    ) -> Result<Option<LayoutRecord>, WorkflowError>;

    /// The most recent verification whose `checking_image_url` equals
    /// `checking_image_url`, sorted descending by `verification_at`,
    /// excluding `exclude_verification_id` (§4.5's Query: a secondary
    /// index on checking image, self-match excluded to avoid a run finding
    /// itself).
    async fn find_previous_by_checking_image_url(
        &self,
        checking_image_url: &str,
        exclude_verification_id: &str,
    ) -> Result<Option<VerificationRecord>, WorkflowError>;
}

/// Filesystem-backed [`RecordStore`], used for local development, tests,
/// and the local CLI driver.
#[derive(Debug, Clone)]
pub struct FilesystemRecordStore {
    root: PathBuf,
}

impl FilesystemRecordStore {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn verification_path(&self, verification_id: &str) -> PathBuf {
        self.root.join("verifications").join(format!("{verification_id}.json"))
    }

    fn conversation_dir(&self, verification_id: &str) -> PathBuf {
        self.root.join("conversations").join(verification_id)
    }

    fn layout_path(&self, layout_id: i64, layout_prefix: &str) -> PathBuf {
        self.root.join("layouts").join(format!("{layout_id}-{layout_prefix}.json"))
    }

    async fn write_json(path: &std::path::Path, value: &impl Serialize) -> Result<(), WorkflowError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))
            })?;
        }
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| {
            WorkflowError::new(ErrorCode::ParsingError, format!("failed to serialize record: {e}"))
        })?;
        tokio::fs::write(path, bytes).await.map_err(|e| {
            vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))
        })
    }
}

#[async_trait]
impl RecordStore for FilesystemRecordStore {
    #[instrument(skip(self))]
    async fn get_verification(
        &self,
        verification_id: &str,
    ) -> Result<Option<VerificationRecord>, WorkflowError> {
        let path = self.verification_path(verification_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    WorkflowError::new(ErrorCode::ParsingError, format!("corrupt verification record: {e}"))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))),
        }
    }

    #[instrument(skip(self, record), fields(verification_id = %record.verification_id))]
    async fn upsert_verification(&self, record: VerificationRecord) -> Result<(), WorkflowError> {
        let path = self.verification_path(&record.verification_id);
        Self::write_json(&path, &record).await
    }

    #[instrument(skip(self))]
    async fn latest_conversation(
        &self,
        verification_id: &str,
    ) -> Result<Option<ConversationRecord>, WorkflowError> {
        let dir = self.conversation_dir(verification_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))),
        };

        let mut rows = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}")))?
        {
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}")))?;
            let row: ConversationRecord = serde_json::from_slice(&bytes).map_err(|e| {
                WorkflowError::new(ErrorCode::ParsingError, format!("corrupt conversation record: {e}"))
            })?;
            rows.push(row);
        }
        rows.sort_by(|a, b| b.conversation_at.cmp(&a.conversation_at));
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn update_conversation_status(
        &self,
        verification_id: &str,
        turn_status: &str,
    ) -> Result<(), WorkflowError> {
        let mut latest = self
            .latest_conversation(verification_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::new(
                    ErrorCode::ValidationError,
                    format!("no conversation record found for `{verification_id}`"),
                )
                .with_verification_id(verification_id.to_string())
            })?;
        latest.turn_status = turn_status.to_string();
        let path = self
            .conversation_dir(verification_id)
            .join(format!("{}.json", sanitize_timestamp(&latest.conversation_at)));
        Self::write_json(&path, &latest).await
    }

    #[instrument(skip(self))]
    async fn get_layout(
        &self,
        layout_id: i64,
        layout_prefix: &str,
    ) -> Result<Option<LayoutRecord>, WorkflowError> {
        let path = self.layout_path(layout_id, layout_prefix);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    WorkflowError::new(ErrorCode::ParsingError, format!("corrupt layout record: {e}"))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))),
        }
    }

    #[instrument(skip(self))]
    async fn find_previous_by_checking_image_url(
        &self,
        checking_image_url: &str,
        exclude_verification_id: &str,
    ) -> Result<Option<VerificationRecord>, WorkflowError> {
        let dir = self.root.join("verifications");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}"))),
        };

        let mut matches = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}")))?
        {
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| vvw_error::classify(ServiceHint::DynamoDb, &format!("InternalServerError: {e}")))?;
            let record: VerificationRecord = serde_json::from_slice(&bytes).map_err(|e| {
                WorkflowError::new(ErrorCode::ParsingError, format!("corrupt verification record: {e}"))
            })?;
            if record.checking_image_url == checking_image_url && record.verification_id != exclude_verification_id {
                matches.push(record);
            }
        }
        matches.sort_by(|a, b| b.verification_at.cmp(&a.verification_at));
        Ok(matches.into_iter().next())
    }
}

impl FilesystemRecordStore {
    /// Insert a conversation-history row directly, bypassing
    /// [`RecordStore::update_conversation_status`] — used by stages that
    /// create the initial row (e.g. after Turn-1 completes).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::DynamoDbError`] on I/O failure.
    pub async fn put_conversation(&self, record: &ConversationRecord) -> Result<(), WorkflowError> {
        let path = self
            .conversation_dir(&record.verification_id)
            .join(format!("{}.json", sanitize_timestamp(&record.conversation_at)));
        Self::write_json(&path, record).await
    }

    /// Insert a layout row directly — used by test fixtures and the local
    /// CLI driver to seed layout data.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::DynamoDbError`] on I/O failure.
    pub async fn put_layout(&self, record: &LayoutRecord) -> Result<(), WorkflowError> {
        let path = self.layout_path(record.layout_id, &record.layout_prefix);
        Self::write_json(&path, record).await
    }
}

fn sanitize_timestamp(timestamp: &str) -> String {
    timestamp.replace([':', '.'], "-")
}
