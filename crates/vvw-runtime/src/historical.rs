//! The Historical Context Builder (C5, §4.5): for `PREVIOUS_VS_CURRENT`
//! verifications, load the prior run's record, timing, and extracted
//! structure as best-effort enrichment for the Turn-1 prompt.

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use vvw_config::WorkflowConfig;
use vvw_core::{MachineStructure, Reference, ReferenceCategory, VerificationSummary, VerificationType};
use vvw_error::WorkflowError;
use vvw_records::RecordStore;
use vvw_store::ObjectStore;

/// Everything the prompt builder needs about a prior verification. Present
/// only for `PREVIOUS_VS_CURRENT` runs that name a `previousVerificationId`
/// resolving to an existing record; absent (all-`None`/`false`) otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalContext {
    /// Whether historical context was available for this run.
    pub present: bool,
    /// The prior verification id, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    /// The prior verification's fixed `verificationAt` timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_at: Option<String>,
    /// Hours elapsed between the prior run and now, rounded to 2 places.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_since_previous: Option<f64>,
    /// Business days (Mon-Fri) elapsed between the prior run and now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_days_since_previous: Option<i64>,
    /// The prior run's final summary, best-effort loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<VerificationSummary>,
    /// The prior run's machine structure, best-effort loaded from its
    /// layout row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_machine_structure: Option<MachineStructure>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Count weekdays strictly between `start` and `end` (exclusive of `start`,
/// inclusive of `end`), skipping Saturdays and Sundays.
#[must_use]
pub fn business_days_between(start: NaiveDate, end: NaiveDate) -> i64 {
    if end <= start {
        return 0;
    }
    let mut day = start;
    let mut count = 0i64;
    while day < end {
        day = day.succ_opt().unwrap_or(day);
        if day >= end {
            day = end;
        }
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            count += 1;
        }
        if day == end {
            break;
        }
    }
    count
}

/// Run the Historical Context Builder (§4.5): for
/// [`VerificationType::PreviousVsCurrent`], query the record store for the
/// most recent verification whose `checking_image_url` equals the current
/// run's `reference_image_url` (excluding the current run itself), then
/// load its timing and (best effort) its summary and machine structure. Any
/// other verification type, or no match, comes back as
/// `HistoricalContext::default()` (`present: false`).
///
/// The query is driven by the record store's own secondary index, not by a
/// caller-supplied `previousVerificationId` — a caller cannot spoof
/// historical enrichment by naming an unrelated prior run.
///
/// # Errors
///
/// Returns the query's error (e.g. a transient `DynamoDbError`); missing
/// summary/layout blobs are swallowed and simply leave the corresponding
/// field `None`, since historical enrichment is a best-effort prompt
/// enhancement, not a correctness requirement.
pub async fn build_historical_context(
    verification_id: &str,
    verification_type: VerificationType,
    reference_image_url: &str,
    config: &WorkflowConfig,
    records: &dyn RecordStore,
    objects: &dyn ObjectStore,
) -> Result<HistoricalContext, WorkflowError> {
    if verification_type != VerificationType::PreviousVsCurrent {
        return Ok(HistoricalContext::default());
    }

    let Some(previous_record) = records
        .find_previous_by_checking_image_url(reference_image_url, verification_id)
        .await?
    else {
        tracing::warn!(verification_id, "no prior verification matches this checking image; proceeding without history");
        return Ok(HistoricalContext::default());
    };
    let previous_id = previous_record.verification_id.clone();

    let now = Utc::now();
    let (hours_since_previous, business_days_since_previous) =
        elapsed_since(&previous_record.verification_at, now);

    let previous_machine_structure = match (previous_record.layout_id, &previous_record.layout_prefix) {
        (Some(id), Some(prefix)) => records.get_layout(id, prefix).await.ok().flatten().map(|l| l.machine_structure),
        _ => None,
    };

    let previous_summary = load_previous_summary(&previous_id, config, objects).await;

    Ok(HistoricalContext {
        present: true,
        previous_verification_id: Some(previous_id),
        previous_verification_at: Some(previous_record.verification_at),
        hours_since_previous,
        business_days_since_previous,
        previous_summary,
        previous_machine_structure,
    })
}

fn elapsed_since(previous_at: &str, now: DateTime<Utc>) -> (Option<f64>, Option<i64>) {
    let Ok(previous) = DateTime::parse_from_rfc3339(previous_at) else {
        return (None, None);
    };
    let previous = previous.with_timezone(&Utc);
    let hours = round2((now - previous).num_milliseconds() as f64 / 3_600_000.0);
    let business_days = business_days_between(previous.date_naive(), now.date_naive());
    (Some(hours), Some(business_days))
}

async fn load_previous_summary(
    previous_id: &str,
    config: &WorkflowConfig,
    objects: &dyn ObjectStore,
) -> Option<VerificationSummary> {
    let partition = vvw_core::date_partition(previous_id).ok()?;
    let key = vvw_store::joined_key(&format!("{partition}/{previous_id}"), &ReferenceCategory::ResultsVerificationSummary.file_name());
    let reference = Reference { bucket: config.state_bucket.clone(), key, size: 0 };
    match vvw_store::retrieve_json(objects, &reference).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            tracing::warn!(previous_id, error = %e, "no summary available for previous verification");
            None
        }
    }
}
