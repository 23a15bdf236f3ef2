//! The Turn Executor (C6, §4.6): assemble a multimodal request for one
//! conversation turn and invoke the inference backend under a
//! deadline-aware retry policy.

use base64::Engine;
use std::time::Duration;
use vvw_backend_core::{
    ContentBlock, ImageSource, InferenceBackend, InferenceConfig, InferenceRequest, InferenceResponse, Message,
};
use vvw_config::WorkflowConfig;
use vvw_error::{ErrorCode, WorkflowError};
use vvw_retry::{RetryPolicy, TimeoutConfig};

/// Which turn of the two-turn conversation is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnNumber {
    /// The initial extraction/validation turn.
    One,
    /// The follow-up turn, informed by Turn-1's processed result.
    Two,
}

/// The inputs the Turn Executor assembles into an [`InferenceRequest`].
#[derive(Debug, Clone)]
pub struct TurnInputs {
    /// System prompt.
    pub system_prompt: String,
    /// User-role text content for this turn.
    pub user_text: String,
    /// The checking image, already staged per the inline/staged policy.
    pub checking_image: ImageSource,
    /// The reference image, for `LAYOUT_VS_CHECKING` turns.
    pub reference_image: Option<ImageSource>,
    /// Image encoding shared by both images (`"jpeg"` or `"png"`).
    pub image_format: String,
}

/// Apply the hybrid inline/staged image-delivery policy (§4.6 "Image
/// delivery"): inline as base64 when `bytes.len() <= threshold`, otherwise
/// require a pre-staged object key.
///
/// # Errors
///
/// Returns [`ErrorCode::ValidationError`] if the image exceeds `threshold`
/// and no `staged_key` was supplied.
pub fn stage_image(bytes: &[u8], staged_key: Option<&str>, threshold: u64) -> Result<ImageSource, WorkflowError> {
    if bytes.len() as u64 <= threshold {
        Ok(ImageSource { bytes: Some(base64::engine::general_purpose::STANDARD.encode(bytes)), staged_key: None })
    } else {
        match staged_key {
            Some(key) => Ok(ImageSource { bytes: None, staged_key: Some(key.to_string()) }),
            None => Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!("image of {} bytes exceeds the {threshold}-byte inline threshold and no staged key was supplied", bytes.len()),
            )),
        }
    }
}

fn build_request(inputs: &TurnInputs, config: &WorkflowConfig) -> InferenceRequest {
    let mut content = vec![ContentBlock::Text { text: inputs.user_text.clone() }];
    content.push(ContentBlock::Image {
        format: inputs.image_format.clone(),
        source: inputs.checking_image.clone(),
    });
    if let Some(reference) = &inputs.reference_image {
        content.push(ContentBlock::Image { format: inputs.image_format.clone(), source: reference.clone() });
    }

    InferenceRequest {
        messages: vec![Message { role: "user".to_string(), content }],
        system: inputs.system_prompt.clone(),
        inference_config: InferenceConfig {
            max_tokens: config.max_tokens,
            temperature: Some(config.temperature),
            top_p: None,
            stop_sequences: vec![],
        },
    }
}

/// Run the Turn Executor (§4.6): build the request for `inputs` and invoke
/// `backend`, retrying transient failures per `config`'s retry settings
/// until `remaining_invocation_time` (or the per-stage timeout) is
/// exhausted.
///
/// # Errors
///
/// Returns [`ErrorCode::BedrockError`] on an unretryable or exhausted
/// backend failure, or [`ErrorCode::TimeoutError`] if the deadline elapses.
pub async fn execute_turn(
    turn: TurnNumber,
    inputs: TurnInputs,
    config: &WorkflowConfig,
    backend: &dyn InferenceBackend,
    remaining_invocation_time: Option<Duration>,
) -> Result<InferenceResponse, WorkflowError> {
    let timeout = TimeoutConfig {
        stage_timeout: Duration::from_secs(config.bedrock_timeout_secs),
        remaining_invocation_time,
    };
    let deadline = timeout.effective_deadline();

    let policy = RetryPolicy::builder()
        .max_attempts(config.retry_max_attempts)
        .base_delay(Duration::from_secs(config.retry_base_delay_secs))
        .build();

    let request = build_request(&inputs, config);
    tracing::info!(?turn, max_tokens = config.max_tokens, "invoking inference backend");

    policy.retry(deadline, || backend.invoke(request.clone(), deadline)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vvw_backend_core::Usage;

    struct FlakyBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl InferenceBackend for FlakyBackend {
        async fn invoke(&self, _request: InferenceRequest, _deadline: Duration) -> Result<InferenceResponse, WorkflowError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(WorkflowError::new(ErrorCode::BedrockError, "ThrottlingException").retryable(true))
            } else {
                Ok(InferenceResponse {
                    content: "## Row A\n- Status: Full".to_string(),
                    stop_reason: "end_turn".to_string(),
                    model_id: "mock-model".to_string(),
                    usage: Usage::default(),
                    latency_ms: 5,
                })
            }
        }
    }

    fn sample_inputs() -> TurnInputs {
        TurnInputs {
            system_prompt: "you are a vending machine inspector".to_string(),
            user_text: "describe the shelf".to_string(),
            checking_image: ImageSource { bytes: Some("YWJj".to_string()), staged_key: None },
            reference_image: None,
            image_format: "jpeg".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_backend_failure_then_succeeds() {
        let backend = FlakyBackend { calls: AtomicU32::new(0) };
        let mut config = WorkflowConfig::default();
        config.retry_base_delay_secs = 0;
        let response = execute_turn(TurnNumber::One, sample_inputs(), &config, &backend, None).await.unwrap();
        assert_eq!(response.content, "## Row A\n- Status: Full");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stage_image_inlines_small_bytes() {
        let source = stage_image(b"tiny", None, 1024).unwrap();
        assert!(source.bytes.is_some());
        assert!(source.staged_key.is_none());
    }

    #[test]
    fn stage_image_requires_staged_key_above_threshold() {
        let err = stage_image(&[0u8; 16], None, 4).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[test]
    fn stage_image_accepts_staged_key_above_threshold() {
        let source = stage_image(&[0u8; 16], Some("staged/key.jpg"), 4).unwrap();
        assert_eq!(source.staged_key.as_deref(), Some("staged/key.jpg"));
        assert!(source.bytes.is_none());
    }
}
