//! A mock [`InferenceBackend`] for local development and unit tests. It
//! does not call any real multimodal endpoint.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use vvw_backend_core::{InferenceBackend, InferenceRequest, InferenceResponse, Usage};
use vvw_error::{ErrorCode, WorkflowError};

/// Canned backend that always returns the same response text.
#[derive(Debug, Clone)]
pub struct MockInferenceBackend {
    response_text: String,
    model_id: String,
}

impl Default for MockInferenceBackend {
    fn default() -> Self {
        Self {
            response_text: "This is a mock inference backend. It does not call any real model."
                .to_string(),
            model_id: "mock-model".to_string(),
        }
    }
}

impl MockInferenceBackend {
    /// Build a mock backend that always returns `response_text`.
    #[must_use]
    pub fn with_response(response_text: impl Into<String>) -> Self {
        Self { response_text: response_text.into(), ..Self::default() }
    }
}

#[async_trait]
impl InferenceBackend for MockInferenceBackend {
    async fn invoke(
        &self,
        request: InferenceRequest,
        _deadline: Duration,
    ) -> Result<InferenceResponse, WorkflowError> {
        let input_tokens = request.system.split_whitespace().count() as u32;
        let output_tokens = self.response_text.split_whitespace().count() as u32;
        Ok(InferenceResponse {
            content: self.response_text.clone(),
            stop_reason: "end_turn".to_string(),
            model_id: self.model_id.clone(),
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                thinking_tokens: 0,
            },
            latency_ms: 1,
        })
    }
}

/// A scripted backend that returns a fixed sequence of responses (one per
/// call), then errors — useful for exercising Turn-1/Turn-2 with distinct
/// canned text, or for simulating a transient-then-success retry scenario.
pub struct ScriptedInferenceBackend {
    responses: Mutex<std::collections::VecDeque<Result<String, WorkflowError>>>,
    model_id: String,
}

impl ScriptedInferenceBackend {
    /// Build a backend that replays `script` in order, one entry per call.
    #[must_use]
    pub fn new(script: Vec<Result<String, WorkflowError>>) -> Self {
        Self {
            responses: Mutex::new(script.into()),
            model_id: "mock-model".to_string(),
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedInferenceBackend {
    async fn invoke(
        &self,
        _request: InferenceRequest,
        _deadline: Duration,
    ) -> Result<InferenceResponse, WorkflowError> {
        let next = self.responses.lock().expect("mock backend mutex poisoned").pop_front();
        let Some(next) = next else {
            return Err(WorkflowError::new(ErrorCode::InternalError, "scripted backend exhausted"));
        };
        let content = next?;
        let output_tokens = content.split_whitespace().count() as u32;
        Ok(InferenceResponse {
            content,
            stop_reason: "end_turn".to_string(),
            model_id: self.model_id.clone(),
            usage: Usage { input_tokens: 0, output_tokens, total_tokens: output_tokens, thinking_tokens: 0 },
            latency_ms: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vvw_backend_core::{InferenceConfig, Message};

    fn request() -> InferenceRequest {
        InferenceRequest {
            messages: vec![Message { role: "user".into(), content: vec![] }],
            system: "system prompt text".into(),
            inference_config: InferenceConfig { max_tokens: 100, temperature: None, top_p: None, stop_sequences: vec![] },
        }
    }

    #[tokio::test]
    async fn mock_backend_returns_canned_text() {
        let backend = MockInferenceBackend::default();
        let response = backend.invoke(request(), Duration::from_secs(1)).await.unwrap();
        assert!(response.content.contains("mock inference backend"));
    }

    #[tokio::test]
    async fn scripted_backend_replays_in_order_then_exhausts() {
        let backend = ScriptedInferenceBackend::new(vec![Ok("first".into()), Ok("second".into())]);
        let r1 = backend.invoke(request(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(r1.content, "first");
        let r2 = backend.invoke(request(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(r2.content, "second");
        let err = backend.invoke(request(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn scripted_backend_can_simulate_transient_failure() {
        let backend = ScriptedInferenceBackend::new(vec![
            Err(WorkflowError::new(ErrorCode::BedrockError, "ThrottlingException").retryable(true)),
            Ok("recovered".into()),
        ]);
        assert!(backend.invoke(request(), Duration::from_secs(1)).await.is_err());
        let ok = backend.invoke(request(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(ok.content, "recovered");
    }
}
