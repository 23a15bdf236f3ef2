//! The multimodal inference backend trait and request/response contract
//! (§4.6), the seam a production deployment would fill with a real
//! Bedrock-style client.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vvw_error::WorkflowError;

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// An inlined or staged image.
    Image {
        /// Image encoding (`"jpeg"` or `"png"`).
        format: String,
        /// Where the image bytes live.
        source: ImageSource,
    },
}

/// Where an image's bytes are found, per the hybrid inline/staged policy
/// (§4.6 "Image delivery").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Base64-encoded bytes, when inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    /// A staged reference (object-store key), when the blob exceeds
    /// `base64SizeThreshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_key: Option<String>,
}

/// One message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Always `"user"` for the request side of this contract.
    pub role: String,
    /// The message's content blocks.
    pub content: Vec<ContentBlock>,
}

/// Sampling/inference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Sequences that stop generation.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

/// A full request to the multimodal endpoint (§4.6 "Request shape").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    /// The conversation so far.
    pub messages: Vec<Message>,
    /// System prompt.
    pub system: String,
    /// Sampling/inference configuration.
    pub inference_config: InferenceConfig,
}

/// Token accounting returned with a response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Total tokens (input + output).
    pub total_tokens: u32,
    /// Tokens spent on extended thinking, if enabled.
    #[serde(default)]
    pub thinking_tokens: u32,
}

/// A full response from the multimodal endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    /// The model's free-form text content.
    pub content: String,
    /// Why generation stopped (e.g. `"end_turn"`, `"max_tokens"`).
    pub stop_reason: String,
    /// Model identifier that served the request.
    pub model_id: String,
    /// Token accounting.
    pub usage: Usage,
    /// Round-trip latency, in milliseconds.
    pub latency_ms: u64,
}

/// The multimodal inference backend the Turn Executor invokes against.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Invoke the model with `request`, respecting `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`vvw_error::ErrorCode::BedrockError`] on a classified
    /// backend failure, or [`vvw_error::ErrorCode::TimeoutError`] if
    /// `deadline` elapses first.
    async fn invoke(
        &self,
        request: InferenceRequest,
        deadline: Duration,
    ) -> Result<InferenceResponse, WorkflowError>;
}
