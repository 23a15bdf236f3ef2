//! Typed runtime configuration over the environment variables named in §6
//! of the workflow spec, loadable from TOML with environment overrides on
//! top — the same layering `abp-config` uses for backend definitions.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a [`WorkflowConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve
/// attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended field is missing; the documented default will be
    /// used.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A timeout is unusually large.
    LargeTimeout {
        /// Field name.
        field: String,
        /// Value, in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            Self::LargeTimeout { field, secs } => {
                write!(f, "'{field}' has a large timeout ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration, covering every environment variable
/// named in §6.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Object-store bucket holding envelope state.
    pub state_bucket: String,
    /// Object-store bucket holding reference images.
    pub reference_bucket: String,
    /// Object-store bucket holding checking images.
    pub checking_bucket: String,
    /// Record-store verification table name.
    pub dynamodb_verification_table: String,
    /// Record-store layout table name.
    pub dynamodb_layout_table: String,
    /// Record-store conversation-history table name.
    pub dynamodb_conversation_table: String,
    /// Prefix prepended to allocated verification ids.
    pub verification_prefix: String,
    /// Multimodal model identifier.
    pub bedrock_model: String,
    /// Inference endpoint region.
    pub bedrock_region: String,
    /// API version string sent with inference requests.
    pub anthropic_version: String,
    /// Maximum tokens requested per turn.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Extended-thinking mode: `"enabled"` or `"disabled"`.
    pub thinking_type: String,
    /// Token budget for extended thinking, when enabled.
    pub thinking_budget_tokens: u32,
    /// Byte threshold above which image base64 is staged rather than
    /// inlined.
    pub base64_size_threshold: u64,
    /// Per-turn inference timeout, in seconds.
    pub bedrock_timeout_secs: u64,
    /// Per-stage overall timeout, in seconds.
    pub function_timeout_secs: u64,
    /// Maximum retry attempts (including the first).
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff, in seconds.
    pub retry_base_delay_secs: u64,
    /// Log level.
    pub log_level: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            state_bucket: String::new(),
            reference_bucket: String::new(),
            checking_bucket: String::new(),
            dynamodb_verification_table: String::new(),
            dynamodb_layout_table: String::new(),
            dynamodb_conversation_table: String::new(),
            verification_prefix: "verif-".to_string(),
            bedrock_model: String::new(),
            bedrock_region: String::new(),
            anthropic_version: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            thinking_type: "disabled".to_string(),
            thinking_budget_tokens: 16000,
            base64_size_threshold: 1_048_576,
            bedrock_timeout_secs: 120,
            function_timeout_secs: 240,
            retry_max_attempts: 3,
            retry_base_delay_secs: 1,
            log_level: "INFO".to_string(),
        }
    }
}

const VALID_LOG_LEVELS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
const VALID_THINKING_TYPES: &[&str] = &["enabled", "disabled"];
const LARGE_TIMEOUT_THRESHOLD_SECS: u64 = 600;

/// Load configuration from an optional TOML file, then apply environment
/// overrides.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<WorkflowConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|_| ConfigError::FileNotFound { path: p.display().to_string() })?;
            parse_toml(&content)?
        }
        None => WorkflowConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`WorkflowConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed TOML.
pub fn parse_toml(content: &str) -> Result<WorkflowConfig, ConfigError> {
    toml::from_str::<WorkflowConfig>(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

/// Apply the environment variables named in §6 over `config`, in place.
pub fn apply_env_overrides(config: &mut WorkflowConfig) {
    macro_rules! str_override {
        ($var:literal, $field:expr) => {
            if let Ok(val) = std::env::var($var) {
                $field = val;
            }
        };
    }
    macro_rules! parsed_override {
        ($var:literal, $field:expr) => {
            if let Ok(val) = std::env::var($var) {
                if let Ok(parsed) = val.parse() {
                    $field = parsed;
                }
            }
        };
    }

    str_override!("STATE_BUCKET", config.state_bucket);
    str_override!("REFERENCE_BUCKET", config.reference_bucket);
    str_override!("CHECKING_BUCKET", config.checking_bucket);
    str_override!("DYNAMODB_VERIFICATION_TABLE", config.dynamodb_verification_table);
    str_override!("DYNAMODB_LAYOUT_TABLE", config.dynamodb_layout_table);
    str_override!("DYNAMODB_CONVERSATION_TABLE", config.dynamodb_conversation_table);
    str_override!("VERIFICATION_PREFIX", config.verification_prefix);
    str_override!("BEDROCK_MODEL", config.bedrock_model);
    str_override!("BEDROCK_REGION", config.bedrock_region);
    str_override!("ANTHROPIC_VERSION", config.anthropic_version);
    parsed_override!("MAX_TOKENS", config.max_tokens);
    parsed_override!("TEMPERATURE", config.temperature);
    str_override!("THINKING_TYPE", config.thinking_type);
    parsed_override!("THINKING_BUDGET_TOKENS", config.thinking_budget_tokens);
    parsed_override!("BASE64_SIZE_THRESHOLD", config.base64_size_threshold);
    parsed_override!("BEDROCK_TIMEOUT", config.bedrock_timeout_secs);
    parsed_override!("FUNCTION_TIMEOUT", config.function_timeout_secs);
    parsed_override!("RETRY_MAX_ATTEMPTS", config.retry_max_attempts);
    parsed_override!("RETRY_BASE_DELAY", config.retry_base_delay_secs);
    str_override!("LOG_LEVEL", config.log_level);
}

/// Validate a loaded configuration, returning advisory warnings.
///
/// Hard errors (invalid enum values, zero timeouts/attempts) are returned
/// as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if any hard constraint is
/// violated.
pub fn validate_config(config: &WorkflowConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }
    if !VALID_THINKING_TYPES.contains(&config.thinking_type.as_str()) {
        errors.push(format!("invalid thinking_type '{}'", config.thinking_type));
    }
    if config.thinking_type == "enabled" && config.thinking_budget_tokens == 0 {
        errors.push("thinking_budget_tokens must be > 0 when thinking_type is 'enabled'".to_string());
    }
    if config.max_tokens == 0 {
        errors.push("max_tokens must be > 0".to_string());
    }
    if config.retry_max_attempts == 0 {
        errors.push("retry_max_attempts must be > 0".to_string());
    }
    if config.function_timeout_secs == 0 {
        errors.push("function_timeout_secs must be > 0".to_string());
    }

    if config.state_bucket.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "state_bucket".into(),
            hint: "stage I/O will fail until STATE_BUCKET is set".into(),
        });
    }
    if config.bedrock_timeout_secs > LARGE_TIMEOUT_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "bedrock_timeout_secs".into(),
            secs: config.bedrock_timeout_secs,
        });
    }
    if config.function_timeout_secs > LARGE_TIMEOUT_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "function_timeout_secs".into(),
            secs: config.function_timeout_secs,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}
