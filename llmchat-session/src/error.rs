use std::path::PathBuf;

use llmchat_engine::EngineError;
use thiserror::Error;

use crate::template::TemplateError;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors raised while setting up or running a chat session
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Configuration file not found: `{0}`")]
    ConfigNotFound(PathBuf),
    #[error("Configuration error: `{0}`")]
    ConfigError(#[from] config::ConfigError),
    #[error("Failed to load tokenizer from `{local}` ({local_error}) and from `{model_id}` ({remote_error})")]
    TokenizerLoadError {
        local: PathBuf,
        local_error: String,
        model_id: String,
        remote_error: String,
    },
    #[error("Hugging Face API error: `{0}`")]
    HuggingFaceError(#[from] hf_hub::api::sync::ApiError),
    #[error("Deserialize error: `{0}`")]
    DeserializeError(#[from] serde_json::Error),
    #[error("Failed to apply chat template: {0}")]
    TemplateError(#[from] TemplateError),
    #[error("Tokenizer error: `{0}`")]
    TokenizerError(#[from] tokenizers::Error),
    #[error("Generation failed: {0}")]
    EngineError(#[from] EngineError),
    #[error("IO error: `{0}`")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the error only aborts the current turn, leaving the session alive
    pub fn is_turn_error(&self) -> bool {
        matches!(
            self,
            Self::TemplateError(_) | Self::TokenizerError(_) | Self::EngineError(_)
        )
    }
}
