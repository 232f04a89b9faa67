use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use llmchat_engine::{EngineOptions, SamplingParams};
use serde::{Deserialize, Serialize};

use crate::{error::Result, template::ChatTemplate, ChatError};

/// Prefix of the environment variables overriding configuration values,
/// e.g. `LLMCHAT_MAX_NEW_TOKENS=512`
pub const ENV_PREFIX: &str = "LLMCHAT";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant running locally on RTX 50 series hardware.";

/// Configuration of the chat client, read from a YAML file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatConfig {
    /// Hugging Face repository the tokenizer is fetched from when the local
    /// model directory cannot provide one
    pub model_id: String,

    /// Revision of `model_id`
    #[serde(default = "default_revision")]
    pub revision: String,

    /// The first entry of every conversation
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Maximum number of tokens generated per response
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature, greedy decoding when unset
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Nucleus sampling probability mass
    #[serde(default)]
    pub top_p: Option<f64>,

    /// Seed of the sampler
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    /// Dtype the engine weights are loaded with
    #[serde(default = "default_dtype")]
    pub dtype: String,

    #[serde(default)]
    pub device_id: usize,

    #[serde(default)]
    pub use_flash_attention: bool,

    /// Forces a chat template family instead of detecting it from the tokenizer
    #[serde(default)]
    pub chat_template: Option<ChatTemplate>,

    /// Inputs that end the session, compared case-insensitively
    #[serde(default = "default_exit_words")]
    pub exit_words: Vec<String>,
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_new_tokens() -> usize {
    2048
}

fn default_seed() -> u64 {
    42
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_repeat_last_n() -> usize {
    64
}

fn default_dtype() -> String {
    "bf16".to_string()
}

fn default_exit_words() -> Vec<String> {
    vec!["exit".to_string(), "quit".to_string(), "離開".to_string()]
}

impl ChatConfig {
    /// A configuration for `model_id` with every other value at its default
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: default_revision(),
            system_prompt: default_system_prompt(),
            max_new_tokens: default_max_new_tokens(),
            temperature: None,
            top_p: None,
            seed: default_seed(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            dtype: default_dtype(),
            device_id: 0,
            use_flash_attention: false,
            chat_template: None,
            exit_words: default_exit_words(),
        }
    }

    /// Creates a new `ChatConfig` from a YAML configuration file, with
    /// `LLMCHAT_*` environment variables taking precedence over the file.
    ///
    /// # Errors
    ///
    /// * `ChatError::ConfigNotFound` - if no file exists at `config_file_path`
    /// * `ChatError::ConfigError` - if the file cannot be parsed or lacks `model_id`
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self> {
        let config_file_path = config_file_path.as_ref();
        if !config_file_path.is_file() {
            return Err(ChatError::ConfigNotFound(config_file_path.to_path_buf()));
        }
        let builder = Config::builder()
            .add_source(File::from(config_file_path).format(FileFormat::Yaml))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
        let config = builder.build()?;
        Ok(config.try_deserialize::<Self>()?)
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            dtype: self.dtype.clone(),
            device_id: self.device_id,
            use_flash_attention: self.use_flash_attention,
        }
    }
}
