pub mod device;
pub mod llama;
pub mod weights;

use std::path::PathBuf;

use thiserror::Error;

pub use device::device;
pub use llama::{LlamaEngine, LlamaGeneration};
pub use weights::{ensure_engine_dir, EngineFiles};

/// Stream of growing output sequences produced by an [`Engine`].
///
/// Every item holds the prompt ids followed by all the ids generated so far,
/// so consecutive items only ever grow by appending.
pub type GenerationStream<'a> = Box<dyn Iterator<Item = Result<Vec<u32>, EngineError>> + 'a>;

/// A loaded model able to continue a tokenized prompt.
pub trait Engine {
    /// Starts streaming generation for `request`. The returned stream ends
    /// once `max_new_tokens` ids were produced or an end id was sampled,
    /// the end id itself is never part of the output.
    fn generate(&mut self, request: GenerationRequest)
        -> Result<GenerationStream<'_>, EngineError>;
}

/// Sampling knobs forwarded to the logits processor.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Sampling temperature, `None` means greedy decoding
    pub temperature: Option<f64>,
    /// Nucleus sampling probability mass
    pub top_p: Option<f64>,
    /// Random seed of the logits processor
    pub seed: u64,
    /// Repetition penalty, `1.0` disables it
    pub repeat_penalty: f32,
    /// Number of trailing tokens the repetition penalty looks at
    pub repeat_last_n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: None,
            top_p: None,
            seed: 42,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

/// A single-sequence generation request.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Tokenized prompt
    pub input_ids: Vec<u32>,
    /// Upper bound on the number of generated ids
    pub max_new_tokens: usize,
    /// End-of-sequence id of the tokenizer, if it declares one
    pub end_id: Option<u32>,
    /// Sampling parameters
    pub sampling: SamplingParams,
}

/// Options used to materialize an engine directory on a device.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Weight dtype, e.g. `bf16`, `f16` or `f32`
    pub dtype: String,
    /// Accelerator ordinal
    pub device_id: usize,
    /// Use flash attention kernels (requires the `flash-attn` feature)
    pub use_flash_attention: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dtype: "bf16".to_string(),
            device_id: 0,
            use_flash_attention: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine directory not found: `{0}`")]
    EngineDirNotFound(PathBuf),
    #[error("Missing engine file: `{0}`")]
    MissingFile(PathBuf),
    #[error("No safetensors weights found in `{0}`")]
    MissingWeights(PathBuf),
    #[error("Invalid weight map in `{path}`: {reason}")]
    InvalidWeightMap { path: PathBuf, reason: String },
    #[error("Invalid dtype: `{0}`")]
    InvalidDType(String),
    #[error("Empty prompt")]
    EmptyPrompt,
    #[error("Prompt of {prompt_len} tokens does not fit the context window of {max_context} tokens")]
    PromptTooLong {
        prompt_len: usize,
        max_context: usize,
    },
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle::Error),
    #[error("IO error: `{0}`")]
    IoError(#[from] std::io::Error),
    #[error("Deserialize error: `{0}`")]
    DeserializeError(#[from] serde_json::Error),
}
