use std::{path::Path, str::FromStr, time::Instant};

use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::llama::{self as model, Cache, Config, LlamaConfig, LlamaEosToks},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    device, Engine, EngineError, EngineFiles, EngineOptions, GenerationRequest, GenerationStream,
};

/// A Llama family model loaded from an engine directory with candle.
pub struct LlamaEngine {
    device: Device,
    model: model::Llama,
    config: Config,
    dtype: DType,
}

impl LlamaEngine {
    /// Loads `config.json` and the safetensors weights of `engine_dir` onto the
    /// device selected by `options`.
    #[instrument(level = "info", skip_all, fields(engine_dir = %engine_dir.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(
        engine_dir: P,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        info!("Loading Llama engine ...");
        let start = Instant::now();

        let files = EngineFiles::discover(engine_dir)?;
        let dtype = DType::from_str(&options.dtype)
            .map_err(|_| EngineError::InvalidDType(options.dtype.clone()))?;
        let device = device(options.device_id)?;

        let use_flash_attention = if options.use_flash_attention && !cfg!(feature = "flash-attn") {
            warn!("Flash attention requested but the `flash-attn` feature is disabled, ignoring");
            false
        } else {
            options.use_flash_attention
        };

        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(&files.config)?)?;
        let config = config.into_config(use_flash_attention);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = model::Llama::load(vb, &config)?;
        info!("Loaded Llama engine in {:?}", start.elapsed());

        Ok(Self {
            device,
            model,
            config,
            dtype,
        })
    }

    /// Maximum number of positions (prompt plus generated ids) the model supports
    pub fn max_context(&self) -> usize {
        self.config.max_position_embeddings
    }
}

impl Engine for LlamaEngine {
    fn generate(
        &mut self,
        request: GenerationRequest,
    ) -> Result<GenerationStream<'_>, EngineError> {
        Ok(Box::new(LlamaGeneration::new(self, request)?))
    }
}

/// Streaming generation over a [`LlamaEngine`], one sampled id per iteration.
pub struct LlamaGeneration<'a> {
    engine: &'a LlamaEngine,
    cache: Cache,
    logits_processor: LogitsProcessor,
    tokens: Vec<u32>,
    prompt_len: usize,
    index_pos: usize,
    max_new_tokens: usize,
    end_ids: Vec<u32>,
    repeat_penalty: f32,
    repeat_last_n: usize,
    started: Instant,
    finished: bool,
}

impl<'a> LlamaGeneration<'a> {
    fn new(engine: &'a LlamaEngine, request: GenerationRequest) -> Result<Self, EngineError> {
        let GenerationRequest {
            input_ids,
            max_new_tokens,
            end_id,
            sampling,
        } = request;

        let max_new_tokens =
            generation_budget(input_ids.len(), max_new_tokens, engine.max_context())?;
        let cache = Cache::new(true, engine.dtype, &engine.config, &engine.device)?;
        let logits_processor =
            LogitsProcessor::new(sampling.seed, sampling.temperature, sampling.top_p);

        Ok(Self {
            engine,
            cache,
            logits_processor,
            prompt_len: input_ids.len(),
            tokens: input_ids,
            index_pos: 0,
            max_new_tokens,
            end_ids: end_ids(end_id, engine.config.eos_token_id.as_ref()),
            repeat_penalty: sampling.repeat_penalty,
            repeat_last_n: sampling.repeat_last_n,
            started: Instant::now(),
            finished: false,
        })
    }

    fn num_generated(&self) -> usize {
        self.tokens.len() - self.prompt_len
    }

    /// Runs one forward pass and samples the next id, `None` on an end id
    fn step(&mut self) -> Result<Option<u32>, EngineError> {
        let (context_size, context_index) = if self.num_generated() > 0 {
            (1, self.index_pos)
        } else {
            (self.tokens.len(), 0)
        };
        let ctxt = &self.tokens[self.tokens.len().saturating_sub(context_size)..];
        let input = Tensor::new(ctxt, &self.engine.device)?.unsqueeze(0)?;
        let logits = self
            .engine
            .model
            .forward(&input, context_index, &mut self.cache)?;
        let logits = logits.squeeze(0)?;
        let logits = if self.repeat_penalty == 1. {
            logits
        } else {
            let start_at = self.tokens.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &self.tokens[start_at..],
            )?
        };
        self.index_pos += ctxt.len();

        let next_token = self.logits_processor.sample(&logits)?;
        if self.end_ids.contains(&next_token) {
            return Ok(None);
        }
        self.tokens.push(next_token);
        Ok(Some(next_token))
    }

    fn finish(&mut self) {
        self.finished = true;
        let dt = self.started.elapsed();
        let generated = self.num_generated();
        debug!(
            "{generated} tokens generated ({} token/s)",
            generated as f64 / dt.as_secs_f64(),
        );
    }
}

impl Iterator for LlamaGeneration<'_> {
    type Item = Result<Vec<u32>, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.num_generated() >= self.max_new_tokens {
            self.finish();
            return None;
        }
        match self.step() {
            Ok(Some(_)) => Some(Ok(self.tokens.clone())),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Number of ids that may be generated after a prompt of `prompt_len` ids,
/// bounded by the model's context window.
fn generation_budget(
    prompt_len: usize,
    max_new_tokens: usize,
    max_context: usize,
) -> Result<usize, EngineError> {
    if prompt_len == 0 {
        return Err(EngineError::EmptyPrompt);
    }
    if prompt_len >= max_context {
        return Err(EngineError::PromptTooLong {
            prompt_len,
            max_context,
        });
    }
    let budget = max_new_tokens.min(max_context - prompt_len);
    if budget < max_new_tokens {
        warn!(
            prompt_len,
            max_new_tokens, budget, "Clamping generation to the remaining context window"
        );
    }
    Ok(budget)
}

/// The tokenizer's end id followed by the end ids declared by the model config
fn end_ids(end_id: Option<u32>, config_eos: Option<&LlamaEosToks>) -> Vec<u32> {
    let mut ids: Vec<u32> = end_id.into_iter().collect();
    let config_ids = match config_eos {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    };
    for id in config_ids {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}
