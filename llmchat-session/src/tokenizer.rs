use std::path::{Path, PathBuf};

use hf_hub::{
    api::sync::{Api, ApiBuilder},
    Repo, RepoType,
};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    history::Message,
    template::{ChatTemplate, TemplateError},
    ChatError,
};

/// Serialized `tokenizers` tokenizer
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Tokenizer metadata: chat template and special tokens
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// A special token as it appears in `tokenizer_config.json`, either a bare
/// string or an added-token object.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    pub fn content(&self) -> &str {
        match self {
            Self::Text(content) => content,
            Self::Added { content } => content,
        }
    }
}

/// A named entry of a multi-template `chat_template` list
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NamedChatTemplate {
    pub name: String,
    pub template: String,
}

/// The Jinja source of a tokenizer's chat template
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChatTemplateSource {
    Single(String),
    Named(Vec<NamedChatTemplate>),
}

impl ChatTemplateSource {
    /// The template used for plain chat: the only one, or the one named `default`
    pub fn default_source(&self) -> Option<&str> {
        match self {
            Self::Single(source) => Some(source),
            Self::Named(templates) => templates
                .iter()
                .find(|t| t.name == "default")
                .map(|t| t.template.as_str()),
        }
    }
}

/// The subset of `tokenizer_config.json` the chat client relies on
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub chat_template: Option<ChatTemplateSource>,
    #[serde(default)]
    pub eos_token: Option<SpecialToken>,
    #[serde(default)]
    pub pad_token: Option<SpecialToken>,
}

impl TokenizerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// A tokenizer together with the chat metadata needed to build prompts
/// and stop generation.
#[derive(Clone, Debug)]
pub struct ChatTokenizer {
    tokenizer: Tokenizer,
    template: std::result::Result<ChatTemplate, TemplateError>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl ChatTokenizer {
    /// Builds a `ChatTokenizer` from a tokenizer and its metadata. A
    /// `template_override` takes precedence over the template detected from
    /// `config`. Without a pad token the eos token is used for padding.
    pub fn new(
        tokenizer: Tokenizer,
        config: TokenizerConfig,
        template_override: Option<ChatTemplate>,
    ) -> Self {
        let template = match (template_override, &config.chat_template) {
            (Some(template), _) => Ok(template),
            (None, None) => Err(TemplateError::Missing),
            (None, Some(source)) => source
                .default_source()
                .and_then(ChatTemplate::detect)
                .ok_or(TemplateError::Unrecognized),
        };
        let token_id = |token: &Option<SpecialToken>| {
            token
                .as_ref()
                .and_then(|token| tokenizer.token_to_id(token.content()))
        };
        let eos_token_id = token_id(&config.eos_token);
        let pad_token_id = match token_id(&config.pad_token) {
            Some(id) => Some(id),
            None => {
                debug!(?eos_token_id, "No pad token, falling back to the eos token");
                eos_token_id
            }
        };

        Self {
            tokenizer,
            template,
            eos_token_id,
            pad_token_id,
        }
    }

    /// Loads the tokenizer from `model_dir`, falling back to the Hugging Face
    /// repository `model_id` when the local directory cannot provide it.
    ///
    /// # Errors
    ///
    /// * `ChatError::TokenizerLoadError` - if both sources fail
    #[instrument(
        level = "info",
        skip(model_dir, hub, template_override),
        fields(model_dir = %model_dir.display())
    )]
    pub fn load(
        model_dir: &Path,
        hub: &Api,
        model_id: &str,
        revision: &str,
        template_override: Option<ChatTemplate>,
    ) -> Result<Self> {
        let local_error = match Self::from_dir(model_dir, template_override) {
            Ok(tokenizer) => {
                info!("Loaded tokenizer from local directory");
                return Ok(tokenizer);
            }
            Err(e) => e,
        };
        warn!(
            error = %local_error,
            "Failed to load tokenizer from local directory, downloading it from Hugging Face"
        );

        match Self::from_hub(hub, model_id, revision, template_override) {
            Ok(tokenizer) => {
                info!("Loaded tokenizer from Hugging Face");
                Ok(tokenizer)
            }
            Err(remote_error) => Err(ChatError::TokenizerLoadError {
                local: model_dir.to_path_buf(),
                local_error: local_error.to_string(),
                model_id: model_id.to_string(),
                remote_error: remote_error.to_string(),
            }),
        }
    }

    /// Loads `tokenizer.json` and, when present, `tokenizer_config.json` from a directory
    pub fn from_dir(model_dir: &Path, template_override: Option<ChatTemplate>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(model_dir.join(TOKENIZER_FILE))?;
        let config_path = model_dir.join(TOKENIZER_CONFIG_FILE);
        let config = if config_path.is_file() {
            TokenizerConfig::from_file(config_path)?
        } else {
            warn!("No {TOKENIZER_CONFIG_FILE} in {}", model_dir.display());
            TokenizerConfig::default()
        };
        Ok(Self::new(tokenizer, config, template_override))
    }

    /// Fetches `tokenizer.json` and `tokenizer_config.json` from the Hugging Face hub,
    /// reusing files already present in the hub cache
    pub fn from_hub(
        hub: &Api,
        model_id: &str,
        revision: &str,
        template_override: Option<ChatTemplate>,
    ) -> Result<Self> {
        let repo = hub.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let tokenizer_filename: PathBuf = repo.get(TOKENIZER_FILE)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)?;
        let config = match repo.get(TOKENIZER_CONFIG_FILE) {
            Ok(path) => TokenizerConfig::from_file(path)?,
            Err(e) => {
                warn!(error = %e, "Failed to fetch {TOKENIZER_CONFIG_FILE}");
                TokenizerConfig::default()
            }
        };
        Ok(Self::new(tokenizer, config, template_override))
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    /// The template prompts are rendered with, if one is available
    pub fn chat_template(&self) -> Option<ChatTemplate> {
        self.template.as_ref().ok().copied()
    }

    /// Renders `messages` with the tokenizer's chat template
    pub fn apply_chat_template<'a, I>(
        &self,
        messages: I,
        add_generation_prompt: bool,
    ) -> Result<String>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let template = self.template.clone()?;
        let messages = messages.into_iter().collect::<Vec<_>>();
        Ok(template.render(&messages, add_generation_prompt)?)
    }

    /// Encodes a rendered prompt. Special tokens are not added, the chat
    /// template already carries them.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.tokenizer.encode(text, false)?.get_ids().to_vec())
    }

    /// Decodes `ids`, skipping special tokens
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.tokenizer.decode(ids, true)?)
    }
}

/// Client for the Hugging Face hub, authenticated with `hf_token` if given
pub fn hub_api(hf_token: Option<String>) -> Result<Api> {
    Ok(ApiBuilder::new()
        .with_progress(true)
        .with_token(hf_token)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{word_level_tokenizer, word_level_tokenizer_json, EOS};
    use tempfile::tempdir;

    const LLAMA3_TEMPLATE: &str = "{{- bos_token }}{%- for message in messages %}{{- '<|start_header_id|>' + message['role'] + '<|end_header_id|>\\n\\n' + message['content'] | trim + '<|eot_id|>' }}{%- endfor %}";

    /// A hub client whose endpoint refuses connections, so only files already
    /// in `cache_dir` can be fetched
    fn offline_hub(cache_dir: PathBuf) -> Api {
        ApiBuilder::new()
            .with_endpoint("http://127.0.0.1:1".to_string())
            .with_cache_dir(cache_dir)
            .with_token(None)
            .with_retries(0)
            .with_progress(false)
            .build()
            .unwrap()
    }

    fn config(json: &str) -> TokenizerConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_tokenizer_config_formats() {
        let parsed = config(&format!(
            r#"{{"chat_template": {}, "eos_token": "{EOS}", "pad_token": null, "model_max_length": 8192}}"#,
            serde_json::to_string(LLAMA3_TEMPLATE).unwrap()
        ));
        assert_eq!(
            parsed.chat_template.as_ref().and_then(|t| t.default_source()),
            Some(LLAMA3_TEMPLATE)
        );
        assert_eq!(parsed.eos_token, Some(SpecialToken::Text(EOS.to_string())));
        assert_eq!(parsed.pad_token, None);

        let parsed = config(
            r#"{"chat_template": [{"name": "tool_use", "template": "x"}, {"name": "default", "template": "<|im_start|>"}],
                "eos_token": {"content": "</s>", "lstrip": false, "special": true}}"#,
        );
        assert_eq!(
            parsed.chat_template.as_ref().and_then(|t| t.default_source()),
            Some("<|im_start|>")
        );
        assert_eq!(parsed.eos_token.unwrap().content(), "</s>");
    }

    #[test]
    fn test_pad_falls_back_to_eos() {
        let tokenizer = word_level_tokenizer(&["hello"]);
        let chat = ChatTokenizer::new(
            tokenizer.clone(),
            config(&format!(r#"{{"eos_token": "{EOS}"}}"#)),
            None,
        );
        let eos = tokenizer.token_to_id(EOS);
        assert!(eos.is_some());
        assert_eq!(chat.eos_token_id(), eos);
        assert_eq!(chat.pad_token_id(), eos);

        let chat = ChatTokenizer::new(
            tokenizer.clone(),
            config(&format!(r#"{{"eos_token": "{EOS}", "pad_token": "hello"}}"#)),
            None,
        );
        assert_eq!(chat.pad_token_id(), tokenizer.token_to_id("hello"));

        let chat = ChatTokenizer::new(tokenizer, TokenizerConfig::default(), None);
        assert_eq!(chat.eos_token_id(), None);
        assert_eq!(chat.pad_token_id(), None);
    }

    #[test]
    fn test_template_selection() {
        let tokenizer = word_level_tokenizer(&["hello"]);
        let messages = [Message::system("sys"), Message::user("hello")];

        let missing = ChatTokenizer::new(tokenizer.clone(), TokenizerConfig::default(), None);
        assert!(matches!(
            missing.apply_chat_template(&messages, true),
            Err(ChatError::TemplateError(TemplateError::Missing))
        ));

        let unrecognized = ChatTokenizer::new(
            tokenizer.clone(),
            config(r#"{"chat_template": "{{ messages }}"}"#),
            None,
        );
        assert!(matches!(
            unrecognized.apply_chat_template(&messages, true),
            Err(ChatError::TemplateError(TemplateError::Unrecognized))
        ));

        let overridden = ChatTokenizer::new(
            tokenizer.clone(),
            config(r#"{"chat_template": "{{ messages }}"}"#),
            Some(ChatTemplate::ChatMl),
        );
        assert_eq!(overridden.chat_template(), Some(ChatTemplate::ChatMl));

        let detected = ChatTokenizer::new(
            tokenizer,
            TokenizerConfig {
                chat_template: Some(ChatTemplateSource::Single(LLAMA3_TEMPLATE.to_string())),
                ..Default::default()
            },
            None,
        );
        let prompt = detected.apply_chat_template(&messages, true).unwrap();
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>system"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_encode_decode_skips_special_tokens() {
        let chat = ChatTokenizer::new(
            word_level_tokenizer(&["hello", "world"]),
            config(&format!(r#"{{"eos_token": "{EOS}"}}"#)),
            None,
        );
        let ids = chat.encode(&format!("hello world {EOS}")).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids.last().copied(), chat.eos_token_id());
        assert_eq!(chat.decode(&ids).unwrap(), "hello world");
    }

    #[test]
    fn test_load_from_local_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(TOKENIZER_FILE),
            word_level_tokenizer_json(&["hello"]),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(TOKENIZER_CONFIG_FILE),
            r#"{"chat_template": "<|im_start|>", "eos_token": "</s>"}"#,
        )
        .unwrap();

        let hub = offline_hub(dir.path().join("hub"));
        let chat = ChatTokenizer::load(dir.path(), &hub, "unused/model", "main", None).unwrap();
        assert_eq!(chat.chat_template(), Some(ChatTemplate::ChatMl));
        assert!(chat.eos_token_id().is_some());
    }

    #[test]
    fn test_from_dir_without_tokenizer_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(TOKENIZER_FILE),
            word_level_tokenizer_json(&["hello"]),
        )
        .unwrap();

        let chat = ChatTokenizer::from_dir(dir.path(), Some(ChatTemplate::Llama3)).unwrap();
        assert_eq!(chat.chat_template(), Some(ChatTemplate::Llama3));
        assert_eq!(chat.eos_token_id(), None);

        let empty = tempdir().unwrap();
        assert!(ChatTokenizer::from_dir(empty.path(), None).is_err());
    }

    #[test]
    fn test_load_falls_back_to_hub() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("hub");
        let snapshot = cache_dir.join("models--test--tiny/snapshots/0123abcd");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::create_dir_all(cache_dir.join("models--test--tiny/refs")).unwrap();
        std::fs::write(cache_dir.join("models--test--tiny/refs/main"), "0123abcd").unwrap();
        std::fs::write(
            snapshot.join(TOKENIZER_FILE),
            word_level_tokenizer_json(&["hello"]),
        )
        .unwrap();

        // The local directory has no tokenizer, the cached hub snapshot does
        let model_dir = dir.path().join("model_download");
        let hub = offline_hub(cache_dir);
        let chat = ChatTokenizer::load(&model_dir, &hub, "test/tiny", "main", None).unwrap();
        assert_eq!(chat.encode("hello").unwrap().len(), 1);
        assert_eq!(chat.chat_template(), None);
    }

    #[test]
    fn test_load_fails_when_both_sources_fail() {
        let dir = tempdir().unwrap();
        let model_dir = dir.path().join("model_download");
        let hub = offline_hub(dir.path().join("hub"));

        let err = ChatTokenizer::load(&model_dir, &hub, "test/tiny", "main", None).unwrap_err();
        assert!(!err.is_turn_error());
        match err {
            ChatError::TokenizerLoadError {
                local, model_id, ..
            } => {
                assert_eq!(local, model_dir);
                assert_eq!(model_id, "test/tiny");
            }
            e => panic!("Unexpected error: {e}"),
        }
    }
}
