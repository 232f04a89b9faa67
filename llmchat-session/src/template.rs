use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{Message, Role};

const LLAMA3_BOS: &str = "<|begin_of_text|>";
/// Knowledge cutoff and default `date_string` of the Llama 3.1 system block
const LLAMA31_PREAMBLE: &str = "Cutting Knowledge Date: December 2023\nToday Date: 26 Jul 2024\n\n";
/// Only present in the Llama 3.1 template, which always opens with a system block
const LLAMA31_MARKER: &str = "Cutting Knowledge Date";
const LLAMA2_BOS: &str = "<s>";
const LLAMA2_EOS: &str = "</s>";
const ZEPHYR_EOS: &str = "</s>";

/// Chat template families recognized from a tokenizer's Jinja `chat_template`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// `<|start_header_id|>role<|end_header_id|>` headers, as used by Llama 3
    Llama3,
    /// Llama 3 headers with a system block that always carries the knowledge
    /// cutoff and date lines
    #[serde(rename = "llama3.1", alias = "llama31")]
    Llama31,
    /// `<|im_start|>role ... <|im_end|>` blocks
    ChatMl,
    /// `[INST] ... [/INST]` with an inlined `<<SYS>>` block
    Llama2,
    /// `<|user|>` / `<|assistant|>` role tags
    Zephyr,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("The tokenizer does not define a chat template")]
    Missing,
    #[error("Unrecognized chat template")]
    Unrecognized,
    #[error("Conversation roles must alternate user/assistant/user/assistant/...")]
    RolesMustAlternate,
}

impl ChatTemplate {
    /// Detects the template family from the Jinja source of a chat template
    pub fn detect(source: &str) -> Option<Self> {
        if source.contains("<|start_header_id|>") && source.contains(LLAMA31_MARKER) {
            Some(Self::Llama31)
        } else if source.contains("<|start_header_id|>") {
            Some(Self::Llama3)
        } else if source.contains("<|im_start|>") {
            Some(Self::ChatMl)
        } else if source.contains("[INST]") {
            Some(Self::Llama2)
        } else if source.contains("<|user|>") {
            Some(Self::Zephyr)
        } else {
            None
        }
    }

    /// Renders `messages` into a prompt string. With `add_generation_prompt`
    /// the prompt ends with the header that opens an assistant response.
    pub fn render(
        &self,
        messages: &[&Message],
        add_generation_prompt: bool,
    ) -> Result<String, TemplateError> {
        let mut prompt = String::new();
        match self {
            Self::Llama3 => {
                prompt.push_str(LLAMA3_BOS);
                for message in messages {
                    prompt.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        message.role.as_str(),
                        message.content.trim()
                    ));
                }
                if add_generation_prompt {
                    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            Self::Llama31 => {
                let (system, turns) = match messages.split_first() {
                    Some((first, rest)) if first.role == Role::System => {
                        (first.content.trim(), rest)
                    }
                    _ => ("", messages),
                };
                prompt.push_str(LLAMA3_BOS);
                prompt.push_str(&format!(
                    "<|start_header_id|>system<|end_header_id|>\n\n{LLAMA31_PREAMBLE}{system}<|eot_id|>"
                ));
                for message in turns {
                    prompt.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        message.role.as_str(),
                        message.content.trim()
                    ));
                }
                if add_generation_prompt {
                    prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            Self::ChatMl => {
                for message in messages {
                    prompt.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        message.role.as_str(),
                        message.content
                    ));
                }
                if add_generation_prompt {
                    prompt.push_str("<|im_start|>assistant\n");
                }
            }
            Self::Llama2 => {
                let (system, turns) = match messages.split_first() {
                    Some((first, rest)) if first.role == Role::System => {
                        (Some(first.content.as_str()), rest)
                    }
                    _ => (None, messages),
                };
                for (index, message) in turns.iter().enumerate() {
                    let expected = if index % 2 == 0 {
                        Role::User
                    } else {
                        Role::Assistant
                    };
                    if message.role != expected {
                        return Err(TemplateError::RolesMustAlternate);
                    }
                    let content = match system {
                        Some(system) if index == 0 => {
                            format!("<<SYS>>\n{system}\n<</SYS>>\n\n{}", message.content)
                        }
                        _ => message.content.clone(),
                    };
                    match message.role {
                        Role::User => prompt.push_str(&format!(
                            "{LLAMA2_BOS}[INST] {} [/INST]",
                            content.trim()
                        )),
                        _ => prompt.push_str(&format!(" {} {LLAMA2_EOS}", content.trim())),
                    }
                }
            }
            Self::Zephyr => {
                for message in messages {
                    prompt.push_str(&format!(
                        "<|{}|>\n{}{ZEPHYR_EOS}\n",
                        message.role.as_str(),
                        message.content
                    ));
                }
                if add_generation_prompt {
                    prompt.push_str("<|assistant|>\n");
                }
            }
        }
        Ok(prompt)
    }
}
