use std::{io::Write, iter};

use llmchat_engine::{Engine, GenerationRequest, SamplingParams};
use tracing::{error, info, info_span, instrument, trace, Span};

use crate::{
    config::ChatConfig,
    error::Result,
    history::{Conversation, Message},
    input::{InputEvent, InputSource},
    stream::ResponseStream,
    tokenizer::ChatTokenizer,
};

/// Prompt printed before reading a user message
pub const USER_PROMPT: &str = "You > ";
/// Prefix of every streamed assistant response
pub const ASSISTANT_PROMPT: &str = "Assistant > ";
/// Printed when the session ends
pub const GOODBYE: &str = "Goodbye!";

/// A single-user terminal chat session over an [`Engine`].
pub struct ChatSession<E> {
    /// The engine responses are generated with
    engine: E,
    /// Tokenizer and chat template
    tokenizer: ChatTokenizer,
    /// History of the session, starting with the system prompt
    conversation: Conversation,
    /// Generation limit per response
    max_new_tokens: usize,
    sampling: SamplingParams,
    /// Lowercased sentinel messages ending the session
    exit_words: Vec<String>,
    span: Span,
}

impl<E: Engine> ChatSession<E> {
    /// Constructor
    pub fn new(engine: E, tokenizer: ChatTokenizer, config: &ChatConfig) -> Self {
        info!(
            eos_token_id = ?tokenizer.eos_token_id(),
            pad_token_id = ?tokenizer.pad_token_id(),
            chat_template = ?tokenizer.chat_template(),
            "Starting chat session"
        );
        Self {
            engine,
            tokenizer,
            conversation: Conversation::new(config.system_prompt.clone()),
            max_new_tokens: config.max_new_tokens,
            sampling: config.sampling(),
            exit_words: config
                .exit_words
                .iter()
                .map(|word| word.to_lowercase())
                .collect(),
            span: info_span!("chat-session"),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Whether the whole message, ignoring case, is an exit word
    fn is_exit_word(&self, line: &str) -> bool {
        let line = line.to_lowercase();
        self.exit_words.iter().any(|word| *word == line)
    }

    /// Reads user messages from `input` until end of input, an interrupt or
    /// an exit word, streaming every response to `output`.
    ///
    /// Failures of a single turn are logged and the session continues. I/O
    /// errors on `input` or `output` end the session with an error.
    pub fn run<I: InputSource, W: Write>(&mut self, mut input: I, mut output: W) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        trace!("Starting chat loop");

        loop {
            write!(output, "{USER_PROMPT}")?;
            output.flush()?;

            let line = match input.next_event()? {
                InputEvent::Line(line) => line,
                event => {
                    info!(?event, "Input closed");
                    writeln!(output, "\n{GOODBYE}")?;
                    break;
                }
            };
            let user_input = line.trim_end_matches(['\r', '\n']);

            if user_input.trim().is_empty() {
                continue;
            }
            if self.is_exit_word(user_input) {
                writeln!(output, "{GOODBYE}")?;
                break;
            }

            match self.respond(user_input, &mut output) {
                Ok(_) => {}
                Err(e) if e.is_turn_error() => {
                    error!(error = %e, "Failed to answer user message");
                }
                Err(e) => return Err(e),
            }
        }

        info!(num_turns = self.conversation.num_turns(), "Chat session ended");
        Ok(())
    }

    /// Answers a single user message, streaming the response to `output`.
    ///
    /// The turn is recorded in the conversation only once the response is
    /// complete; on failure the history is left untouched.
    #[instrument(level = "debug", skip_all)]
    pub fn respond<W: Write>(&mut self, user_input: &str, output: &mut W) -> Result<String> {
        let user = Message::user(user_input);
        let messages = self.conversation.messages().iter().chain(iter::once(&user));
        let prompt = self.tokenizer.apply_chat_template(messages, true)?;
        let input_ids = self.tokenizer.encode(&prompt)?;
        let prompt_len = input_ids.len();
        trace!(prompt_len, "Encoded prompt");

        write!(output, "{ASSISTANT_PROMPT}")?;
        output.flush()?;

        let request = GenerationRequest {
            input_ids,
            max_new_tokens: self.max_new_tokens,
            end_id: self.tokenizer.eos_token_id(),
            sampling: self.sampling.clone(),
        };
        let mut stream = ResponseStream::new(prompt_len);
        let generation = self.stream_response(request, &mut stream, output);
        let (rest, response) = stream.finish();
        if let Some(rest) = rest {
            write!(output, "{rest}")?;
        }
        writeln!(output)?;
        output.flush()?;
        generation?;

        self.conversation
            .record_turn(user, Message::assistant(response.clone()));
        Ok(response)
    }

    fn stream_response<W: Write>(
        &mut self,
        request: GenerationRequest,
        stream: &mut ResponseStream,
        output: &mut W,
    ) -> Result<()> {
        for output_ids in self.engine.generate(request)? {
            if let Some(delta) = stream.update(&self.tokenizer, &output_ids?)? {
                write!(output, "{delta}")?;
                output.flush()?;
            }
        }
        Ok(())
    }
}
