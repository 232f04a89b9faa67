use crate::{error::Result, tokenizer::ChatTokenizer};

/// Emitted in place of bytes that do not (yet) form a complete UTF-8 sequence
const REPLACEMENT_CHARACTER: char = '\u{FFFD}';

/// Tracks how much of a growing text has already been printed.
///
/// Lengths are counted in characters, so the delta always starts on a
/// character boundary of the current text.
#[derive(Clone, Debug, Default)]
pub struct TextDelta {
    emitted_chars: usize,
}

impl TextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of characters emitted so far
    pub fn emitted_chars(&self) -> usize {
        self.emitted_chars
    }

    /// Returns the suffix of `text` beyond the previously recorded length and
    /// records the length of `text`, or `None` if `text` did not grow.
    pub fn advance<'a>(&mut self, text: &'a str) -> Option<&'a str> {
        let mut chars = text.char_indices().skip(self.emitted_chars);
        let (start, _) = chars.next()?;
        self.emitted_chars += 1 + chars.count();
        Some(&text[start..])
    }
}

/// Per-response decoding state of a streaming generation.
///
/// The engine reports the prompt followed by every id generated so far; the
/// prompt prefix is dropped and the remaining ids are decoded into the text
/// printed so far plus a new delta.
pub struct ResponseStream {
    prompt_len: usize,
    delta: TextDelta,
    last_text: String,
}

impl ResponseStream {
    pub fn new(prompt_len: usize) -> Self {
        Self {
            prompt_len,
            delta: TextDelta::new(),
            last_text: String::new(),
        }
    }

    /// Decodes the engine's current output and returns the text to print, if any.
    ///
    /// Text ending in an incomplete multi-byte character is held back until a
    /// later step completes it.
    pub fn update(
        &mut self,
        tokenizer: &ChatTokenizer,
        output_ids: &[u32],
    ) -> Result<Option<String>> {
        if output_ids.len() <= self.prompt_len {
            return Ok(None);
        }
        let text = tokenizer.decode(&output_ids[self.prompt_len..])?;
        let delta = if text.ends_with(REPLACEMENT_CHARACTER) {
            None
        } else {
            self.delta.advance(&text).map(str::to_string)
        };
        self.last_text = text;
        Ok(delta)
    }

    /// Ends the stream, returning any held back text and the full response
    pub fn finish(mut self) -> (Option<String>, String) {
        let rest = self.delta.advance(&self.last_text).map(str::to_string);
        (rest, self.last_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tests::word_level_tokenizer,
        tokenizer::{ChatTokenizer, TokenizerConfig},
    };

    #[test]
    fn test_advance_emits_suffix() {
        let mut delta = TextDelta::new();
        assert_eq!(delta.advance(""), None);
        assert_eq!(delta.advance("Hel"), Some("Hel"));
        assert_eq!(delta.advance("Hel"), None);
        assert_eq!(delta.advance("Hello"), Some("lo"));
        assert_eq!(delta.advance("Hello, wörld"), Some(", wörld"));
        assert_eq!(delta.emitted_chars(), 12);
    }

    #[test]
    fn test_advance_concatenation_equals_last_text() {
        let texts = ["", "你", "你好", "你好", "你好,", "你好, Rust 🦀", "你好, Rust 🦀!"];
        let mut delta = TextDelta::new();
        let mut printed = String::new();
        for text in texts {
            if let Some(suffix) = delta.advance(text) {
                assert!(text.ends_with(suffix));
                printed.push_str(suffix);
            }
            assert_eq!(printed, text);
        }
        assert_eq!(delta.emitted_chars(), texts[texts.len() - 1].chars().count());
    }

    #[test]
    fn test_advance_ignores_shrinking_text() {
        let mut delta = TextDelta::new();
        assert_eq!(delta.advance("abc"), Some("abc"));
        assert_eq!(delta.advance("ab"), None);
        assert_eq!(delta.advance("abcd"), Some("d"));
    }

    #[test]
    fn test_response_stream_strips_prompt() {
        let tokenizer = ChatTokenizer::new(
            word_level_tokenizer(&["hello", "big", "world"]),
            TokenizerConfig::default(),
            None,
        );
        let prompt = tokenizer.encode("hello").unwrap();
        let big = tokenizer.encode("big").unwrap()[0];
        let world = tokenizer.encode("world").unwrap()[0];

        let mut stream = ResponseStream::new(prompt.len());
        assert_eq!(stream.update(&tokenizer, &prompt).unwrap(), None);

        let mut output = prompt.clone();
        output.push(big);
        assert_eq!(
            stream.update(&tokenizer, &output).unwrap(),
            Some("big".to_string())
        );
        output.push(world);
        assert_eq!(
            stream.update(&tokenizer, &output).unwrap(),
            Some(" world".to_string())
        );

        let (rest, response) = stream.finish();
        assert_eq!(rest, None);
        assert_eq!(response, "big world");
    }

    #[test]
    fn test_response_stream_holds_back_incomplete_characters() {
        let tokenizer = ChatTokenizer::new(
            word_level_tokenizer(&["big", "\u{FFFD}"]),
            TokenizerConfig::default(),
            None,
        );
        let big = tokenizer.encode("big").unwrap()[0];
        let partial = tokenizer.encode("\u{FFFD}").unwrap()[0];

        let mut stream = ResponseStream::new(0);
        assert_eq!(
            stream.update(&tokenizer, &[big]).unwrap(),
            Some("big".to_string())
        );
        assert_eq!(stream.update(&tokenizer, &[big, partial]).unwrap(), None);

        let (rest, response) = stream.finish();
        assert_eq!(rest, Some(" \u{FFFD}".to_string()));
        assert_eq!(response, "big \u{FFFD}");
    }

    #[test]
    fn test_finish_without_output() {
        let (rest, response) = ResponseStream::new(4).finish();
        assert_eq!(rest, None);
        assert_eq!(response, "");
    }
}
