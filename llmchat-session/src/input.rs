use std::{
    io::{self, BufRead},
    sync::mpsc::{self, Receiver, Sender},
    thread,
};

use tracing::trace;

/// Something that happened at the prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// A line typed by the user, including its line terminator if any
    Line(String),
    /// End of input
    Eof,
    /// The user pressed Ctrl-C
    Interrupt,
}

/// Source of the events a chat session reacts to
pub trait InputSource {
    /// Blocks until the next event is available
    fn next_event(&mut self) -> io::Result<InputEvent>;
}

impl<R: BufRead> InputSource for R {
    fn next_event(&mut self) -> io::Result<InputEvent> {
        let mut line = String::new();
        if self.read_line(&mut line)? == 0 {
            return Ok(InputEvent::Eof);
        }
        Ok(InputEvent::Line(line))
    }
}

pub type EventSender = Sender<io::Result<InputEvent>>;

/// Input events delivered over a channel, so that lines read on one thread
/// and interrupts raised on another reach the session in order.
pub struct ChannelInput {
    events: Receiver<io::Result<InputEvent>>,
}

impl ChannelInput {
    pub fn new() -> (EventSender, Self) {
        let (sender, events) = mpsc::channel();
        (sender, Self { events })
    }

    /// Reads lines from `reader` on a background thread. The returned sender
    /// injects further events, e.g. interrupts.
    pub fn spawn_reader<R>(mut reader: R) -> io::Result<(EventSender, Self)>
    where
        R: BufRead + Send + 'static,
    {
        let (sender, input) = Self::new();
        let lines = sender.clone();
        thread::Builder::new()
            .name("input-reader".to_string())
            .spawn(move || loop {
                let event = reader.next_event();
                let done = !matches!(event, Ok(InputEvent::Line(_)));
                if lines.send(event).is_err() || done {
                    trace!("Input reader finished");
                    break;
                }
            })?;
        Ok((sender, input))
    }
}

impl InputSource for ChannelInput {
    fn next_event(&mut self) -> io::Result<InputEvent> {
        // Every sender is gone, nothing can arrive anymore
        self.events.recv().unwrap_or(Ok(InputEvent::Eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buf_read_events() {
        let mut input = "hello\nworld".as_bytes();
        assert_eq!(
            input.next_event().unwrap(),
            InputEvent::Line("hello\n".to_string())
        );
        assert_eq!(
            input.next_event().unwrap(),
            InputEvent::Line("world".to_string())
        );
        assert_eq!(input.next_event().unwrap(), InputEvent::Eof);
    }

    #[test]
    fn test_reader_thread_forwards_lines() {
        let (_interrupts, mut input) = ChannelInput::spawn_reader("a\nb\n".as_bytes()).unwrap();
        assert_eq!(input.next_event().unwrap(), InputEvent::Line("a\n".to_string()));
        assert_eq!(input.next_event().unwrap(), InputEvent::Line("b\n".to_string()));
        assert_eq!(input.next_event().unwrap(), InputEvent::Eof);
    }

    #[test]
    fn test_injected_events_and_disconnect() {
        let (sender, mut input) = ChannelInput::new();
        sender.send(Ok(InputEvent::Interrupt)).unwrap();
        sender
            .send(Err(io::ErrorKind::InvalidData.into()))
            .unwrap();
        drop(sender);

        assert_eq!(input.next_event().unwrap(), InputEvent::Interrupt);
        assert_eq!(
            input.next_event().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        assert_eq!(input.next_event().unwrap(), InputEvent::Eof);
    }
}
