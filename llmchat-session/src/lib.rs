pub mod config;
pub mod error;
pub mod history;
pub mod input;
pub mod session;
pub mod stream;
pub mod template;
pub mod tokenizer;


pub use config::ChatConfig;
pub use error::ChatError;
pub use history::{Conversation, Message, Role};
pub use input::{ChannelInput, InputEvent, InputSource};
pub use session::ChatSession;
pub use template::ChatTemplate;
pub use tokenizer::{hub_api, ChatTokenizer};
