pub mod base;
pub mod openai;

pub use base::{ChatProvider, ChatRequest, Message, RetryConfig};
pub use openai::OpenAIProvider;
