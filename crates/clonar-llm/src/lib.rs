//! Model-backed collaborators: an OpenAI-compatible HTTP client that plans,
//! classifies, embeds, rewrites and answers, plus scripted mocks for tests.

pub mod client;
pub mod mock;
pub mod prompts;

pub use client::{ChatClient, ChatOptions};
pub use mock::{MockAnswerGenerator, MockClassifier, MockEmbedder, MockReply, ScriptedModel};
