//! Text-generation backends.
//!
//! Pipeline stages only see the [`TextGenerator`] trait. The crate ships
//! [`ChatCompletionsClient`] for OpenAI-compatible APIs and a blended-rate
//! cost estimator.
//!
//! ```ignore
//! use review_forge::llm::{ChatCompletionsClient, GenerationRequest, Message, TextGenerator};
//!
//! let client = ChatCompletionsClient::openai(std::env::var("OPENAI_API_KEY").ok())?;
//! let request = GenerationRequest::new("gpt-4o-mini", vec![Message::user("Summarize this diff")]);
//! let response = client.generate(request).await?;
//! ```

pub mod client;
pub mod cost;

pub use client::{
    ChatCompletionsClient, Choice, GenerationRequest, GenerationResponse, Message, TextGenerator,
    Usage, ANTHROPIC_API_BASE, OPENAI_API_BASE,
};
pub use cost::{estimate_cost_usd, price_per_1k};
