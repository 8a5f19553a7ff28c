//! External collaborators: model providers, pricing, and search.
//!
//! This crate provides:
//! - [`LlmClient`]: the provider contract, plus [`OpenAiCompatibleClient`]
//! - [`ProviderRegistry`]: model routing and pricing, injected into steps
//! - [`SearchClient`]: search-engine enrichment, plus [`SerperClient`]

pub mod llm;
pub mod openai;
pub mod pricing;
pub mod search;

pub use llm::{
    ChatMessage, Completion, CompletionRequest, Content, LlmClient, LlmResponse, ProviderRegistry,
};
pub use openai::OpenAiCompatibleClient;
pub use pricing::PricingTable;
pub use search::{SearchClient, SerperClient};
