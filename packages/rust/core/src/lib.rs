//! Data-enrichment engine for Fieldforge.
//!
//! Steps derive new fields from records (usually by calling a language
//! model), a [`Pipeline`] chains them and scores the result, and a
//! [`GridSearch`] sweeps pipeline parameters to find the best configuration.

pub mod export;
pub mod grid_search;
pub mod index;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod step;
pub mod steps;

pub use grid_search::{GridResult, GridSearch, expand_grid};
pub use index::{Embedder, FlatIndex};
pub use fieldforge_shared::TokenUsage;
pub use pipeline::{Evaluator, Outcome, Pipeline, PipelineStatistics};
pub use progress::{ProgressReporter, SilentProgress};
pub use prompt::{Prompt, PromptTemplate};
pub use step::{FieldSpec, Step, StepCore, StepOutput};
pub use steps::{
    Candidates, CustomStep, EmbeddingSearchStep, LlmStep, LlmStructuredCompositeStep,
    LlmStructuredStep, Postprocess, SerpEnrichmentStep, Transform,
};
