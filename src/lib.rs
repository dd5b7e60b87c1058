//! # profilegen - Context-budgeted user profile generation
//!
//! Turns long user interaction histories into natural-language profiles
//! with a bounded-context LLM, recursively splitting histories that do not
//! fit and merging the partial profiles back together.

pub mod error;
pub mod types;

pub mod backend;
pub mod openai;
pub mod prompts;

pub mod checkpoint;
pub mod classifier;
pub mod dataset;
pub mod embedding;
pub mod executor;
pub mod pipeline;
pub mod splitter;
pub mod store;

// Re-exports
pub use backend::{build_embedder, build_generator, Embedder, TextGenerator};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use classifier::Classifier;
pub use dataset::{Dataset, Item, JsonDataset};
pub use embedding::{EmbeddingBatcher, Embeddings};
pub use error::{ProfileError, Result};
pub use executor::{OutputWriter, ProfileGenerator, Profiles};
pub use openai::OpenAiBackend;
pub use pipeline::{Pipeline, Strategy};
pub use prompts::PromptSet;
pub use splitter::Splitter;
pub use types::{
    AspectProfile, BackendInput, BackendKind, GenerationConfig, InteractionRecord, Message,
    ProfileOutput, PromptBudget, Role, Usage, UserClassification,
};
