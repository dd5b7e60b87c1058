use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Text generation backend provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    OpenAI,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }

    /// Accumulate usage from another instance
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// OpenAI-style message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A prompt prepared for one backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInput {
    pub messages: Vec<Message>,
}

impl BackendInput {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self { messages: vec![Message::user(prompt)] }
    }

    /// Concatenated message contents, used for token estimation and tests
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One interaction of a user with an item, flattened into attribute -> value.
///
/// Attribute order is the order the record was built in and is kept through
/// serialization, so rendered histories are stable across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct InteractionRecord(pub Map<String, Value>);

impl InteractionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for InteractionRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Context budget for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_context_length: usize,
    pub reserved_output_tokens: usize,
}

impl PromptBudget {
    pub fn new(max_context_length: usize, reserved_output_tokens: usize) -> Self {
        Self { max_context_length, reserved_output_tokens }
    }

    /// A prompt fits iff `tokens + reserved < max_context_length`.
    pub fn fits(&self, prompt_tokens: usize) -> bool {
        prompt_tokens.saturating_add(self.reserved_output_tokens) < self.max_context_length
    }
}

/// Profile text for one aspect of a multi-aspect profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AspectProfile {
    pub aspect: String,
    pub text: String,
}

/// Final output of a pipeline for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileOutput {
    Single(String),
    /// Per-aspect texts, in aspect declaration order
    Aspects(Vec<AspectProfile>),
}

impl ProfileOutput {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            ProfileOutput::Single(text) => Some(text),
            ProfileOutput::Aspects(_) => None,
        }
    }

    pub fn aspect(&self, name: &str) -> Option<&str> {
        match self {
            ProfileOutput::Single(_) => None,
            ProfileOutput::Aspects(aspects) => aspects
                .iter()
                .find(|a| a.aspect == name)
                .map(|a| a.text.as_str()),
        }
    }
}

/// Routing decision for one user, made once by the classifier
#[derive(Debug, Clone, PartialEq)]
pub enum UserClassification {
    SingleCall(Vec<InteractionRecord>),
    MultiCall(Vec<InteractionRecord>),
}

impl UserClassification {
    /// `count_splits == 1` routes a user through the batch path.
    pub fn from_split_count(count: usize, records: Vec<InteractionRecord>) -> Self {
        if count == 1 {
            UserClassification::SingleCall(records)
        } else {
            UserClassification::MultiCall(records)
        }
    }

    pub fn records(&self) -> &[InteractionRecord] {
        match self {
            UserClassification::SingleCall(r) | UserClassification::MultiCall(r) => r,
        }
    }

    pub fn is_single_call(&self) -> bool {
        matches!(self, UserClassification::SingleCall(_))
    }
}

/// Configuration for a profile generation run
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    /// Output tokens reserved per call; also sent as the completion limit
    pub max_output_tokens: u32,
    /// Users per batch call on the single-call path
    pub batch_size: usize,
    /// Profiles per embedding call
    pub embed_batch_size: usize,
    /// Concurrent requests inside one batch call
    pub max_concurrency: usize,
    pub backend: BackendKind,
    /// Base URL for API (optional, for custom endpoints)
    pub base_url: Option<String>,
    /// API key (optional, can use env vars)
    pub api_key: Option<String>,
    /// Overrides the backend's reported context length
    pub max_context_length: Option<usize>,
    /// Read back existing per-user outputs instead of regenerating them
    pub resume: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_output_tokens: 1024,
            batch_size: 128,
            embed_batch_size: 48,
            max_concurrency: 8,
            backend: BackendKind::default(),
            base_url: None,
            api_key: None,
            max_context_length: None,
            resume: false,
        }
    }
}

impl GenerationConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_output_tokens(mut self, n: u32) -> Self {
        self.max_output_tokens = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_embed_batch_size(mut self, n: usize) -> Self {
        self.embed_batch_size = n;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_context_length(mut self, n: usize) -> Self {
        self.max_context_length = Some(n);
        self
    }

    pub fn with_resume(mut self, v: bool) -> Self {
        self.resume = v;
        self
    }

    /// Reject settings that would make batching impossible
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::ProfileError::Config("batch_size must be positive".into()));
        }
        if self.embed_batch_size == 0 {
            return Err(crate::ProfileError::Config(
                "embed_batch_size must be positive".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(crate::ProfileError::Config(
                "max_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}
