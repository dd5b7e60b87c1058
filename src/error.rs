use thiserror::Error;

/// Profile generation error types
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("OpenAI API error: {0}")]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No users to generate profiles for")]
    NoUsers,

    #[error("User {0} is not present in the dataset")]
    UnknownUser(String),

    #[error("User {user_id} interacted with unknown item {item_id}")]
    UnknownItem { user_id: String, item_id: String },

    #[error("User {user_id} has no interaction field '{field}'")]
    MissingInteractionField { user_id: String, field: String },

    #[error("Invalid prompt template: {0}")]
    Template(String),

    #[error("Backend returned {actual} outputs for {expected} inputs")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for profile generation
pub type Result<T> = std::result::Result<T, ProfileError>;
