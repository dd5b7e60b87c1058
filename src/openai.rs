use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
    },
    Client,
};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backend::{Embedder, TextGenerator};
use crate::error::{ProfileError, Result};
use crate::types::{BackendInput, GenerationConfig, Message, Role, Usage};

/// Context window of the default chat models
pub const DEFAULT_MAX_CONTEXT_LENGTH: usize = 128_000;

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Characters per token used by the length estimate
const CHARS_PER_TOKEN: usize = 3;

/// Per-message framing tokens (role, separators)
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Rough token count of a message list.
///
/// Deliberately pessimistic: a prompt judged to fit must really fit.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| m.content.chars().count().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS)
        .sum()
}

fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>> {
    messages
        .iter()
        .map(|m| {
            Ok(match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
            })
        })
        .collect()
}

/// OpenAI-compatible chat and embedding backend.
///
/// Exposes a blocking interface over a private tokio runtime. Batch calls
/// fan out up to `max_concurrency` requests and reassemble the outputs in
/// submission order.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    runtime: Runtime,
    model: String,
    embedding_model: String,
    temperature: f32,
    max_concurrency: usize,
    max_context_length: usize,
    usage: Mutex<Usage>,
}

impl OpenAiBackend {
    /// Create a backend from the run configuration
    ///
    /// Reads OPENAI_API_KEY from environment unless a key is configured.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        let mut openai_config = OpenAIConfig::new();
        if let Some(url) = &config.base_url {
            openai_config = openai_config.with_api_base(url);
        }
        if let Some(key) = &config.api_key {
            openai_config = openai_config.with_api_key(key);
        }
        let runtime = Runtime::new()?;
        Ok(Self {
            client: Client::with_config(openai_config),
            runtime,
            model: config.model.clone(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            temperature: config.temperature,
            max_concurrency: config.max_concurrency,
            max_context_length: config.max_context_length.unwrap_or(DEFAULT_MAX_CONTEXT_LENGTH),
            usage: Mutex::new(Usage::default()),
        })
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Token usage accumulated over every chat call so far
    pub fn usage(&self) -> Usage {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn build_request(
        &self,
        input: &BackendInput,
        max_output_tokens: Option<u32>,
    ) -> Result<CreateChatCompletionRequest> {
        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder
            .model(&self.model)
            .messages(to_request_messages(&input.messages)?)
            .temperature(self.temperature);

        if let Some(max_tokens) = max_output_tokens {
            request_builder.max_tokens(max_tokens);
        }

        Ok(request_builder.build()?)
    }
}

impl TextGenerator for OpenAiBackend {
    fn describe_batch(
        &self,
        inputs: &[BackendInput],
        max_output_tokens: Option<u32>,
    ) -> Result<Vec<String>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let requests = inputs
            .iter()
            .map(|input| self.build_request(input, max_output_tokens))
            .collect::<Result<Vec<_>>>()?;
        let expected = requests.len();

        let responses = self.runtime.block_on(async {
            let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
            let mut tasks = JoinSet::new();
            for (index, request) in requests.into_iter().enumerate() {
                let client = self.client.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| ProfileError::Backend(e.to_string()))?;
                    let response = client.chat().create(request).await?;
                    Ok::<_, ProfileError>((index, response))
                });
            }

            let mut responses = Vec::with_capacity(expected);
            while let Some(joined) = tasks.join_next().await {
                let result = joined.map_err(|e| ProfileError::Backend(e.to_string()))?;
                responses.push(result?);
            }
            Ok::<_, ProfileError>(responses)
        })?;

        let mut outputs: Vec<Option<String>> = vec![None; expected];
        let mut batch_usage = Usage::default();
        for (index, response) in responses {
            if let Some(usage) = &response.usage {
                batch_usage.add(&Usage::new(
                    usage.prompt_tokens as u64,
                    usage.completion_tokens as u64,
                ));
            }
            let content = response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            outputs[index] = Some(content);
        }
        if let Ok(mut total) = self.usage.lock() {
            total.add(&batch_usage);
        }
        tracing::debug!(
            requests = expected,
            input_tokens = batch_usage.input_tokens,
            output_tokens = batch_usage.output_tokens,
            "chat batch completed"
        );

        let actual = outputs.iter().filter(|o| o.is_some()).count();
        if actual != expected {
            return Err(ProfileError::BatchSizeMismatch { expected, actual });
        }
        Ok(outputs.into_iter().flatten().collect())
    }

    fn tokens_length(&self, input: &BackendInput) -> usize {
        estimate_tokens(&input.messages)
    }

    fn max_context_length(&self) -> usize {
        self.max_context_length
    }
}

impl Embedder for OpenAiBackend {
    fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .input(texts.to_vec())
            .build()?;

        let response = self
            .runtime
            .block_on(async { self.client.embeddings().create(request).await })?;

        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);
        if data.len() != texts.len() {
            return Err(ProfileError::BatchSizeMismatch {
                expected: texts.len(),
                actual: data.len(),
            });
        }
        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_counts_chars_and_overhead() {
        let messages = vec![Message::user("abcdefg")];
        assert_eq!(estimate_tokens(&messages), 3 + MESSAGE_OVERHEAD_TOKENS);
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_context_length_override() {
        let config = GenerationConfig::default()
            .with_api_key("test")
            .with_max_context_length(32_000);
        let backend = OpenAiBackend::new(&config).unwrap();
        assert_eq!(backend.max_context_length(), 32_000);

        let backend = OpenAiBackend::new(&GenerationConfig::default().with_api_key("test")).unwrap();
        assert_eq!(backend.max_context_length(), DEFAULT_MAX_CONTEXT_LENGTH);
    }
}
