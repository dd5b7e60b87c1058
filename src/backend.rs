//! Capability interfaces for text generation and embedding backends.
//!
//! The rest of the crate depends only on these traits; concrete backends are
//! resolved once at startup from [`BackendKind`].

use crate::error::Result;
use crate::openai::OpenAiBackend;
use crate::types::{BackendInput, BackendKind, GenerationConfig};

/// A bounded-context text generator
pub trait TextGenerator {
    /// Wrap a rendered prompt into the backend's input shape
    fn prepare_input(&self, prompt: &str) -> BackendInput {
        BackendInput::user(prompt)
    }

    /// Generate one text per input, in submission order
    fn describe_batch(
        &self,
        inputs: &[BackendInput],
        max_output_tokens: Option<u32>,
    ) -> Result<Vec<String>>;

    /// Generate a single text
    fn describe(&self, input: &BackendInput, max_output_tokens: Option<u32>) -> Result<String> {
        let mut outputs = self.describe_batch(std::slice::from_ref(input), max_output_tokens)?;
        if outputs.len() != 1 {
            return Err(crate::ProfileError::BatchSizeMismatch {
                expected: 1,
                actual: outputs.len(),
            });
        }
        Ok(outputs.remove(0))
    }

    /// Token length of a prepared input
    fn tokens_length(&self, input: &BackendInput) -> usize;

    /// Maximum context length of the model
    fn max_context_length(&self) -> usize;
}

/// A text embedding backend
pub trait Embedder {
    /// One vector per text, in submission order
    fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Resolve the configured backend into a concrete generator
pub fn build_generator(config: &GenerationConfig) -> Result<Box<dyn TextGenerator>> {
    match config.backend {
        BackendKind::OpenAI => Ok(Box::new(OpenAiBackend::new(config)?)),
    }
}

/// Resolve the configured backend into a concrete embedder
pub fn build_embedder(config: &GenerationConfig, model: &str) -> Result<Box<dyn Embedder>> {
    match config.backend {
        BackendKind::OpenAI => Ok(Box::new(OpenAiBackend::new(config)?.with_embedding_model(model))),
    }
}

impl<T: TextGenerator + ?Sized> TextGenerator for Box<T> {
    fn prepare_input(&self, prompt: &str) -> BackendInput {
        (**self).prepare_input(prompt)
    }

    fn describe_batch(
        &self,
        inputs: &[BackendInput],
        max_output_tokens: Option<u32>,
    ) -> Result<Vec<String>> {
        (**self).describe_batch(inputs, max_output_tokens)
    }

    fn tokens_length(&self, input: &BackendInput) -> usize {
        (**self).tokens_length(input)
    }

    fn max_context_length(&self) -> usize {
        (**self).max_context_length()
    }
}

impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embeddings(texts)
    }
}

/// Scripted backends for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Counts one token per character and answers with a numbered echo.
    ///
    /// Every call is recorded so tests can assert on the exact prompts sent.
    /// Can be scripted to fail after a number of calls or to answer short.
    pub struct FakeGenerator {
        pub max_context: usize,
        pub calls: RefCell<Vec<Vec<String>>>,
        counter: Cell<usize>,
        respond: Box<dyn Fn(&str, usize) -> String>,
        fail_after: Option<usize>,
        drop_last: bool,
    }

    impl FakeGenerator {
        pub fn new(max_context: usize) -> Self {
            Self::with_responder(max_context, |_, n| format!("profile-{}", n))
        }

        pub fn with_responder(
            max_context: usize,
            respond: impl Fn(&str, usize) -> String + 'static,
        ) -> Self {
            Self {
                max_context,
                calls: RefCell::new(Vec::new()),
                counter: Cell::new(0),
                respond: Box::new(respond),
                fail_after: None,
                drop_last: false,
            }
        }

        /// Every call after the first `calls` successful ones returns a backend error
        pub fn failing_after(mut self, calls: usize) -> Self {
            self.fail_after = Some(calls);
            self
        }

        /// Answer every batch with one output fewer than requested
        pub fn dropping_last(mut self) -> Self {
            self.drop_last = true;
            self
        }

        /// Number of `describe_batch` round-trips
        pub fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }

        /// Every prompt sent, flattened across calls
        pub fn prompts(&self) -> Vec<String> {
            self.calls.borrow().iter().flatten().cloned().collect()
        }
    }

    impl TextGenerator for FakeGenerator {
        fn describe_batch(
            &self,
            inputs: &[BackendInput],
            _max_output_tokens: Option<u32>,
        ) -> Result<Vec<String>> {
            if self.fail_after.is_some_and(|n| self.call_count() >= n) {
                return Err(crate::ProfileError::Backend("scripted failure".into()));
            }
            let prompts: Vec<String> = inputs.iter().map(|i| i.text()).collect();
            let mut outputs: Vec<String> = prompts
                .iter()
                .map(|p| {
                    let n = self.counter.get() + 1;
                    self.counter.set(n);
                    (self.respond)(p, n)
                })
                .collect();
            if self.drop_last {
                outputs.pop();
            }
            self.calls.borrow_mut().push(prompts);
            Ok(outputs)
        }

        fn tokens_length(&self, input: &BackendInput) -> usize {
            input.text().chars().count()
        }

        fn max_context_length(&self) -> usize {
            self.max_context
        }
    }

    /// Returns `[len, index]` vectors and records batch sizes
    #[derive(Default)]
    pub struct FakeEmbedder {
        pub batches: RefCell<Vec<usize>>,
        /// Answer with one vector fewer than requested
        pub drop_last: bool,
    }

    impl Embedder for FakeEmbedder {
        fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.borrow_mut().push(texts.len());
            let mut vectors: Vec<Vec<f32>> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| vec![t.len() as f32, i as f32])
                .collect();
            if self.drop_last {
                vectors.pop();
            }
            Ok(vectors)
        }
    }
}
