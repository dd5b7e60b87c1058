//! Batches finished profile texts through an [`Embedder`].

use std::collections::BTreeMap;

use crate::backend::Embedder;
use crate::error::{ProfileError, Result};

pub const DEFAULT_EMBED_BATCH_SIZE: usize = 48;

/// User id -> embedding vector
pub type Embeddings = BTreeMap<String, Vec<f32>>;

/// Parallel id and text lists for one embedding call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileBatch {
    pub user_ids: Vec<String>,
    pub texts: Vec<String>,
}

impl ProfileBatch {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Drop blank profiles and cut the rest into batches of `batch_size`, in input order
pub fn divide_into_batches<'a, I>(profiles: I, batch_size: usize) -> Vec<ProfileBatch>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current = ProfileBatch::default();
    for (user_id, text) in profiles {
        if text.trim().is_empty() {
            tracing::debug!(user_id, "skipping blank profile");
            continue;
        }
        current.user_ids.push(user_id.to_string());
        current.texts.push(text.to_string());
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct EmbeddingBatcher<'a, E: Embedder + ?Sized> {
    embedder: &'a E,
    batch_size: usize,
}

impl<'a, E: Embedder + ?Sized> EmbeddingBatcher<'a, E> {
    pub fn new(embedder: &'a E, batch_size: usize) -> Self {
        Self { embedder, batch_size }
    }

    /// One embedding call per batch; vectors are matched to ids by position
    pub fn embed<'p, I>(&self, profiles: I) -> Result<Embeddings>
    where
        I: IntoIterator<Item = (&'p str, &'p str)>,
    {
        let batches = divide_into_batches(profiles, self.batch_size);
        let total = batches.len();
        let mut embeddings = Embeddings::new();
        for (i, batch) in batches.into_iter().enumerate() {
            tracing::info!(batch = i + 1, total, profiles = batch.len(), "embedding batch");
            let vectors = self.embedder.embeddings(&batch.texts)?;
            if vectors.len() != batch.len() {
                return Err(ProfileError::BatchSizeMismatch {
                    expected: batch.len(),
                    actual: vectors.len(),
                });
            }
            embeddings.extend(batch.user_ids.into_iter().zip(vectors));
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeEmbedder;

    #[test]
    fn test_hundred_profiles_make_three_calls() {
        let profiles: Vec<(String, String)> = (0..100)
            .map(|i| (format!("u{}", i), format!("profile {}", i)))
            .collect();
        let embedder = FakeEmbedder::default();
        let batcher = EmbeddingBatcher::new(&embedder, DEFAULT_EMBED_BATCH_SIZE);

        let embeddings = batcher
            .embed(profiles.iter().map(|(id, text)| (id.as_str(), text.as_str())))
            .unwrap();

        assert_eq!(*embedder.batches.borrow(), vec![48, 48, 4]);
        assert_eq!(embeddings.len(), 100);
        // u50 is the third entry of the second batch
        assert_eq!(embeddings["u50"], vec!["profile 50".len() as f32, 2.0]);
        assert_eq!(embeddings["u99"][1], 3.0);
    }

    #[test]
    fn test_blank_profiles_are_skipped() {
        let profiles = [("a", "likes noir"), ("b", "   "), ("c", ""), ("d", "likes jazz")];
        let batches = divide_into_batches(profiles, 48);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].user_ids, vec!["a", "d"]);

        let embedder = FakeEmbedder::default();
        let embeddings = EmbeddingBatcher::new(&embedder, 48).embed(profiles).unwrap();
        assert_eq!(embeddings.keys().collect::<Vec<_>>(), vec!["a", "d"]);
    }

    #[test]
    fn test_short_embedding_batch_is_an_error() {
        let embedder = FakeEmbedder { drop_last: true, ..Default::default() };
        let result = EmbeddingBatcher::new(&embedder, 48).embed([("a", "likes noir"), ("b", "likes jazz")]);
        assert!(matches!(
            result,
            Err(ProfileError::BatchSizeMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_no_profiles_no_calls() {
        let embedder = FakeEmbedder::default();
        let embeddings = EmbeddingBatcher::new(&embedder, 48)
            .embed(Vec::<(&str, &str)>::new())
            .unwrap();
        assert!(embeddings.is_empty());
        assert!(embedder.batches.borrow().is_empty());
    }
}
