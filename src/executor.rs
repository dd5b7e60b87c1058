//! Run orchestration: checkpointed classification, then the batch path for
//! single-call users and the sequential path for multi-call users.
//!
//! Outputs are persisted one user (or one batch) at a time, so files already
//! on disk survive a crash mid-run.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::backend::TextGenerator;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classifier::Classifier;
use crate::dataset::Dataset;
use crate::error::{ProfileError, Result};
use crate::pipeline::Pipeline;
use crate::splitter::Splitter;
use crate::types::{AspectProfile, GenerationConfig, InteractionRecord, ProfileOutput};

/// Aggregate file for single-text strategies
pub const PROFILES_ALL_FILE: &str = "profiles_all.json";

/// Finished profiles in processing order
pub type Profiles = Vec<(String, ProfileOutput)>;

/// Per-user profile files and aggregate JSON inside one output folder.
///
/// Multi-aspect profiles go to `type{i}/` subfolders, one per aspect in
/// declaration order.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
    aspects: Vec<String>,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>, aspects: Vec<String>) -> Self {
        Self { dir: dir.into(), aspects }
    }

    pub fn for_pipeline(dir: impl Into<PathBuf>, pipeline: &Pipeline) -> Self {
        let aspects = pipeline.aspect_names().into_iter().map(String::from).collect();
        Self::new(dir, aspects)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn aspect_dir(&self, index: usize) -> PathBuf {
        self.dir.join(format!("type{}", index + 1))
    }

    fn user_file(dir: &Path, user_id: &str) -> PathBuf {
        dir.join(format!("{}.txt", user_id))
    }

    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for i in 0..self.aspects.len() {
            std::fs::create_dir_all(self.aspect_dir(i))?;
        }
        Ok(())
    }

    pub fn write(&self, user_id: &str, output: &ProfileOutput) -> Result<()> {
        match output {
            ProfileOutput::Single(text) => {
                std::fs::write(Self::user_file(&self.dir, user_id), text)?;
            }
            ProfileOutput::Aspects(aspects) => {
                for (i, name) in self.aspects.iter().enumerate() {
                    let text = aspects
                        .iter()
                        .find(|a| &a.aspect == name)
                        .map(|a| a.text.as_str())
                        .unwrap_or_default();
                    std::fs::write(Self::user_file(&self.aspect_dir(i), user_id), text)?;
                }
            }
        }
        Ok(())
    }

    /// Previously written output, if every file for the user exists
    pub fn read_existing(&self, user_id: &str) -> Result<Option<ProfileOutput>> {
        if self.aspects.is_empty() {
            let path = Self::user_file(&self.dir, user_id);
            if !path.exists() {
                return Ok(None);
            }
            return Ok(Some(ProfileOutput::Single(std::fs::read_to_string(path)?)));
        }
        let mut aspects = Vec::with_capacity(self.aspects.len());
        for (i, name) in self.aspects.iter().enumerate() {
            let path = Self::user_file(&self.aspect_dir(i), user_id);
            if !path.exists() {
                return Ok(None);
            }
            aspects.push(AspectProfile {
                aspect: name.clone(),
                text: std::fs::read_to_string(path)?,
            });
        }
        Ok(Some(ProfileOutput::Aspects(aspects)))
    }

    /// `profiles_all.json`, or `profiles_type{i}_all.json` per aspect
    pub fn write_aggregate(&self, profiles: &Profiles) -> Result<()> {
        if self.aspects.is_empty() {
            let map: Map<String, Value> = profiles
                .iter()
                .filter_map(|(id, out)| out.as_single().map(|t| (id.clone(), Value::from(t))))
                .collect();
            return write_json(&self.dir.join(PROFILES_ALL_FILE), &map);
        }
        for (i, name) in self.aspects.iter().enumerate() {
            let map: Map<String, Value> = profiles
                .iter()
                .filter_map(|(id, out)| out.aspect(name).map(|t| (id.clone(), Value::from(t))))
                .collect();
            write_json(&self.dir.join(format!("profiles_type{}_all.json", i + 1)), &map)?;
        }
        Ok(())
    }
}

fn write_json(path: &Path, map: &Map<String, Value>) -> Result<()> {
    std::fs::write(path, serde_json::to_vec(map)?)?;
    tracing::info!(entries = map.len(), "wrote {}", path.display());
    Ok(())
}

/// Generates single-call users in fixed-size batches, one backend round-trip each
pub struct BatchExecutor {
    batch_size: usize,
    resume: bool,
}

impl BatchExecutor {
    pub fn new(batch_size: usize, resume: bool) -> Self {
        Self { batch_size: batch_size.max(1), resume }
    }

    pub fn run<G: TextGenerator + ?Sized>(
        &self,
        pipeline: &Pipeline,
        splitter: &Splitter<'_, G>,
        users: &[(String, Vec<InteractionRecord>)],
        writer: &OutputWriter,
    ) -> Result<Profiles> {
        let mut profiles = Vec::with_capacity(users.len());
        let mut pending: Vec<&(String, Vec<InteractionRecord>)> = Vec::with_capacity(users.len());
        for user in users {
            match self.existing(writer, &user.0)? {
                Some(output) => profiles.push((user.0.clone(), output)),
                None => pending.push(user),
            }
        }

        let total = pending.len().div_ceil(self.batch_size);
        for (i, batch) in pending.chunks(self.batch_size).enumerate() {
            tracing::info!(batch = i + 1, total, users = batch.len(), "generating single-call batch");
            let records: Vec<&[InteractionRecord]> = batch.iter().map(|(_, r)| r.as_slice()).collect();
            let outputs = pipeline.generate_batch(&records, splitter)?;
            if outputs.len() != batch.len() {
                return Err(ProfileError::BatchSizeMismatch {
                    expected: batch.len(),
                    actual: outputs.len(),
                });
            }
            for ((user_id, _), output) in batch.iter().zip(outputs) {
                writer.write(user_id, &output)?;
                profiles.push((user_id.clone(), output));
            }
        }
        Ok(profiles)
    }

    fn existing(&self, writer: &OutputWriter, user_id: &str) -> Result<Option<ProfileOutput>> {
        if !self.resume {
            return Ok(None);
        }
        let found = writer.read_existing(user_id)?;
        if found.is_some() {
            tracing::debug!(user_id, "reusing existing profile");
        }
        Ok(found)
    }
}

/// Generates multi-call users one at a time through the full recursion
pub struct SequentialExecutor {
    resume: bool,
}

impl SequentialExecutor {
    pub fn new(resume: bool) -> Self {
        Self { resume }
    }

    pub fn run<G: TextGenerator + ?Sized>(
        &self,
        pipeline: &Pipeline,
        splitter: &Splitter<'_, G>,
        users: &[(String, Vec<InteractionRecord>)],
        writer: &OutputWriter,
    ) -> Result<Profiles> {
        let mut profiles = Vec::with_capacity(users.len());
        for (i, (user_id, records)) in users.iter().enumerate() {
            if self.resume {
                if let Some(output) = writer.read_existing(user_id)? {
                    tracing::debug!(user_id = %user_id, "reusing existing profile");
                    profiles.push((user_id.clone(), output));
                    continue;
                }
            }
            tracing::info!(
                user = i + 1,
                total = users.len(),
                user_id = %user_id,
                records = records.len(),
                "generating multi-call profile"
            );
            let output = pipeline.generate_one(records, splitter)?;
            writer.write(user_id, &output)?;
            profiles.push((user_id.clone(), output));
        }
        Ok(profiles)
    }
}

/// End-to-end profile generation over one output folder
pub struct ProfileGenerator<'a, G: TextGenerator + ?Sized> {
    pipeline: &'a Pipeline,
    splitter: Splitter<'a, G>,
    config: &'a GenerationConfig,
}

impl<'a, G: TextGenerator + ?Sized> ProfileGenerator<'a, G> {
    pub fn new(pipeline: &'a Pipeline, generator: &'a G, config: &'a GenerationConfig) -> Self {
        let splitter = Splitter::for_generator(generator, config.max_output_tokens as usize);
        Self { pipeline, splitter, config }
    }

    pub fn splitter(&self) -> &Splitter<'a, G> {
        &self.splitter
    }

    /// Load the checkpoint, or classify and persist it before any generation
    pub fn prepare_users<D: Dataset + ?Sized>(
        &self,
        dataset: &D,
        interaction_field: &str,
        requested: Option<&[String]>,
        store: &CheckpointStore,
    ) -> Result<Checkpoint> {
        let checkpoint = match store.load()? {
            Some(checkpoint) => checkpoint.filter(requested),
            None => {
                let classifier =
                    Classifier::new(dataset, self.pipeline, &self.splitter, interaction_field);
                let checkpoint = classifier.classify(requested)?;
                store.save(&checkpoint)?;
                checkpoint
            }
        };
        if checkpoint.is_empty() {
            return Err(ProfileError::NoUsers);
        }
        Ok(checkpoint)
    }

    /// Generate, persist and return every requested user's profile
    pub fn generate<D: Dataset + ?Sized>(
        &self,
        dataset: &D,
        interaction_field: &str,
        requested: Option<&[String]>,
        out_dir: &Path,
    ) -> Result<Profiles> {
        self.config.validate()?;
        let writer = OutputWriter::for_pipeline(out_dir, self.pipeline);
        writer.prepare()?;

        let store = CheckpointStore::in_dir(out_dir);
        let checkpoint = self.prepare_users(dataset, interaction_field, requested, &store)?;
        tracing::info!(
            strategy = ?self.pipeline.strategy(),
            single_call = checkpoint.single_call.len(),
            multi_call = checkpoint.multi_call.len(),
            "starting generation"
        );

        let mut profiles = BatchExecutor::new(self.config.batch_size, self.config.resume).run(
            self.pipeline,
            &self.splitter,
            &checkpoint.single_call,
            &writer,
        )?;
        profiles.extend(SequentialExecutor::new(self.config.resume).run(
            self.pipeline,
            &self.splitter,
            &checkpoint.multi_call,
            &writer,
        )?);

        writer.write_aggregate(&profiles)?;
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeGenerator;
    use crate::checkpoint::CHECKPOINT_FILE;
    use crate::dataset::JsonDataset;
    use crate::pipeline::Strategy;
    use crate::prompts::PromptSet;
    use serde_json::json;

    const DATA: &str = r#"{
        "items": {
            "1": {"name": "Heat", "genres": "crime"},
            "2": {"name": "Up", "genres": "animation"},
            "3": {"name": "Jaws", "genres": "thriller"},
            "4": {"name": "Alien", "genres": "horror"}
        },
        "interactions": {
            "a": {"watched %": {"1": 10}},
            "b": {"watched %": {"2": 20}},
            "c": {"watched %": {"3": 30}},
            "long": {"watched %": {"1": 90, "2": 80, "3": 70, "4": 60}}
        }
    }"#;

    /// Context where one or two records fit but four do not
    fn backend() -> FakeGenerator {
        let prompts = PromptSet::builtin("movies").unwrap();
        let base = prompts.aggregate_after.render_create(&[]).chars().count();
        FakeGenerator::new(base + 120 + 100)
    }

    fn config() -> GenerationConfig {
        GenerationConfig::default().with_max_output_tokens(100).with_batch_size(2)
    }

    #[test]
    fn test_generate_routes_users_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonDataset::from_json_str(DATA).unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend();
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let profiles = generator.generate(&dataset, "watched %", None, dir.path()).unwrap();
        assert_eq!(profiles.len(), 4);

        // a, b in one batch; c alone; long: 2 leaves + merge
        assert_eq!(backend.calls.borrow()[0].len(), 2);
        assert_eq!(backend.calls.borrow()[1].len(), 1);
        assert_eq!(backend.call_count(), 5);

        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        let text = std::fs::read_to_string(dir.path().join("b.txt")).unwrap();
        assert_eq!(text, "profile-2");
        let all: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(PROFILES_ALL_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(all["a"], json!("profile-1"));
        assert_eq!(all["long"], json!("profile-6"));
    }

    #[test]
    fn test_existing_checkpoint_skips_classification() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend();
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let mut checkpoint = Checkpoint::default();
        let mut record = InteractionRecord::new();
        record.insert("title", json!("Stored"));
        checkpoint.push("a", crate::types::UserClassification::SingleCall(vec![record]));
        checkpoint.push("z", crate::types::UserClassification::SingleCall(vec![]));
        CheckpointStore::in_dir(dir.path()).save(&checkpoint).unwrap();

        // The dataset no longer knows "a" or "z"; the checkpoint is trusted anyway
        let dataset = JsonDataset::from_json_str(r#"{"items": {}, "interactions": {}}"#).unwrap();
        let requested = vec!["a".to_string()];
        let profiles = generator
            .generate(&dataset, "watched %", Some(&requested), dir.path())
            .unwrap();

        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].0, "a");
        assert!(backend.prompts()[0].contains("Stored"));
        assert!(!dir.path().join("z.txt").exists());
    }

    #[test]
    fn test_no_users_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend();
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);
        let dataset = JsonDataset::from_json_str(r#"{"items": {}, "interactions": {}}"#).unwrap();

        assert!(matches!(
            generator.generate(&dataset, "watched %", None, dir.path()),
            Err(ProfileError::NoUsers)
        ));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_failed_batch_keeps_earlier_output() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonDataset::from_json_str(DATA).unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend().failing_after(1);
        let config = config().with_batch_size(1);
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let requested = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = generator.generate(&dataset, "watched %", Some(&requested), dir.path());

        assert!(matches!(result, Err(ProfileError::Backend(_))));
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "profile-1");
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join(PROFILES_ALL_FILE).exists());
    }

    #[test]
    fn test_short_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonDataset::from_json_str(DATA).unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend().dropping_last();
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let requested = vec!["a".to_string(), "b".to_string()];
        let result = generator.generate(&dataset, "watched %", Some(&requested), dir.path());

        assert!(matches!(
            result,
            Err(ProfileError::BatchSizeMismatch { expected: 2, actual: 1 })
        ));
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_checkpoint_with_unsafe_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend();
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let mut checkpoint = Checkpoint::default();
        checkpoint.push("a/b", crate::types::UserClassification::SingleCall(vec![]));
        CheckpointStore::in_dir(dir.path()).save(&checkpoint).unwrap();

        let dataset = JsonDataset::from_json_str(r#"{"items": {}, "interactions": {}}"#).unwrap();
        assert!(matches!(
            generator.generate(&dataset, "watched %", None, dir.path()),
            Err(ProfileError::Config(_))
        ));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_resume_reuses_written_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonDataset::from_json_str(DATA).unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &PromptSet::builtin("movies").unwrap());
        let backend = backend();
        let config = config().with_resume(true);
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        std::fs::write(dir.path().join("a.txt"), "done before").unwrap();
        std::fs::write(dir.path().join("long.txt"), "also done").unwrap();
        let profiles = generator.generate(&dataset, "watched %", None, dir.path()).unwrap();

        assert_eq!(profiles.len(), 4);
        // b and c share one batch; nothing else is generated
        assert_eq!(backend.call_count(), 1);
        let a = profiles.iter().find(|(id, _)| id == "a").unwrap();
        assert_eq!(a.1.as_single(), Some("done before"));
    }

    #[test]
    fn test_multi_aspect_layout() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = JsonDataset::from_json_str(DATA).unwrap();
        let pipeline = Pipeline::new(Strategy::MultiAspect, &PromptSet::builtin("movies").unwrap());
        let backend = FakeGenerator::new(100_000);
        let config = config();
        let generator = ProfileGenerator::new(&pipeline, &backend, &config);

        let requested = vec!["a".to_string(), "b".to_string()];
        generator
            .generate(&dataset, "watched %", Some(&requested), dir.path())
            .unwrap();

        for i in 1..=3 {
            assert!(dir.path().join(format!("type{}", i)).join("a.txt").exists());
            assert!(dir.path().join(format!("profiles_type{}_all.json", i)).exists());
        }
        // One batch of two users, one call per aspect
        assert_eq!(backend.call_count(), 3);
        let writer = OutputWriter::for_pipeline(dir.path(), &pipeline);
        let restored = writer.read_existing("b").unwrap().unwrap();
        assert_eq!(restored.aspect("user_genres"), Some("profile-4"));
    }
}
