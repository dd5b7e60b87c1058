//! Pre-pass that routes every user to the batch or the sequential path.
//!
//! Each user's history is enriched with item attributes once; the prepared
//! records are kept in the checkpoint and reused verbatim for generation.

use serde_json::Value;

use crate::backend::TextGenerator;
use crate::checkpoint::Checkpoint;
use crate::dataset::{check_user_id, Dataset, UserInteractions};
use crate::error::{ProfileError, Result};
use crate::pipeline::Pipeline;
use crate::splitter::Splitter;
use crate::types::{InteractionRecord, UserClassification};

/// Item attribute never copied into records
pub const ITEM_ID_ATTRIBUTE: &str = "item_id";
/// Item attribute renamed to [`TITLE_KEY`] in records
pub const NAME_ATTRIBUTE: &str = "name";
pub const TITLE_KEY: &str = "title";

fn display_key(attribute: &str) -> &str {
    if attribute == NAME_ATTRIBUTE {
        TITLE_KEY
    } else {
        attribute
    }
}

/// Flatten a user's interactions into one record per interacted item.
///
/// Records follow the item order of `interaction_field`. Each record holds
/// every interaction field first, then every schema attribute of the item
/// except its id, with `name` exposed as `title`.
pub fn enrich<D: Dataset + ?Sized>(
    user_id: &str,
    interactions: &UserInteractions,
    interaction_field: &str,
    dataset: &D,
) -> Result<Vec<InteractionRecord>> {
    let items = interactions
        .get(interaction_field)
        .and_then(Value::as_object)
        .ok_or_else(|| ProfileError::MissingInteractionField {
            user_id: user_id.to_string(),
            field: interaction_field.to_string(),
        })?;

    let schema: Vec<String> = dataset
        .item_schema()
        .into_iter()
        .filter(|a| a != ITEM_ID_ATTRIBUTE)
        .collect();

    let mut records = Vec::with_capacity(items.len());
    for item_id in items.keys() {
        let item = dataset.item(item_id).ok_or_else(|| ProfileError::UnknownItem {
            user_id: user_id.to_string(),
            item_id: item_id.clone(),
        })?;

        let mut record = InteractionRecord::new();
        for (field, values) in interactions {
            let value = values.get(item_id.as_str()).cloned().unwrap_or(Value::Null);
            record.insert(field.clone(), value);
        }
        for attribute in &schema {
            let value = item.attributes.get(attribute).cloned().unwrap_or(Value::Null);
            record.insert(display_key(attribute), value);
        }
        records.push(record);
    }
    Ok(records)
}

/// Classifies users by the number of leaf calls their history needs
pub struct Classifier<'a, D: Dataset + ?Sized, G: TextGenerator + ?Sized> {
    dataset: &'a D,
    pipeline: &'a Pipeline,
    splitter: &'a Splitter<'a, G>,
    interaction_field: &'a str,
}

impl<'a, D: Dataset + ?Sized, G: TextGenerator + ?Sized> Classifier<'a, D, G> {
    pub fn new(
        dataset: &'a D,
        pipeline: &'a Pipeline,
        splitter: &'a Splitter<'a, G>,
        interaction_field: &'a str,
    ) -> Self {
        Self { dataset, pipeline, splitter, interaction_field }
    }

    /// `None` when the user has no interactions at all
    pub fn classify_user(&self, user_id: &str) -> Result<Option<UserClassification>> {
        let Some(interactions) = self.dataset.interactions_by_user(user_id) else {
            tracing::warn!(user_id, "user has no interactions, skipping");
            return Ok(None);
        };
        let records = enrich(user_id, interactions, self.interaction_field, self.dataset)?;
        let count = self.pipeline.count_splits(&records, self.splitter);
        tracing::debug!(user_id, records = records.len(), splits = count, "classified user");
        Ok(Some(UserClassification::from_split_count(count, records)))
    }

    /// Classify every requested user (all users when `None`)
    pub fn classify(&self, requested: Option<&[String]>) -> Result<Checkpoint> {
        let user_ids = self.dataset.users(requested)?;
        for user_id in &user_ids {
            check_user_id(user_id)?;
        }
        tracing::info!(users = user_ids.len(), "classifying users");

        let mut checkpoint = Checkpoint::default();
        for (i, user_id) in user_ids.iter().enumerate() {
            if let Some(classification) = self.classify_user(user_id)? {
                checkpoint.push(user_id.clone(), classification);
            }
            if (i + 1) % 1000 == 0 {
                tracing::info!(done = i + 1, total = user_ids.len(), "classification progress");
            }
        }

        tracing::info!(
            single_call = checkpoint.single_call.len(),
            multi_call = checkpoint.multi_call.len(),
            "classification finished"
        );
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeGenerator;
    use crate::dataset::JsonDataset;
    use crate::pipeline::Strategy;
    use crate::prompts::PromptSet;
    use crate::types::PromptBudget;
    use serde_json::json;

    fn dataset() -> JsonDataset {
        JsonDataset::from_json_str(
            r#"{
            "items": {
                "10": {"item_id": "10", "name": "Heat", "genres": "crime"},
                "11": {"item_id": "11", "name": "Up", "genres": "animation"},
                "12": {"item_id": "12", "name": "Jaws", "genres": "thriller"}
            },
            "interactions": {
                "small": {"watched %": {"11": 90}},
                "large": {"watched %": {"10": 20, "11": 35, "12": 100}},
                "broken": {"watched %": {"99": 1}}
            },
            "users": ["small", "large", "broken", "idle"]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_enrich_builds_ordered_records() {
        let data = dataset();
        let interactions = data.interactions_by_user("large").unwrap();
        let records = enrich("large", interactions, "watched %", &data).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(
            serde_json::to_value(&records[0]).unwrap(),
            json!({"watched %": 20, "title": "Heat", "genres": "crime"})
        );
        let keys: Vec<&String> = records[0].0.keys().collect();
        assert_eq!(keys, vec!["watched %", "title", "genres"]);
        assert_eq!(records[2].get("title"), Some(&json!("Jaws")));
    }

    #[test]
    fn test_enrich_errors() {
        let data = dataset();
        let broken = data.interactions_by_user("broken").unwrap();
        assert!(matches!(
            enrich("broken", broken, "watched %", &data),
            Err(ProfileError::UnknownItem { .. })
        ));
        assert!(matches!(
            enrich("broken", broken, "ratings", &data),
            Err(ProfileError::MissingInteractionField { .. })
        ));
    }

    #[test]
    fn test_classification_is_stable() {
        let data = dataset();
        let prompts = PromptSet::builtin("movies").unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &prompts);
        let backend = FakeGenerator::new(0);

        // Template plus one record fits, three records do not
        let one = prompts.aggregate_after.render_create(
            &enrich("small", data.interactions_by_user("small").unwrap(), "watched %", &data).unwrap(),
        );
        let budget = PromptBudget::new(one.chars().count() + 60, 10);
        let splitter = Splitter::new(&backend, budget);
        let classifier = Classifier::new(&data, &pipeline, &splitter, "watched %");

        let requested = vec!["small".to_string(), "large".to_string(), "idle".to_string()];
        let first = classifier.classify(Some(&requested)).unwrap();
        let second = classifier.classify(Some(&requested)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.single_call.len(), 1);
        assert_eq!(first.single_call[0].0, "small");
        assert_eq!(first.multi_call.len(), 1);
        assert_eq!(first.multi_call[0].0, "large");
        assert_eq!(first.multi_call[0].1.len(), 3);
        assert!(first.get("idle").is_none());
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_unsafe_user_id_is_rejected_before_counting() {
        let data = JsonDataset::from_json_str(
            r#"{
            "items": {"10": {"name": "Heat"}},
            "interactions": {
                "ok": {"watched %": {"10": 50}},
                "../escape": {"watched %": {"10": 10}}
            }
        }"#,
        )
        .unwrap();
        let prompts = PromptSet::builtin("movies").unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &prompts);
        let backend = FakeGenerator::new(100_000);
        let splitter = Splitter::for_generator(&backend, 10);
        let classifier = Classifier::new(&data, &pipeline, &splitter, "watched %");

        assert!(matches!(classifier.classify(None), Err(ProfileError::Config(_))));
    }

    #[test]
    fn test_unknown_requested_user_is_fatal() {
        let data = dataset();
        let prompts = PromptSet::builtin("movies").unwrap();
        let pipeline = Pipeline::new(Strategy::AggregateAfter, &prompts);
        let backend = FakeGenerator::new(100_000);
        let splitter = Splitter::for_generator(&backend, 10);
        let classifier = Classifier::new(&data, &pipeline, &splitter, "watched %");

        let requested = vec!["nobody".to_string()];
        assert!(matches!(
            classifier.classify(Some(&requested)),
            Err(ProfileError::UnknownUser(_))
        ));
    }
}
