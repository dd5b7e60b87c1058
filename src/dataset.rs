//! Dataset interface consumed by the classifier, plus a JSON-backed adapter.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{ProfileError, Result};

/// Per-user interactions: field name -> (item id -> value), in source order
pub type UserInteractions = Map<String, Value>;

/// Catalogue entry with its flat attribute mapping
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub item_id: String,
    pub attributes: Map<String, Value>,
}

/// User ids become output file names, so they must stay inside one folder
pub fn check_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() || user_id == "." || user_id == ".." || user_id.contains(['/', '\\']) {
        return Err(ProfileError::Config(format!(
            "user id {:?} cannot be used as a file name",
            user_id
        )));
    }
    Ok(())
}

/// Source of users, their histories and item metadata
pub trait Dataset {
    /// Every user id, in dataset order
    fn user_ids(&self) -> Vec<String>;

    /// Interaction mapping of one user, if they have any
    fn interactions_by_user(&self, user_id: &str) -> Option<&UserInteractions>;

    fn item(&self, item_id: &str) -> Option<&Item>;

    /// Attribute names shared by the catalogue's items
    fn item_schema(&self) -> Vec<String>;

    /// Resolve the users to process; every requested id must exist
    fn users(&self, requested: Option<&[String]>) -> Result<Vec<String>> {
        let all = self.user_ids();
        match requested {
            None => Ok(all),
            Some(ids) => {
                let known: HashSet<&str> = all.iter().map(|s| s.as_str()).collect();
                if let Some(missing) = ids.iter().find(|id| !known.contains(id.as_str())) {
                    return Err(ProfileError::UnknownUser(missing.clone()));
                }
                Ok(ids.to_vec())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonDatasetFile {
    #[serde(default)]
    users: Option<Vec<String>>,
    items: Map<String, Value>,
    interactions: Map<String, Value>,
}

/// Dataset loaded from a single JSON document:
/// `{"users": [...]?, "items": {id: {attr: value}}, "interactions": {user: {field: {item: value}}}}`
#[derive(Debug, Clone, Default)]
pub struct JsonDataset {
    users: Vec<String>,
    items: Vec<Item>,
    item_index: HashMap<String, usize>,
    interactions: Map<String, Value>,
}

impl JsonDataset {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: JsonDatasetFile = serde_json::from_str(content)?;

        let mut items = Vec::with_capacity(file.items.len());
        let mut item_index = HashMap::new();
        for (item_id, attrs) in file.items {
            let Value::Object(attributes) = attrs else {
                return Err(ProfileError::Config(format!(
                    "item {} must be an attribute object",
                    item_id
                )));
            };
            item_index.insert(item_id.clone(), items.len());
            items.push(Item { item_id, attributes });
        }

        for (user_id, value) in &file.interactions {
            let valid = value
                .as_object()
                .map(|fields| fields.values().all(Value::is_object))
                .unwrap_or(false);
            if !valid {
                return Err(ProfileError::Config(format!(
                    "interactions of user {} must map fields to item objects",
                    user_id
                )));
            }
        }

        let users = file
            .users
            .unwrap_or_else(|| file.interactions.keys().cloned().collect());

        Ok(Self { users, items, item_index, interactions: file.interactions })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let dataset = Self::from_json_str(&content)?;
        tracing::info!(
            users = dataset.users.len(),
            items = dataset.items.len(),
            "loaded dataset from {}",
            path.display()
        );
        Ok(dataset)
    }
}

impl Dataset for JsonDataset {
    fn user_ids(&self) -> Vec<String> {
        self.users.clone()
    }

    fn interactions_by_user(&self, user_id: &str) -> Option<&UserInteractions> {
        self.interactions.get(user_id).and_then(Value::as_object)
    }

    fn item(&self, item_id: &str) -> Option<&Item> {
        self.item_index.get(item_id).map(|&i| &self.items[i])
    }

    /// Schema of the first catalogue item
    fn item_schema(&self) -> Vec<String> {
        self.items
            .first()
            .map(|item| item.attributes.keys().cloned().collect())
            .unwrap_or_default()
    }
}
