//! Durable record of the classification pre-pass.
//!
//! Written once per run before any generation call and trusted on every
//! later run against the same output folder. It is never re-validated
//! against the dataset or the budget; delete the file to reclassify.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::dataset::check_user_id;
use crate::error::Result;
use crate::types::{InteractionRecord, UserClassification};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Prepared records per user, in classification order
pub type UserRecords = Vec<(String, Vec<InteractionRecord>)>;

/// Classification result: `{"single_call": {user: records}, "multi_call": {user: records}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "ordered_users")]
    pub single_call: UserRecords,
    #[serde(with = "ordered_users")]
    pub multi_call: UserRecords,
}

impl Checkpoint {
    pub fn push(&mut self, user_id: impl Into<String>, classification: UserClassification) {
        match classification {
            UserClassification::SingleCall(records) => self.single_call.push((user_id.into(), records)),
            UserClassification::MultiCall(records) => self.multi_call.push((user_id.into(), records)),
        }
    }

    pub fn len(&self) -> usize {
        self.single_call.len() + self.multi_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classification of one user, if present
    pub fn get(&self, user_id: &str) -> Option<UserClassification> {
        let find = |users: &UserRecords| {
            users
                .iter()
                .find(|(id, _)| id == user_id)
                .map(|(_, records)| records.clone())
        };
        find(&self.single_call)
            .map(UserClassification::SingleCall)
            .or_else(|| find(&self.multi_call).map(UserClassification::MultiCall))
    }

    /// Every stored id must be usable as a file name
    pub fn check_ids(&self) -> Result<()> {
        self.single_call
            .iter()
            .chain(&self.multi_call)
            .try_for_each(|(id, _)| check_user_id(id))
    }

    /// Restrict to the requested ids; `None` keeps everyone
    pub fn filter(self, requested: Option<&[String]>) -> Checkpoint {
        let Some(ids) = requested else {
            return self;
        };
        let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        let keep = |users: UserRecords| -> UserRecords {
            users
                .into_iter()
                .filter(|(id, _)| wanted.contains(id.as_str()))
                .collect()
        };
        Checkpoint {
            single_call: keep(self.single_call),
            multi_call: keep(self.multi_call),
        }
    }
}

/// Checkpoint file inside one output folder
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CHECKPOINT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        checkpoint.check_ids()?;
        tracing::info!(
            single_call = checkpoint.single_call.len(),
            multi_call = checkpoint.multi_call.len(),
            "loaded checkpoint {}",
            self.path.display()
        );
        Ok(Some(checkpoint))
    }

    /// Write through a temporary file so a crash never leaves a torn checkpoint
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(users = checkpoint.len(), "saved checkpoint {}", self.path.display());
        Ok(())
    }
}

/// Serialize `Vec<(id, records)>` as a JSON object without losing order
mod ordered_users {
    use super::UserRecords;
    use crate::types::InteractionRecord;
    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(users: &UserRecords, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(users.iter().map(|(id, records)| (id, records)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<UserRecords, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UsersVisitor;

        impl<'de> Visitor<'de> for UsersVisitor {
            type Value = UserRecords;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of user id to interaction records")
            }

            fn visit_map<A>(self, mut map: A) -> Result<UserRecords, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut users = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, records)) = map.next_entry::<String, Vec<InteractionRecord>>()? {
                    users.push((id, records));
                }
                Ok(users)
            }
        }

        deserializer.deserialize_map(UsersVisitor)
    }
}
