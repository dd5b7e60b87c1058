//! JSON files exchanged between runs: profile maps and embedding maps.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::embedding::Embeddings;
use crate::error::{ProfileError, Result};

/// Read `{user_id: profile}` in file order.
///
/// A value may also be a list whose first element is the profile text, the
/// shape older multi-profile exports used.
pub fn read_profiles(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)?;
    let map: Map<String, Value> = serde_json::from_str(&content)?;
    map.into_iter()
        .map(|(user_id, value)| {
            let text = profile_text(&value).ok_or_else(|| {
                ProfileError::Config(format!(
                    "profile of user {} in {} is neither a string nor a list of strings",
                    user_id,
                    path.display()
                ))
            })?;
            Ok((user_id, text))
        })
        .collect()
}

fn profile_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => match values.first() {
            Some(Value::String(s)) => Some(s.clone()),
            None => Some(String::new()),
            _ => None,
        },
        _ => None,
    }
}

/// JSON list of user ids; numeric ids are accepted and stringified
pub fn read_user_ids(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let ids: Vec<Value> = serde_json::from_str(&content)?;
    ids.into_iter()
        .map(|id| match id {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(ProfileError::Config(format!("invalid user id {}", other))),
        })
        .collect()
}

pub fn write_profiles(path: &Path, profiles: &[(String, String)]) -> Result<()> {
    let map: Map<String, Value> = profiles
        .iter()
        .map(|(id, text)| (id.clone(), Value::from(text.as_str())))
        .collect();
    std::fs::write(path, serde_json::to_vec(&map)?)?;
    Ok(())
}

/// Build `{user_id: profile}` from every `<user_id>.txt` in a folder, sorted by id
pub fn collect_profiles_from_folder(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    files.retain(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"));
    files.sort();

    let mut profiles = Vec::with_capacity(files.len());
    for path in files {
        let Some(user_id) = path.file_stem().and_then(|s| s.to_str()) else {
            tracing::warn!("skipping non UTF-8 file name {}", path.display());
            continue;
        };
        profiles.push((user_id.to_string(), std::fs::read_to_string(&path)?));
    }
    tracing::info!(profiles = profiles.len(), "collected profiles from {}", dir.display());
    Ok(profiles)
}

pub fn read_embeddings(path: &Path) -> Result<Embeddings> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn write_embeddings(path: &Path, embeddings: &Embeddings) -> Result<()> {
    std::fs::write(path, serde_json::to_vec(embeddings)?)?;
    tracing::info!(users = embeddings.len(), "wrote embeddings to {}", path.display());
    Ok(())
}

/// Union of several embedding maps; later files override earlier ids
pub fn merge_embedding_files(paths: &[PathBuf]) -> Result<Embeddings> {
    let mut merged = Embeddings::new();
    for path in paths {
        let part = read_embeddings(path)?;
        tracing::debug!(users = part.len(), "merging {}", path.display());
        merged.extend(part);
    }
    tracing::info!(total = merged.len(), files = paths.len(), "merged embeddings");
    Ok(merged)
}
