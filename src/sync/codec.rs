//! Persisted queue entry format
//!
//! Each entry is a JSON envelope `{"schema": N, "item": {...}}`. Fields added
//! after schema 1 carry serde defaults, so older entries keep decoding.
//! Entries written by a newer schema are refused rather than guessed at.

use serde::{Deserialize, Serialize};

use super::models::QueueItem;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed entry: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u32),

    #[error("invalid entry: {0}")]
    Invalid(String),
}

#[derive(Serialize)]
struct EntryRef<'a> {
    schema: u32,
    item: &'a QueueItem,
}

#[derive(Deserialize)]
struct RawEntry {
    schema: u32,
    item: serde_json::Value,
}

pub fn encode(item: &QueueItem) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&EntryRef { schema: SCHEMA_VERSION, item })?)
}

pub fn decode(raw: &str) -> Result<QueueItem, CodecError> {
    let entry: RawEntry = serde_json::from_str(raw)?;
    if entry.schema == 0 || entry.schema > SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchema(entry.schema));
    }

    let item: QueueItem = serde_json::from_value(entry.item)?;
    if item.id.is_empty() {
        return Err(CodecError::Invalid("empty id".to_string()));
    }
    if item.entity_type.is_empty() || item.entity_id.is_empty() {
        return Err(CodecError::Invalid(format!("item {} has no entity", item.id)));
    }

    Ok(item)
}
