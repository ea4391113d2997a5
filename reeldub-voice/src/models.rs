//! Types persisted under a series' voice store directory.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRef {
    pub series_slug: String,
    pub character_slug: String,
    pub canonical_path: PathBuf,
    pub version_id: String,
    pub created_at: DateTime<Utc>,
}

/// One historical snapshot under `versions/<version_id>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterVersion {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub job_id: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub character_slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesIndex {
    pub characters: Vec<IndexEntry>,
}
