//! Filesystem layout:
//! `root/<series_slug>/characters/<character_slug>/{ref.wav, refs/<job>_<ts>.wav,
//! meta.json, versions/<ts>/{ref.wav, metadata.json}}` plus
//! `root/<series_slug>/index.json`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use reeldub_core::{RdError, RdResult};

use crate::locks::LockRegistry;
use crate::models::{CharacterRef, CharacterVersion, IndexEntry, SeriesIndex};

pub struct VoiceStore {
    root: PathBuf,
    locks: LockRegistry,
}

impl VoiceStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root, locks: LockRegistry::new() }
    }

    fn series_dir(&self, series_slug: &str) -> PathBuf {
        self.root.join(series_slug)
    }

    fn character_dir(&self, series_slug: &str, character_slug: &str) -> PathBuf {
        self.series_dir(series_slug).join("characters").join(character_slug)
    }

    fn index_path(&self, series_slug: &str) -> PathBuf {
        self.series_dir(series_slug).join("index.json")
    }

    pub async fn save_character_ref(
        &self,
        series_slug: &str,
        character_slug: &str,
        wav_bytes: &[u8],
        job_id: &str,
        meta: serde_json::Value,
    ) -> RdResult<CharacterRef> {
        let series_slug = sanitize_slug(series_slug);
        let character_slug = sanitize_slug(character_slug);
        let lock = self.locks.named(&format!("{series_slug}/{character_slug}"));
        let _guard = lock.lock().await;

        let character_dir = self.character_dir(&series_slug, &character_slug);
        let refs_dir = character_dir.join("refs");
        let now = Utc::now();
        let version_id = now.format("%Y%m%dT%H%M%S%.3f").to_string();
        let version_dir = character_dir.join("versions").join(&version_id);

        for dir in [&character_dir, &refs_dir, &version_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RdError::internal("creating voice store directory").with_source(e.into()))?;
        }

        let canonical_path = character_dir.join("ref.wav");
        write_atomic(&character_dir, &canonical_path, &format!(".ref.wav.{version_id}.tmp"), wav_bytes).await?;
        tokio::fs::write(refs_dir.join(format!("{job_id}_{version_id}.wav")), wav_bytes)
            .await
            .map_err(|e| RdError::internal("writing voice reference copy").with_source(e.into()))?;
        tokio::fs::write(version_dir.join("ref.wav"), wav_bytes)
            .await
            .map_err(|e| RdError::internal("writing voice version snapshot").with_source(e.into()))?;

        let version = CharacterVersion { version_id: version_id.clone(), created_at: now, job_id: job_id.to_string(), metadata: meta.clone() };
        write_json(&version_dir.join("metadata.json"), &version).await?;
        write_json(&character_dir.join("meta.json"), &meta).await?;

        self.touch_index(&series_slug, &character_slug, now).await?;

        Ok(CharacterRef { series_slug, character_slug, canonical_path, version_id, created_at: now })
    }

    pub async fn get_character_ref(&self, series_slug: &str, character_slug: &str) -> RdResult<Option<PathBuf>> {
        let path = self.character_dir(&sanitize_slug(series_slug), &sanitize_slug(character_slug)).join("ref.wav");
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(path)),
            Ok(false) => Ok(None),
            Err(e) => Err(RdError::internal("checking for voice reference file").with_source(e.into()).into()),
        }
    }

    pub async fn list_character_versions(&self, series_slug: &str, character_slug: &str) -> RdResult<Vec<CharacterVersion>> {
        let versions_dir = self.character_dir(&sanitize_slug(series_slug), &sanitize_slug(character_slug)).join("versions");
        let mut read_dir = match tokio::fs::read_dir(&versions_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RdError::internal("listing voice versions").with_source(e.into()).into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|e| RdError::internal("reading voice version entry").with_source(e.into()))?
        {
            let meta_path = entry.path().join("metadata.json");
            if let Ok(bytes) = tokio::fs::read(&meta_path).await {
                if let Ok(version) = serde_json::from_slice::<CharacterVersion>(&bytes) {
                    versions.push(version);
                }
            }
        }
        versions.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(versions)
    }

    /// Writes the chosen historical version back as a new canonical version;
    /// history is append-only, rollback never rewrites an existing entry.
    pub async fn rollback(&self, series_slug: &str, character_slug: &str, version_id: &str) -> RdResult<CharacterRef> {
        let series_slug = sanitize_slug(series_slug);
        let character_slug = sanitize_slug(character_slug);
        let source_dir = self.character_dir(&series_slug, &character_slug).join("versions").join(version_id);

        let wav_bytes = tokio::fs::read(source_dir.join("ref.wav"))
            .await
            .map_err(|_| RdError::not_found("voice version not found"))?;
        let meta_bytes = tokio::fs::read(source_dir.join("metadata.json"))
            .await
            .map_err(|e| RdError::internal("reading voice version metadata").with_source(e.into()))?;
        let source_version: CharacterVersion =
            serde_json::from_slice(&meta_bytes).map_err(|e| RdError::internal("corrupt voice version metadata").with_source(e.into()))?;

        self.save_character_ref(&series_slug, &character_slug, &wav_bytes, &source_version.job_id, source_version.metadata).await
    }

    /// Best-effort recursive removal; a character directory that is
    /// already gone is not an error.
    pub async fn delete_character(&self, series_slug: &str, character_slug: &str) -> RdResult<()> {
        let series_slug = sanitize_slug(series_slug);
        let character_slug = sanitize_slug(character_slug);
        let lock = self.locks.named(&format!("{series_slug}/{character_slug}"));
        let _guard = lock.lock().await;

        let character_dir = self.character_dir(&series_slug, &character_slug);
        if let Err(e) = tokio::fs::remove_dir_all(&character_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(series_slug = %series_slug, character_slug = %character_slug, error = %e, "best-effort character directory removal failed");
            }
        }
        self.remove_from_index(&series_slug, &character_slug).await
    }

    pub async fn list_characters(&self, series_slug: &str) -> RdResult<Vec<IndexEntry>> {
        Ok(self.read_index(&sanitize_slug(series_slug)).await?.characters)
    }

    /// Next unused `SPEAKER_NN` slug for the series, monotonic per series.
    pub async fn allocate_speaker_slug(&self, series_slug: &str) -> RdResult<String> {
        let index = self.read_index(&sanitize_slug(series_slug)).await?;
        let max_n = index
            .characters
            .iter()
            .filter_map(|e| e.character_slug.strip_prefix("SPEAKER_"))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(format!("SPEAKER_{:02}", max_n + 1))
    }

    async fn read_index(&self, series_slug: &str) -> RdResult<SeriesIndex> {
        match tokio::fs::read(self.index_path(series_slug)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SeriesIndex::default()),
            Err(e) => Err(RdError::internal("reading voice series index").with_source(e.into()).into()),
        }
    }

    async fn touch_index(&self, series_slug: &str, character_slug: &str, now: chrono::DateTime<Utc>) -> RdResult<()> {
        let series_dir = self.series_dir(series_slug);
        tokio::fs::create_dir_all(&series_dir).await.map_err(|e| RdError::internal("creating series directory").with_source(e.into()))?;
        let mut index = self.read_index(series_slug).await?;
        match index.characters.iter_mut().find(|e| e.character_slug == character_slug) {
            Some(entry) => {
                entry.updated_at = now;
                entry.version_count += 1;
            }
            None => index.characters.push(IndexEntry {
                character_slug: character_slug.to_string(),
                created_at: now,
                updated_at: now,
                version_count: 1,
            }),
        }
        write_json(&self.index_path(series_slug), &index).await
    }

    async fn remove_from_index(&self, series_slug: &str, character_slug: &str) -> RdResult<()> {
        let mut index = self.read_index(series_slug).await?;
        index.characters.retain(|e| e.character_slug != character_slug);
        write_json(&self.index_path(series_slug), &index).await
    }
}

async fn write_atomic(dir: &Path, dest: &Path, tmp_name: &str, bytes: &[u8]) -> RdResult<()> {
    let tmp_path = dir.join(tmp_name);
    tokio::fs::write(&tmp_path, bytes).await.map_err(|e| RdError::internal("writing voice reference file").with_source(e.into()))?;
    tokio::fs::rename(&tmp_path, dest).await.map_err(|e| RdError::internal("promoting voice reference file").with_source(e.into()))?;
    Ok(())
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> RdResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| RdError::internal("serializing voice store metadata").with_source(e.into()))?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &bytes).await.map_err(|e| RdError::internal("writing voice store metadata").with_source(e.into()))?;
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| RdError::internal("promoting voice store metadata").with_source(e.into()))?;
    Ok(())
}

/// Filesystem-safe slug: alphanumeric, `-`, `_` pass through unchanged
/// (preserving case, since auto-assigned `SPEAKER_NN` slugs must stay
/// uppercase); anything else is dropped.
fn sanitize_slug(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_').collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> VoiceStore {
        VoiceStore::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn save_then_get_returns_the_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let saved = store.save_character_ref("my-show", "SPEAKER_01", b"audio-bytes", "job_1", json!({"label": "narrator"})).await.unwrap();
        let fetched = store.get_character_ref("my-show", "SPEAKER_01").await.unwrap().unwrap();
        assert_eq!(fetched, saved.canonical_path);
        assert_eq!(tokio::fs::read(&fetched).await.unwrap(), b"audio-bytes");
    }

    #[tokio::test]
    async fn get_unknown_character_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.get_character_ref("my-show", "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_saves_accumulate_versions_and_rollback_restores_canonical_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save_character_ref("my-show", "SPEAKER_01", b"take-one", "job_1", json!({})).await.unwrap();
        store.save_character_ref("my-show", "SPEAKER_01", b"take-two", "job_2", json!({})).await.unwrap();

        let versions = store.list_character_versions("my-show", "SPEAKER_01").await.unwrap();
        assert_eq!(versions.len(), 2);

        let canonical = store.get_character_ref("my-show", "SPEAKER_01").await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&canonical).await.unwrap(), b"take-two");

        store.rollback("my-show", "SPEAKER_01", &versions[0].version_id).await.unwrap();
        let canonical = store.get_character_ref("my-show", "SPEAKER_01").await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&canonical).await.unwrap(), b"take-one");
        assert_eq!(store.list_character_versions("my-show", "SPEAKER_01").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn delete_character_removes_it_from_the_index_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save_character_ref("my-show", "SPEAKER_01", b"x", "job_1", json!({})).await.unwrap();
        assert_eq!(store.list_characters("my-show").await.unwrap().len(), 1);

        store.delete_character("my-show", "SPEAKER_01").await.unwrap();
        assert!(store.list_characters("my-show").await.unwrap().is_empty());
        assert!(store.get_character_ref("my-show", "SPEAKER_01").await.unwrap().is_none());

        store.delete_character("my-show", "SPEAKER_01").await.unwrap();
    }

    #[tokio::test]
    async fn speaker_slugs_allocate_monotonically_per_series() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert_eq!(store.allocate_speaker_slug("my-show").await.unwrap(), "SPEAKER_01");
        store.save_character_ref("my-show", "SPEAKER_01", b"x", "job_1", json!({})).await.unwrap();
        assert_eq!(store.allocate_speaker_slug("my-show").await.unwrap(), "SPEAKER_02");
        store.save_character_ref("my-show", "SPEAKER_02", b"y", "job_2", json!({})).await.unwrap();
        assert_eq!(store.allocate_speaker_slug("my-show").await.unwrap(), "SPEAKER_03");
    }
}
