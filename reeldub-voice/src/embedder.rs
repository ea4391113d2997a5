//! Optional speaker-matching on top of the voice store. The embedder is an
//! external collaborator, consistent with the rest of this workspace's
//! media-toolchain/stage-runner boundary: a missing one is a typed
//! unavailable-capability error, not a silently skipped feature.

use std::path::Path;

use async_trait::async_trait;
use reeldub_core::{RdError, RdResult};

use crate::store::VoiceStore;

#[async_trait]
pub trait VoiceEmbedder: Send + Sync {
    async fn embed(&self, wav_path: &Path) -> RdResult<Vec<f32>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched { character_slug: String, similarity: f32 },
    New { character_slug: String },
}

/// Embeds `reference_wav`, compares it against every existing character in
/// the series by re-embedding their canonical reference audio, and returns
/// the best match above `threshold` or a freshly allocated (not yet
/// persisted) `SPEAKER_NN` slug if none clears it.
pub async fn match_or_create_speaker(
    store: &VoiceStore,
    embedder: Option<&dyn VoiceEmbedder>,
    series_slug: &str,
    reference_wav: &Path,
    threshold: f32,
) -> RdResult<MatchOutcome> {
    let embedder = embedder.ok_or_else(|| RdError::unavailable("no voice embedder configured"))?;
    let query_vec = embedder.embed(reference_wav).await?;

    let mut best: Option<(String, f32)> = None;
    for entry in store.list_characters(series_slug).await? {
        let Some(candidate_path) = store.get_character_ref(series_slug, &entry.character_slug).await? else {
            continue;
        };
        let candidate_vec = embedder.embed(&candidate_path).await?;
        let similarity = cosine_similarity(&query_vec, &candidate_vec);
        let is_better = match &best {
            Some((_, s)) => similarity > *s,
            None => true,
        };
        if is_better {
            best = Some((entry.character_slug, similarity));
        }
    }

    match best {
        Some((character_slug, similarity)) if similarity >= threshold => Ok(MatchOutcome::Matched { character_slug, similarity }),
        _ => {
            let character_slug = store.allocate_speaker_slug(series_slug).await?;
            Ok(MatchOutcome::New { character_slug })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeEmbedder {
        vectors: Mutex<HashMap<String, Vec<f32>>>,
        default_vec: Vec<f32>,
    }

    #[async_trait]
    impl VoiceEmbedder for FakeEmbedder {
        async fn embed(&self, wav_path: &Path) -> RdResult<Vec<f32>> {
            let bytes = tokio::fs::read(wav_path).await.map_err(|e| RdError::internal("reading audio for embedding").with_source(e.into()))?;
            let key = String::from_utf8_lossy(&bytes).to_string();
            Ok(self.vectors.lock().unwrap().get(&key).cloned().unwrap_or_else(|| self.default_vec.clone()))
        }
    }

    #[tokio::test]
    async fn matching_above_threshold_returns_the_existing_character() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceStore::new(dir.path().to_path_buf());
        store.save_character_ref("my-show", "SPEAKER_01", b"alice-ref", "job_1", json!({})).await.unwrap();

        let mut vectors = HashMap::new();
        vectors.insert("alice-ref".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("alice-query".to_string(), vec![0.99, 0.01, 0.0]);
        let embedder = FakeEmbedder { vectors: Mutex::new(vectors), default_vec: vec![0.0, 0.0, 1.0] };

        let query_path = dir.path().join("query.wav");
        tokio::fs::write(&query_path, b"alice-query").await.unwrap();

        let outcome = match_or_create_speaker(&store, Some(&embedder), "my-show", &query_path, 0.9).await.unwrap();
        match outcome {
            MatchOutcome::Matched { character_slug, similarity } => {
                assert_eq!(character_slug, "SPEAKER_01");
                assert!(similarity >= 0.9, "expected a high-confidence match, got {similarity}");
            }
            MatchOutcome::New { .. } => panic!("expected a match, got a freshly allocated slug"),
        }
    }

    #[tokio::test]
    async fn no_match_above_threshold_allocates_a_fresh_speaker_slug() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceStore::new(dir.path().to_path_buf());
        store.save_character_ref("my-show", "SPEAKER_01", b"alice-ref", "job_1", json!({})).await.unwrap();

        let mut vectors = HashMap::new();
        vectors.insert("alice-ref".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("bob-query".to_string(), vec![0.0, 1.0, 0.0]);
        let embedder = FakeEmbedder { vectors: Mutex::new(vectors), default_vec: vec![0.0, 0.0, 1.0] };

        let query_path = dir.path().join("query.wav");
        tokio::fs::write(&query_path, b"bob-query").await.unwrap();

        let outcome = match_or_create_speaker(&store, Some(&embedder), "my-show", &query_path, 0.5).await.unwrap();
        assert_eq!(outcome, MatchOutcome::New { character_slug: "SPEAKER_02".to_string() });
    }

    #[tokio::test]
    async fn missing_embedder_is_a_typed_unavailable_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceStore::new(dir.path().to_path_buf());
        let query_path = dir.path().join("query.wav");
        tokio::fs::write(&query_path, b"x").await.unwrap();
        let err = match_or_create_speaker(&store, None, "my-show", &query_path, 0.5).await.unwrap_err();
        let rd_err = RdError::from_anyhow(&err).expect("expected a typed RdError");
        assert_eq!(rd_err.kind, reeldub_core::ErrorKind::Unavailable);
    }
}
