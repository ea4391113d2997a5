//! Content-addressed voice identity store: a filesystem tree of per-series
//! character reference audio with version history, plus optional
//! embedding-based speaker matching for assigning new audio to an
//! existing character or minting a fresh one.

pub mod embedder;
pub mod locks;
pub mod models;
pub mod store;

pub use embedder::{cosine_similarity, match_or_create_speaker, MatchOutcome, VoiceEmbedder};
pub use models::{CharacterRef, CharacterVersion, IndexEntry, SeriesIndex};
pub use store::VoiceStore;
