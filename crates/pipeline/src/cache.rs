//! Synthesized phrase cache
//!
//! Content-addressed: the key is the lowercase hex SHA-256 of the voice and
//! text, the value is the synthesized SLIN payload on disk. Writes go
//! through a temp file and a rename so a crash never leaves a torn entry.
//! Cache hits let callers skip the synthesis semaphore entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{PipelineError, Synthesizer};

/// On-disk phrase cache
pub struct PhraseCache {
    dir: PathBuf,
}

impl PhraseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache key for a (voice, text) pair
    pub fn key(voice: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(voice.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.slin"))
    }

    /// Fetch a cached phrase, if present
    pub async fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.entry_path(key)).await.ok()
    }

    /// Store a synthesized phrase atomically
    pub async fn store(&self, key: &str, pcm: &[u8]) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = self.dir.join(format!(".{key}.tmp"));
        tokio::fs::write(&tmp, pcm).await?;
        tokio::fs::rename(&tmp, self.entry_path(key)).await?;
        Ok(())
    }

    /// Synthesize and cache every phrase in the pre-warm list. Failures are
    /// logged and skipped: a cold entry just pays the synthesis cost later.
    pub async fn prewarm(
        &self,
        synthesizer: &Arc<dyn Synthesizer>,
        voice: &str,
        phrases: &[String],
    ) {
        for phrase in phrases {
            let key = Self::key(voice, phrase);
            if self.lookup(&key).await.is_some() {
                continue;
            }
            match synthesizer.synthesize(voice, phrase).await {
                Ok(pcm) => {
                    if let Err(err) = self.store(&key, &pcm).await {
                        tracing::warn!(%err, "failed to cache pre-warmed phrase");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, %phrase, "pre-warm synthesis failed");
                }
            }
        }
        tracing::info!(count = phrases.len(), "phrase cache pre-warm finished");
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ToneSynthesizer;

    #[async_trait]
    impl Synthesizer for ToneSynthesizer {
        async fn synthesize(&self, _voice: &str, text: &str) -> Result<Vec<u8>, PipelineError> {
            Ok(text.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_key_is_stable_and_voice_sensitive() {
        let a = PhraseCache::key("voice-a", "hello");
        let b = PhraseCache::key("voice-a", "hello");
        let c = PhraseCache::key("voice-b", "hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PhraseCache::new(dir.path());

        let key = PhraseCache::key("v", "please wait");
        assert!(cache.lookup(&key).await.is_none());

        cache.store(&key, b"pcm-bytes").await.unwrap();
        assert_eq!(cache.lookup(&key).await.unwrap(), b"pcm-bytes");
    }

    #[tokio::test]
    async fn test_prewarm_populates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PhraseCache::new(dir.path());
        let synth: Arc<dyn Synthesizer> = Arc::new(ToneSynthesizer);

        let phrases = vec!["one".to_string(), "two".to_string()];
        cache.prewarm(&synth, "v", &phrases).await;

        for phrase in &phrases {
            let key = PhraseCache::key("v", phrase);
            assert_eq!(cache.lookup(&key).await.unwrap(), phrase.as_bytes());
        }
    }
}
