//! Content-addressed chunk cache.
//!
//! One WAV file per rendered chunk, named `chunk_{index:04}_{fingerprint}.wav`
//! where the fingerprint hashes the chunk text together with the voice
//! identity. The name makes stale files from old runs self-describing: an
//! entry is only ever read back when both the ordinal and the fingerprint
//! match, so edited text or a different voice can never replay the wrong
//! audio. Entries are append-only until explicit job-level cleanup.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::RenderError;
use crate::AudioClip;

/// Hex characters of the SHA-256 digest kept in file names.
const FINGERPRINT_LEN: usize = 16;

/// Compute the cache fingerprint for a chunk text and voice identity.
pub fn fingerprint(text: &str, voice_identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(voice_identity.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..FINGERPRINT_LEN].to_string()
}

/// On-disk store of rendered chunk audio.
///
/// The cache directory is owned exclusively by the engine process for its
/// lifetime.
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, RenderError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, index: usize, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("chunk_{index:04}_{fingerprint}.wav"))
    }

    /// Look up a cached clip. Unreadable or corrupt files are misses.
    pub fn lookup(&self, index: usize, fingerprint: &str) -> Option<AudioClip> {
        let path = self.entry_path(index, fingerprint);
        if !path.exists() {
            return None;
        }
        match AudioClip::read_wav(&path) {
            Ok(clip) => Some(clip),
            Err(e) => {
                log::warn!(
                    "Discarding corrupt cache entry {}: {e}",
                    path.display()
                );
                None
            }
        }
    }

    /// Persist a rendered clip; returns the entry path.
    pub fn store(
        &self,
        index: usize,
        fingerprint: &str,
        clip: &AudioClip,
    ) -> Result<PathBuf, RenderError> {
        let path = self.entry_path(index, fingerprint);
        clip.write_wav(&path)?;
        Ok(path)
    }

    /// Delete every cache entry. Called only after a job completes; failed
    /// or cancelled jobs keep their entries for resume.
    pub fn clear(&self) -> Result<(), RenderError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, ChunkCache};
    use crate::AudioClip;

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(
            fingerprint("hello world", "voice.wav"),
            fingerprint("hello world", "voice.wav")
        );
    }

    #[test]
    fn fingerprint_changes_with_text_and_voice() {
        let base = fingerprint("hello world", "voice.wav");
        assert_ne!(base, fingerprint("hello worlds", "voice.wav"));
        assert_ne!(base, fingerprint("hello world", "other.wav"));
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let clip = AudioClip {
            samples: vec![0.1, -0.2, 0.3],
            sample_rate: 24_000,
        };

        let fp = fingerprint("some text", "v");
        cache.store(7, &fp, &clip).unwrap();

        let loaded = cache.lookup(7, &fp).unwrap();
        assert_eq!(loaded.samples, clip.samples);

        // Same fingerprint at a different ordinal is a distinct entry.
        assert!(cache.lookup(8, &fp).is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let fp = fingerprint("text", "v");
        std::fs::write(dir.path().join(format!("chunk_0003_{fp}.wav")), b"junk").unwrap();
        assert!(cache.lookup(3, &fp).is_none());
    }

    #[test]
    fn clear_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let clip = AudioClip {
            samples: vec![0.0; 10],
            sample_rate: 24_000,
        };
        let fp = fingerprint("t", "v");
        cache.store(0, &fp, &clip).unwrap();
        cache.clear().unwrap();
        assert!(cache.lookup(0, &fp).is_none());
    }
}
