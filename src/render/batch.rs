//! Batch scheduling.
//!
//! Groups pending chunks into fixed-size batches, reorders them by text
//! length so each batch carries similar computational load, and resolves
//! every chunk either from the cache or from one inference call per batch.
//! Device memory stays bounded: outputs are persisted and released batch by
//! batch, and a full reclamation pass runs at a fixed batch interval to
//! counteract allocator fragmentation.

use std::collections::BTreeMap;

use crate::error::RenderError;
use crate::model::{ClonedVoice, GenerationParams, ModelKind, ModelManager, VoicePrompt, VoiceReference};
use crate::render::cache::{fingerprint, ChunkCache};
use crate::render::job::CancelToken;
use crate::text::Chunk;
use crate::AudioClip;

/// Outcome of scheduling one chunk list through the model.
#[derive(Debug)]
pub struct BatchRun {
    /// Rendered audio keyed by original chunk index.
    pub rendered: BTreeMap<usize, AudioClip>,
    /// Indices whose batch failed; reported, never retried within the run.
    pub skipped: Vec<usize>,
    /// True when the run stopped at a cancellation checkpoint. Partial
    /// results are kept (and remain cached on disk).
    pub cancelled: bool,
}

/// Render `chunks` through the resident model, consulting the cache first.
///
/// `progress` is called with the cumulative count of completed chunks out of
/// the non-empty total. Cancellation is checked before each batch.
///
/// Per-batch failures (device exhaustion or generation errors) are absorbed:
/// the batch is skipped after a forced memory reclamation and the job
/// continues. Model load failures propagate.
#[allow(clippy::too_many_arguments)]
pub fn run_batches(
    manager: &mut ModelManager,
    cache: &ChunkCache,
    chunks: &[Chunk],
    voice: &VoiceReference,
    prompt: Option<&VoicePrompt>,
    params: &GenerationParams,
    batch_size: usize,
    reclaim_interval: usize,
    progress: &mut dyn FnMut(usize, usize),
    cancel: &CancelToken,
) -> Result<BatchRun, RenderError> {
    let mut pending: Vec<&Chunk> = chunks.iter().filter(|c| !c.text.trim().is_empty()).collect();
    let total = pending.len();

    // Longest first: batches then hold similarly sized texts, which evens
    // out padding waste in batched generation. Original order is restored
    // by index at assembly time.
    pending.sort_by(|a, b| b.text.len().cmp(&a.text.len()));

    let mut rendered: BTreeMap<usize, AudioClip> = BTreeMap::new();
    let mut skipped: Vec<usize> = Vec::new();
    let mut completed = 0usize;
    let batch_size = batch_size.max(1);

    for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            log::info!("Render cancelled at batch boundary; progress saved");
            return Ok(BatchRun {
                rendered,
                skipped,
                cancelled: true,
            });
        }

        // Cache pass: anything already rendered for this text and voice is
        // reused byte-for-byte.
        let mut missing: Vec<(&Chunk, String)> = Vec::new();
        for chunk in batch {
            let fp = fingerprint(&chunk.text, &voice.identity);
            if let Some(clip) = cache.lookup(chunk.index, &fp) {
                log::debug!("Chunk {} served from cache", chunk.index);
                rendered.insert(chunk.index, clip);
                completed += 1;
                progress(completed, total);
            } else {
                missing.push((chunk, fp));
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(c, _)| c.text.clone()).collect();
            let cloned_voice = match prompt {
                Some(p) => ClonedVoice::Prompt(p),
                None => ClonedVoice::Reference(voice),
            };

            let model = manager.ensure(ModelKind::Render)?;
            match model.generate(&texts, &cloned_voice, params) {
                Ok(clips) if clips.len() == texts.len() => {
                    for ((chunk, fp), clip) in missing.iter().zip(clips) {
                        // Persist before moving on so an interruption after
                        // this point costs nothing on resume.
                        cache.store(chunk.index, fp, &clip)?;
                        rendered.insert(chunk.index, clip);
                        completed += 1;
                        progress(completed, total);
                    }
                }
                Ok(clips) => {
                    log::error!(
                        "Model returned {} waveforms for {} texts; skipping batch {}",
                        clips.len(),
                        texts.len(),
                        batch_no + 1
                    );
                    skipped.extend(missing.iter().map(|(c, _)| c.index));
                }
                Err(e) if e.is_batch_recoverable() => {
                    log::error!("Batch {} failed, skipping and continuing: {e}", batch_no + 1);
                    manager.reclaim();
                    skipped.extend(missing.iter().map(|(c, _)| c.index));
                }
                Err(e) => return Err(e),
            }
        }

        if reclaim_interval > 0 && (batch_no + 1) % reclaim_interval == 0 {
            log::debug!("Periodic device-memory reclamation after batch {}", batch_no + 1);
            manager.reclaim();
        }
    }

    skipped.sort_unstable();
    Ok(BatchRun {
        rendered,
        skipped,
        cancelled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{clip_for_text, FakeLoader};
    use crate::model::{ModelManager, VoiceReference};
    use crate::render::cache::ChunkCache;
    use std::path::PathBuf;

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            index,
            text: text.to_string(),
        }
    }

    fn voice() -> VoiceReference {
        VoiceReference::new(PathBuf::from("voice.wav"), "hi".to_string())
    }

    fn run(
        manager: &mut ModelManager,
        cache: &ChunkCache,
        chunks: &[Chunk],
        batch_size: usize,
        cancel: &CancelToken,
    ) -> BatchRun {
        run_batches(
            manager,
            cache,
            chunks,
            &voice(),
            None,
            &GenerationParams::default(),
            batch_size,
            8,
            &mut |_, _| {},
            cancel,
        )
        .unwrap()
    }

    #[test]
    fn renders_all_chunks_in_index_map() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let (loader, stats) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));

        let chunks = vec![chunk(0, "short"), chunk(1, "a medium chunk"), chunk(2, "the longest chunk of all three")];
        let out = run(&mut manager, &cache, &chunks, 2, &CancelToken::new());

        assert_eq!(out.rendered.len(), 3);
        assert!(out.skipped.is_empty());
        assert!(!out.cancelled);
        // 3 chunks with batch_size 2 → 2 generate calls.
        assert_eq!(stats.borrow().generate_calls, 2);
        // Longest text was scheduled first.
        assert_eq!(
            stats.borrow().generated_texts[0],
            "the longest chunk of all three"
        );
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let (loader, _stats) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));

        let chunks = vec![chunk(0, "text"), chunk(1, "   "), chunk(2, "")];
        let out = run(&mut manager, &cache, &chunks, 3, &CancelToken::new());
        assert_eq!(out.rendered.len(), 1);
        assert!(out.rendered.contains_key(&0));
    }

    #[test]
    fn second_run_reuses_cache_without_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let chunks = vec![chunk(0, "alpha"), chunk(1, "beta"), chunk(2, "gamma")];

        let (loader, _) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));
        let first = run(&mut manager, &cache, &chunks, 2, &CancelToken::new());

        let (loader2, stats2) = FakeLoader::new();
        let mut manager2 = ModelManager::new(Box::new(loader2));
        let second = run(&mut manager2, &cache, &chunks, 2, &CancelToken::new());

        assert_eq!(stats2.borrow().generate_calls, 0);
        for idx in 0..3usize {
            assert_eq!(first.rendered[&idx].samples, second.rendered[&idx].samples);
        }
    }

    #[test]
    fn interrupted_run_resumes_with_only_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let chunks: Vec<Chunk> = (0..6).map(|i| chunk(i, &format!("chunk number {i}"))).collect();

        // First run: cancel after the first batch completes.
        let cancel = CancelToken::new();
        let (loader, stats) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));
        let out = run_batches(
            &mut manager,
            &cache,
            &chunks,
            &voice(),
            None,
            &GenerationParams::default(),
            3,
            8,
            &mut |done, _| {
                if done == 3 {
                    cancel.cancel();
                }
            },
            &cancel,
        )
        .unwrap();
        assert!(out.cancelled);
        assert_eq!(out.rendered.len(), 3);
        let first_calls = stats.borrow().generate_calls;
        assert_eq!(first_calls, 1);

        // Second run finishes the job, generating only the other batch.
        let (loader2, stats2) = FakeLoader::new();
        let mut manager2 = ModelManager::new(Box::new(loader2));
        let out2 = run(&mut manager2, &cache, &chunks, 3, &CancelToken::new());
        assert!(!out2.cancelled);
        assert_eq!(out2.rendered.len(), 6);
        assert_eq!(stats2.borrow().generate_calls, 1);
    }

    #[test]
    fn failed_batch_is_skipped_and_rest_continues() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let (mut loader, stats) = FakeLoader::new();
        // The longest chunk OOMs, taking its whole batch down with it.
        loader.oom_texts = vec!["this text is the longest and will fail".to_string()];
        let mut manager = ModelManager::new(Box::new(loader));

        let chunks = vec![
            chunk(0, "this text is the longest and will fail"),
            chunk(1, "second longest text here"),
            chunk(2, "short one"),
            chunk(3, "tiny"),
        ];
        let out = run(&mut manager, &cache, &chunks, 2, &CancelToken::new());

        // Batch 1 (indices 0, 1 by length order) skipped; batch 2 rendered.
        assert_eq!(out.skipped, vec![0, 1]);
        assert_eq!(out.rendered.len(), 2);
        assert!(out.rendered.contains_key(&2));
        assert!(out.rendered.contains_key(&3));
        // Failure forced a reclamation pass.
        assert!(stats.borrow().unload_reclaims >= 1);
    }

    #[test]
    fn reclamation_runs_at_the_configured_batch_interval() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let (loader, stats) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));

        let chunks: Vec<Chunk> = (0..4).map(|i| chunk(i, &format!("chunk number {i}"))).collect();
        let out = run_batches(
            &mut manager,
            &cache,
            &chunks,
            &voice(),
            None,
            &GenerationParams::default(),
            1,
            1,
            &mut |_, _| {},
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(out.rendered.len(), 4);
        // One pass after every batch, and nothing failed to force extras.
        assert_eq!(stats.borrow().generate_calls, 4);
        assert_eq!(stats.borrow().unload_reclaims, 4);
    }

    #[test]
    fn cached_audio_is_byte_identical_to_generated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(dir.path()).unwrap();
        let chunks = vec![chunk(0, "stable text")];

        let (loader, _) = FakeLoader::new();
        let mut manager = ModelManager::new(Box::new(loader));
        let out = run(&mut manager, &cache, &chunks, 1, &CancelToken::new());

        let expected = clip_for_text("stable text");
        assert_eq!(out.rendered[&0].samples, expected.samples);

        // And the cache file round-trips the same samples.
        let fp = fingerprint("stable text", &voice().identity);
        let cached = cache.lookup(0, &fp).unwrap();
        assert_eq!(cached.samples, expected.samples);
    }
}
