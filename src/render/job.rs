//! The render job controller.
//!
//! Drives a manifest end-to-end: voice preparation, model residency,
//! per-chapter batch scheduling, chapter assembly, and final muxing.
//! Exactly one job runs at a time per [`RenderEngine`]; a separate control
//! thread may hold a clone of the [`CancelToken`] and request a graceful
//! stop, which takes effect at the next chapter or batch boundary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use derive_builder::Builder;

use crate::assemble::{self, ChapterTrack, FfmpegMuxer, Muxer};
use crate::error::RenderError;
use crate::manifest::{sanitize_filename, Manifest};
use crate::model::{
    ClonedVoice, GenerationParams, ModelKind, ModelLoader, ModelManager, TranscriberFactory,
    VoicePrompt, VoiceReference,
};
use crate::render::batch::run_batches;
use crate::render::cache::ChunkCache;
use crate::text::{sanitize, segment, Chunk};
use crate::voice;
use crate::AudioClip;

/// Cooperative cancellation flag, cloneable across threads.
///
/// Cancellation is checked at chapter and batch boundaries only; it never
/// interrupts an in-flight inference call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop at the next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for a new job.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Engine tunables. Defaults match the resource budget of a mid-range
/// single-accelerator machine.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct EngineConfig {
    /// Maximum characters per text chunk.
    #[builder(default = "500")]
    pub chunk_size: usize,
    /// Chunks per inference call; the main device-memory lever.
    #[builder(default = "3")]
    pub batch_size: usize,
    /// Forced device-memory reclamation runs every this many batches.
    #[builder(default = "8")]
    pub reclaim_interval: usize,
    /// Sampling parameters applied uniformly to every generation call.
    #[builder(default)]
    pub params: GenerationParams,
    /// Where deliverables and chapter tracks are written.
    #[builder(default = r#"PathBuf::from("output")"#)]
    pub output_dir: PathBuf,
    /// Where rendered chunk audio is cached between runs.
    #[builder(default = r#"PathBuf::from("output/cache")"#)]
    pub cache_dir: PathBuf,
}

/// Job state machine, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Preparing,
    Rendering,
    Completed,
    Stopped,
    Failed,
}

/// How a finished job ended.
///
/// Fatal errors are not an outcome; they surface as `Err(RenderError)` with
/// the cache left intact.
#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        /// Path to the muxed deliverable.
        deliverable: PathBuf,
        /// `(chapter id, chunk index)` pairs whose batch failed and was
        /// skipped; empty for a clean render.
        skipped_chunks: Vec<(u32, usize)>,
    },
    /// The job was cancelled; cached chunks remain on disk for resume.
    Stopped,
}

/// The one job-capable rendering engine for the process.
///
/// Owns the model lifecycle manager and the chunk cache; both assume
/// exclusive use, so create exactly one engine per process.
pub struct RenderEngine {
    manager: ModelManager,
    transcribers: Box<dyn TranscriberFactory>,
    muxer: Box<dyn Muxer>,
    cache: ChunkCache,
    config: EngineConfig,
    state: JobState,
}

impl RenderEngine {
    /// Create an engine with the default `ffmpeg` muxer.
    pub fn new(
        loader: Box<dyn ModelLoader>,
        transcribers: Box<dyn TranscriberFactory>,
        config: EngineConfig,
    ) -> Result<Self, RenderError> {
        Self::with_muxer(loader, transcribers, Box::new(FfmpegMuxer::default()), config)
    }

    /// Create an engine with a custom muxing capability.
    pub fn with_muxer(
        loader: Box<dyn ModelLoader>,
        transcribers: Box<dyn TranscriberFactory>,
        muxer: Box<dyn Muxer>,
        config: EngineConfig,
    ) -> Result<Self, RenderError> {
        std::fs::create_dir_all(&config.output_dir)?;
        let cache = ChunkCache::open(&config.cache_dir)?;
        Ok(Self {
            manager: ModelManager::new(loader),
            transcribers,
            muxer,
            cache,
            config,
            state: JobState::Idle,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Render a whole manifest into one chaptered deliverable.
    ///
    /// `progress` receives a monotonically non-decreasing fraction in [0, 1].
    pub fn render_manifest(
        &mut self,
        manifest: &Manifest,
        voice_path: &Path,
        progress: &mut dyn FnMut(f32),
        cancel: &CancelToken,
    ) -> Result<JobOutcome, RenderError> {
        self.state = JobState::Preparing;
        let result = self.render_manifest_inner(manifest, voice_path, progress, cancel);
        self.state = match &result {
            Ok(JobOutcome::Completed { .. }) => JobState::Completed,
            Ok(JobOutcome::Stopped) => JobState::Stopped,
            Err(_) => JobState::Failed,
        };
        result
    }

    fn render_manifest_inner(
        &mut self,
        manifest: &Manifest,
        voice_path: &Path,
        progress: &mut dyn FnMut(f32),
        cancel: &CancelToken,
    ) -> Result<JobOutcome, RenderError> {
        manifest.validate()?;
        log::info!(
            "Rendering '{}' by {} ({} chapters)",
            manifest.title,
            manifest.author,
            manifest.chapters.len()
        );

        // A preview may have left a different model resident; start clean.
        self.manager.unload();
        let (voice, prompt) = self.prepare_voice(voice_path)?;

        let book_dir = self
            .config
            .output_dir
            .join(sanitize_filename(&manifest.title));
        std::fs::create_dir_all(&book_dir)?;

        self.state = JobState::Rendering;
        let total_chapters = manifest.chapters.len();
        let mut tracks: Vec<ChapterTrack> = Vec::new();
        let mut skipped_chunks: Vec<(u32, usize)> = Vec::new();

        for (ci, chapter) in manifest.chapters.iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Render stopped by user before chapter {}", ci + 1);
                return Ok(JobOutcome::Stopped);
            }

            let text = sanitize(&chapter.text);
            if text.is_empty() {
                log::warn!("Skipping empty chapter: {}", chapter.label);
                continue;
            }

            log::info!(
                "Chapter {}/{}: {}",
                ci + 1,
                total_chapters,
                chapter.label
            );
            let chunks = styled_chunks(&text, &chapter.style_prompt, self.config.chunk_size);

            let chapter_base = ci as f32 / total_chapters as f32;
            let run = run_batches(
                &mut self.manager,
                &self.cache,
                &chunks,
                &voice,
                prompt.as_ref(),
                &self.config.params,
                self.config.batch_size,
                self.config.reclaim_interval,
                &mut |done, total| {
                    let within = done as f32 / total.max(1) as f32;
                    progress(chapter_base + within / total_chapters as f32);
                },
                cancel,
            )?;

            if run.cancelled {
                return Ok(JobOutcome::Stopped);
            }
            skipped_chunks.extend(run.skipped.iter().map(|&i| (chapter.id, i)));

            let Some(audio) = assemble::concat_in_order(&run.rendered) else {
                log::warn!("No audio generated for chapter {}", chapter.label);
                continue;
            };

            let filename = sanitize_filename(&format!("{:02}_{}.wav", chapter.id, chapter.label));
            let track_path = book_dir.join(filename);
            audio.write_wav(&track_path)?;
            log::info!(
                "Chapter track saved: {} ({:.1}s)",
                track_path.display(),
                audio.duration_secs()
            );
            tracks.push(ChapterTrack {
                title: chapter.label.clone(),
                path: track_path,
                duration_ms: audio.duration_ms(),
            });

            progress((ci + 1) as f32 / total_chapters as f32);
        }

        if tracks.is_empty() {
            return Err(RenderError::Generation(
                "no audio was generated for any chapter".to_string(),
            ));
        }

        let metadata = assemble::marker_metadata(&manifest.title, &manifest.author, &tracks);
        let metadata_path = book_dir.join("ffmetadata.txt");
        std::fs::write(&metadata_path, metadata)?;

        let deliverable = book_dir.join(format!(
            "{}.m4b",
            sanitize_filename(&manifest.title)
        ));
        let track_paths: Vec<PathBuf> = tracks.iter().map(|t| t.path.clone()).collect();
        self.muxer.mux(&track_paths, &metadata_path, &deliverable)?;

        if !skipped_chunks.is_empty() {
            log::warn!(
                "{} chunks were skipped after batch failures: {:?}",
                skipped_chunks.len(),
                skipped_chunks
            );
        }
        if let Err(e) = self.cache.clear() {
            log::warn!("Could not clear chunk cache: {e}");
        }

        progress(1.0);
        log::info!("Audiobook saved to {}", deliverable.display());
        Ok(JobOutcome::Completed {
            deliverable,
            skipped_chunks,
        })
    }

    /// Render plain text as one track, with no chapter markers.
    pub fn render_text(
        &mut self,
        title: &str,
        text: &str,
        voice_path: &Path,
        progress: &mut dyn FnMut(f32),
        cancel: &CancelToken,
    ) -> Result<JobOutcome, RenderError> {
        self.state = JobState::Preparing;
        let result = self.render_text_inner(title, text, voice_path, progress, cancel);
        self.state = match &result {
            Ok(JobOutcome::Completed { .. }) => JobState::Completed,
            Ok(JobOutcome::Stopped) => JobState::Stopped,
            Err(_) => JobState::Failed,
        };
        result
    }

    fn render_text_inner(
        &mut self,
        title: &str,
        text: &str,
        voice_path: &Path,
        progress: &mut dyn FnMut(f32),
        cancel: &CancelToken,
    ) -> Result<JobOutcome, RenderError> {
        let text = sanitize(text);
        if text.is_empty() {
            return Err(RenderError::InputFormat("input text is empty".to_string()));
        }

        self.manager.unload();
        let (voice, prompt) = self.prepare_voice(voice_path)?;
        let chunks = segment(&text, self.config.chunk_size);
        log::info!("Rendering {} chunks", chunks.len());

        self.state = JobState::Rendering;
        let run = run_batches(
            &mut self.manager,
            &self.cache,
            &chunks,
            &voice,
            prompt.as_ref(),
            &self.config.params,
            self.config.batch_size,
            self.config.reclaim_interval,
            &mut |done, total| progress(done as f32 / total.max(1) as f32),
            cancel,
        )?;
        if run.cancelled {
            return Ok(JobOutcome::Stopped);
        }

        let audio = assemble::concat_in_order(&run.rendered).ok_or_else(|| {
            RenderError::Generation("no audio was generated".to_string())
        })?;

        // Persisted beside the deliverable, like chapter tracks in manifest
        // mode; the deliverable itself is the markerless track concat.
        let safe_title = sanitize_filename(title);
        let track_path = self
            .config
            .output_dir
            .join(format!("{safe_title}_track.wav"));
        audio.write_wav(&track_path)?;
        let track = ChapterTrack {
            title: title.to_string(),
            path: track_path,
            duration_ms: audio.duration_ms(),
        };

        let deliverable = self
            .config
            .output_dir
            .join(format!("{safe_title}_audiobook.wav"));
        assemble::concat_tracks_single(&[track], &deliverable)?;

        if let Err(e) = self.cache.clear() {
            log::warn!("Could not clear chunk cache: {e}");
        }
        progress(1.0);
        Ok(JobOutcome::Completed {
            deliverable,
            skipped_chunks: run.skipped.iter().map(|&i| (0, i)).collect(),
        })
    }

    /// Generate a short voice-design preview from a style description.
    pub fn design_preview(&mut self, text: &str, style: &str) -> Result<PathBuf, RenderError> {
        let params = self.config.params.clone();
        let model = self.manager.ensure(ModelKind::Design)?;
        let clip = model.generate_design(text, style, &params)?;

        let path = self.config.output_dir.join("preview_design.wav");
        clip.write_wav(&path)?;
        Ok(path)
    }

    /// Generate a short voice-clone preview against a reference recording.
    pub fn clone_preview(&mut self, text: &str, voice_path: &Path) -> Result<PathBuf, RenderError> {
        let prepared_path = self.prepare_reference_file(voice_path)?;
        let transcript = self.transcribe(&prepared_path)?;
        let voice = VoiceReference::new(prepared_path, transcript);

        let params = self.config.params.clone();
        let model = self.manager.ensure(ModelKind::Clone)?;
        let clips = model.generate(
            &[text.to_string()],
            &ClonedVoice::Reference(&voice),
            &params,
        )?;
        let clip = clips.into_iter().next().ok_or_else(|| {
            RenderError::Generation("model returned no waveform".to_string())
        })?;

        let path = self.config.output_dir.join("preview_clone.wav");
        clip.write_wav(&path)?;
        Ok(path)
    }

    /// Prepare the reference recording, transcribe it, and precompute the
    /// voice prompt if the render model supports it.
    fn prepare_voice(
        &mut self,
        voice_path: &Path,
    ) -> Result<(VoiceReference, Option<VoicePrompt>), RenderError> {
        let prepared_path = self.prepare_reference_file(voice_path)?;
        let transcript = self.transcribe(&prepared_path)?;
        let voice = VoiceReference::new(prepared_path, transcript);

        let model = self.manager.ensure(ModelKind::Render)?;
        let prompt = if model.supports_voice_prompt() {
            match model.precompute_voice_prompt(&voice) {
                Ok(p) => {
                    log::info!("Voice prompt precomputed");
                    Some(p)
                }
                Err(e) => {
                    log::warn!("Voice prompt precomputation skipped: {e}");
                    None
                }
            }
        } else {
            None
        };
        Ok((voice, prompt))
    }

    /// Condition the raw reference recording (resample, loudness, best
    /// speech window, silence strip) and persist it next to the outputs.
    ///
    /// The prepared file is named after the source recording so cache
    /// fingerprints stay distinct per voice.
    fn prepare_reference_file(&self, voice_path: &Path) -> Result<PathBuf, RenderError> {
        let raw = AudioClip::read_wav(voice_path)?;
        let (prepared, start_secs) = voice::prepare_reference(&raw, voice::DEFAULT_TARGET_MS);
        log::info!(
            "Voice reference prepared: {:.1}s selected from offset {:.1}s",
            prepared.duration_secs(),
            start_secs
        );

        let stem = voice_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice".to_string());
        let prepared_path = self
            .config
            .output_dir
            .join(sanitize_filename(&format!("{stem}_prepared.wav")));
        prepared.write_wav(&prepared_path)?;
        Ok(prepared_path)
    }

    fn transcribe(&mut self, voice_path: &Path) -> Result<String, RenderError> {
        log::info!("Transcribing voice reference {}", voice_path.display());
        let mut transcriber = self.transcribers.create()?;
        let transcript = transcriber.transcribe(voice_path).map_err(|e| match e {
            RenderError::Transcription(_) => e,
            other => RenderError::Transcription(other.to_string()),
        })?;
        // Release the transcriber's resident resources before a model load.
        drop(transcriber);
        self.manager.reclaim();
        Ok(transcript.trim().to_string())
    }
}

/// Segment chapter text and prepend the chapter's style instruction to each
/// chunk's generated text.
fn styled_chunks(text: &str, style_prompt: &str, chunk_size: usize) -> Vec<Chunk> {
    let mut chunks = segment(text, chunk_size);
    let style = style_prompt.trim();
    if !style.is_empty() {
        for chunk in chunks.iter_mut() {
            chunk.text = format!("{style}\n\n{}", chunk.text);
        }
    }
    chunks
}
