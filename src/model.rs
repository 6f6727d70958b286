//! Model lifecycle management and external capability seams.
//!
//! The inference engine, the transcriber and their device memory are
//! external collaborators, reached through the [`SpeechModel`],
//! [`ModelLoader`] and [`Transcriber`] traits. The [`ModelManager`] enforces
//! the single invariant the whole pipeline leans on: at most one model is
//! resident at a time, and swapping is always unload-then-load with a
//! deterministic memory reclamation in between.

use std::path::{Path, PathBuf};

use crate::error::RenderError;
use crate::AudioClip;

/// The three recognised model kinds.
///
/// `Design` and `Clone` are the larger interactive models used for voice
/// previews; `Render` is the smaller model optimised for long-form batch
/// throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Text + style description → waveform.
    Design,
    /// Text + reference audio → waveform, for short interactive previews.
    Clone,
    /// Optimised for long-form batch rendering.
    Render,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Design => write!(f, "design"),
            ModelKind::Clone => write!(f, "clone"),
            ModelKind::Render => write!(f, "render"),
        }
    }
}

/// Sampling parameters passed uniformly to every generation call in a job.
///
/// `max_new_tokens` caps generated length per chunk to bound worst-case
/// latency and stop runaway generation.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
    pub max_new_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 20,
            repetition_penalty: 1.05,
            max_new_tokens: 4096,
        }
    }
}

/// A prepared voice reference: the clip on disk plus its transcript.
///
/// Owned by the job controller for the duration of one job. The identity
/// string participates in cache fingerprints so cached audio from one voice
/// is never replayed for another.
#[derive(Debug, Clone)]
pub struct VoiceReference {
    pub path: PathBuf,
    pub transcript: String,
    /// Stable identifier for this voice, derived from the reference file name.
    pub identity: String,
}

impl VoiceReference {
    pub fn new(path: PathBuf, transcript: String) -> Self {
        let identity = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice".to_string());
        Self {
            path,
            transcript,
            identity,
        }
    }
}

/// An opaque precomputed voice embedding.
///
/// Produced once per job by models that support prompt precomputation and
/// reused for every batch, saving the per-batch reference encoding cost.
#[derive(Debug, Clone)]
pub struct VoicePrompt(pub Vec<f32>);

/// The voice conditioning for a generation call: either the raw reference
/// or a precomputed prompt.
#[derive(Debug)]
pub enum ClonedVoice<'a> {
    Reference(&'a VoiceReference),
    Prompt(&'a VoicePrompt),
}

/// A loaded, device-resident inference model.
///
/// Implementations wrap whatever inference runtime actually executes the
/// neural model; dropping the value must release its device memory.
pub trait SpeechModel: std::fmt::Debug {
    /// Which kind this model was loaded as.
    fn kind(&self) -> ModelKind;

    /// Whether this model can precompute a reusable voice prompt.
    ///
    /// Queried once per job; callers must not probe repeatedly.
    fn supports_voice_prompt(&self) -> bool {
        false
    }

    /// Precompute a voice prompt from a reference.
    ///
    /// Only valid when [`supports_voice_prompt`](Self::supports_voice_prompt)
    /// returns true.
    fn precompute_voice_prompt(
        &mut self,
        reference: &VoiceReference,
    ) -> Result<VoicePrompt, RenderError> {
        let _ = reference;
        Err(RenderError::Generation(
            "model does not support voice prompt precomputation".to_string(),
        ))
    }

    /// Generate one waveform per input text, conditioned on the given voice.
    fn generate(
        &mut self,
        texts: &[String],
        voice: &ClonedVoice<'_>,
        params: &GenerationParams,
    ) -> Result<Vec<AudioClip>, RenderError>;

    /// Generate a waveform from text and a style description (design kind).
    fn generate_design(
        &mut self,
        text: &str,
        style: &str,
        params: &GenerationParams,
    ) -> Result<AudioClip, RenderError>;
}

/// Loads models onto the device and reclaims its memory.
pub trait ModelLoader {
    fn load(&self, kind: ModelKind) -> Result<Box<dyn SpeechModel>, RenderError>;

    /// Force a full device-memory reclamation pass and synchronise.
    ///
    /// Called after unloads and periodically during long jobs to counteract
    /// allocator fragmentation.
    fn reclaim_device_memory(&self);
}

/// Speech-to-text capability used to transcribe the voice reference.
///
/// Implementations hold their own resident resources; the job controller
/// drops the transcriber immediately after use to free them before the
/// render model loads.
pub trait Transcriber {
    fn transcribe(&mut self, audio_path: &Path) -> Result<String, RenderError>;
}

/// Creates transcribers on demand.
///
/// The transcriber is heavyweight (it holds its own model), so the job
/// controller creates one just-in-time and drops it as soon as the
/// transcript is in hand.
pub trait TranscriberFactory {
    fn create(&self) -> Result<Box<dyn Transcriber>, RenderError>;
}

impl<F> TranscriberFactory for F
where
    F: Fn() -> Result<Box<dyn Transcriber>, RenderError>,
{
    fn create(&self) -> Result<Box<dyn Transcriber>, RenderError> {
        self()
    }
}

/// Owns the single resident model and its swaps.
///
/// No other component may hold a model reference across a swap; callers
/// borrow the model through the manager for the duration of each call.
pub struct ModelManager {
    loader: Box<dyn ModelLoader>,
    active: Option<Box<dyn SpeechModel>>,
}

impl ModelManager {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            active: None,
        }
    }

    /// The kind of the resident model, if any.
    pub fn loaded_kind(&self) -> Option<ModelKind> {
        self.active.as_ref().map(|m| m.kind())
    }

    /// Make sure a model of `kind` is resident, swapping if necessary.
    ///
    /// A no-op when the requested kind is already loaded. On load failure
    /// the manager is left unloaded and the error propagates; callers must
    /// call `ensure` again before further use.
    pub fn ensure(&mut self, kind: ModelKind) -> Result<&mut (dyn SpeechModel + 'static), RenderError> {
        if self.loaded_kind() != Some(kind) {
            self.unload();
            log::info!("Loading {kind} model");
            let model = self.loader.load(kind).map_err(|e| RenderError::ModelLoad {
                kind: kind.to_string(),
                reason: e.to_string(),
            })?;
            self.active = Some(model);
        }
        self.active
            .as_deref_mut()
            .ok_or_else(|| RenderError::ModelLoad {
                kind: kind.to_string(),
                reason: "model not resident".to_string(),
            })
    }

    /// Drop the resident model and reclaim its device memory.
    pub fn unload(&mut self) {
        if let Some(model) = self.active.take() {
            log::debug!("Unloading {} model", model.kind());
            drop(model);
            self.loader.reclaim_device_memory();
        }
    }

    /// Force a device-memory reclamation pass without touching the model.
    pub fn reclaim(&self) {
        self.loader.reclaim_device_memory();
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.unload();
    }
}
