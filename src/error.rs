//! Crate-wide error taxonomy.
//!
//! Most variants abort a render job outright. The exception is
//! [`RenderError::DeviceExhausted`], which the batch scheduler catches per
//! batch: it reclaims device memory, skips that batch, and continues.

/// Errors surfaced by the rendering pipeline.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// A model failed to load; the lifecycle manager is left `Unloaded`.
    #[error("Failed to load {kind} model: {reason}")]
    ModelLoad { kind: String, reason: String },
    /// The accelerator ran out of working memory during generation.
    /// Recoverable per batch: the scheduler skips the batch and continues.
    #[error("Device memory exhausted: {0}")]
    DeviceExhausted(String),
    /// Generation failed for a batch for a reason other than memory.
    /// Also recoverable per batch.
    #[error("Generation failed: {0}")]
    Generation(String),
    /// Transcribing the voice reference failed. Fatal: without a transcript
    /// there is no usable voice reference.
    #[error("Transcription failed: {0}")]
    Transcription(String),
    /// The external muxer failed. Rendering succeeded; the per-chapter audio
    /// remains on disk for manual recovery.
    #[error("Muxing failed: {0}")]
    Muxing(String),
    /// Malformed manifest or unsupported input, detected at job start.
    #[error("Invalid input: {0}")]
    InputFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RenderError {
    /// True for errors the batch scheduler absorbs by skipping a batch
    /// rather than failing the job.
    pub fn is_batch_recoverable(&self) -> bool {
        matches!(
            self,
            RenderError::DeviceExhausted(_) | RenderError::Generation(_)
        )
    }
}
