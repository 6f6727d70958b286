//! # audiobook-rs
//!
//! A Rust library for turning long-form text (books) into narrated audio
//! with a voice-cloning text-to-speech backend.
//!
//! ## Features
//!
//! - **Chapter-aware rendering**: per-chapter tracks assembled into a single
//!   deliverable with embedded chapter markers
//! - **Resumable jobs**: every rendered chunk is cached on disk, keyed by
//!   content and voice identity, so interrupted renders pick up where they left off
//! - **Memory-disciplined**: one resident model at a time, batch-bounded device
//!   buffers, and periodic forced memory reclamation for multi-hour jobs
//! - **Reference preparation**: finds the densest-speech window in a raw
//!   recording and trims it into a clean voice reference clip
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! audiobook-rs = "0.3"
//! ```
//!
//! ```ignore
//! use audiobook_rs::{EngineConfigBuilder, Manifest, RenderEngine, CancelToken};
//!
//! let config = EngineConfigBuilder::default()
//!     .output_dir("output")
//!     .cache_dir("output/cache")
//!     .build()?;
//!
//! let mut engine = RenderEngine::new(loader, transcriber_factory, config)?;
//! let manifest = Manifest::from_path("book.json".as_ref())?;
//!
//! let cancel = CancelToken::new();
//! let outcome = engine.render_manifest(&manifest, "voice.wav".as_ref(), &mut |p| {
//!     println!("{:.0}%", p * 100.0);
//! }, &cancel)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod assemble;
pub mod error;
pub mod manifest;
pub mod model;
pub mod render;
pub mod text;
pub mod voice;

pub use assemble::{ChapterTrack, FfmpegMuxer, Muxer};
pub use error::RenderError;
pub use manifest::{Manifest, ManifestChapter};
pub use model::{
    GenerationParams, ModelKind, ModelLoader, ModelManager, SpeechModel, Transcriber,
    TranscriberFactory, VoicePrompt, VoiceReference,
};
pub use render::job::{
    CancelToken, EngineConfig, EngineConfigBuilder, JobOutcome, JobState, RenderEngine,
};
pub use text::Chunk;

use std::path::Path;

use crate::error::RenderError as Error;

/// A mono audio buffer with raw f32 samples and a sample rate.
///
/// All audio flowing through the pipeline (backend output, cached chunks,
/// chapter tracks, voice reference clips) is carried as an `AudioClip`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Raw audio samples as f32 values
    pub samples: Vec<f32>,
    /// Sample rate of the audio
    pub sample_rate: u32,
}

impl AudioClip {
    /// Create an empty clip at the given sample rate.
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Read a WAV file into a mono clip.
    ///
    /// Multi-channel input is downmixed by averaging across channels.
    /// Integer sample formats are converted to f32 in [-1, 1].
    pub fn read_wav(path: &Path) -> Result<Self, Error> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples = if channels <= 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
        })
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Duration of the audio in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    /// Append another clip's samples to this one.
    ///
    /// Both clips must share a sample rate; the pipeline keeps every chunk at
    /// the backend's output rate so this holds by construction.
    pub fn append(&mut self, other: &AudioClip) {
        debug_assert_eq!(self.sample_rate, other.sample_rate);
        self.samples.extend_from_slice(&other.samples);
    }
}

#[cfg(test)]
mod tests {
    use super::AudioClip;

    #[test]
    fn wav_round_trip_preserves_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");

        let clip = AudioClip {
            samples: vec![0.0, 0.5, -0.5, 1.0],
            sample_rate: 16_000,
        };
        clip.write_wav(&path).unwrap();

        let loaded = AudioClip::read_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate, 16_000);
        assert_eq!(loaded.samples, clip.samples);
    }

    #[test]
    fn duration_ms_matches_sample_count() {
        let clip = AudioClip {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
        };
        assert_eq!(clip.duration_ms(), 1000);
        assert!((clip.duration_secs() - 1.0).abs() < 1e-9);
    }
}
