use std::path::{Path, PathBuf};
use std::time::Instant;

use audiobook_rs::{
    AudioClip, CancelToken, EngineConfigBuilder, GenerationParams, JobOutcome, Manifest,
    ModelKind, ModelLoader, RenderEngine, RenderError, SpeechModel, Transcriber,
};
use audiobook_rs::model::ClonedVoice;

/// Stand-in backend so the demo runs without an inference runtime: each
/// chunk becomes a short tone whose pitch is derived from the text. Wire a
/// real `ModelLoader` over your runtime of choice to render actual speech.
#[derive(Debug)]
struct ToneModel {
    kind: ModelKind,
}

impl SpeechModel for ToneModel {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn generate(
        &mut self,
        texts: &[String],
        _voice: &ClonedVoice<'_>,
        _params: &GenerationParams,
    ) -> Result<Vec<AudioClip>, RenderError> {
        Ok(texts.iter().map(|t| tone_for(t)).collect())
    }

    fn generate_design(
        &mut self,
        text: &str,
        style: &str,
        _params: &GenerationParams,
    ) -> Result<AudioClip, RenderError> {
        Ok(tone_for(&format!("{style}:{text}")))
    }
}

fn tone_for(text: &str) -> AudioClip {
    let sample_rate = 24_000u32;
    let freq = 220.0 + (text.len() % 16) as f32 * 27.5;
    let samples = (0..sample_rate as usize / 2)
        .map(|i| (i as f32 * freq * std::f32::consts::TAU / sample_rate as f32).sin() * 0.2)
        .collect();
    AudioClip {
        samples,
        sample_rate,
    }
}

struct ToneLoader;

impl ModelLoader for ToneLoader {
    fn load(&self, kind: ModelKind) -> Result<Box<dyn SpeechModel>, RenderError> {
        Ok(Box::new(ToneModel { kind }))
    }

    fn reclaim_device_memory(&self) {}
}

struct StubTranscriber;

impl Transcriber for StubTranscriber {
    fn transcribe(&mut self, _audio_path: &Path) -> Result<String, RenderError> {
        Ok("demo reference transcript".to_string())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let manifest_path = PathBuf::from(args.next().unwrap_or_else(|| "book.json".to_string()));
    let voice_path = PathBuf::from(args.next().unwrap_or_else(|| "voice.wav".to_string()));

    let manifest = Manifest::from_path(&manifest_path)?;
    println!(
        "Rendering '{}' by {} ({} chapters)",
        manifest.title,
        manifest.author,
        manifest.chapters.len()
    );

    let config = EngineConfigBuilder::default().build()?;
    let mut engine = RenderEngine::new(
        Box::new(ToneLoader),
        Box::new(|| Ok(Box::new(StubTranscriber) as Box<dyn Transcriber>)),
        config,
    )?;

    let cancel = CancelToken::new();
    let start = Instant::now();
    let outcome = engine.render_manifest(
        &manifest,
        &voice_path,
        &mut |p| print!("\rProgress: {:.0}%  ", p * 100.0),
        &cancel,
    )?;
    println!();

    match outcome {
        JobOutcome::Completed {
            deliverable,
            skipped_chunks,
        } => {
            println!("Done in {:.2?}: {}", start.elapsed(), deliverable.display());
            if !skipped_chunks.is_empty() {
                println!("Skipped chunks: {skipped_chunks:?}");
            }
        }
        JobOutcome::Stopped => println!("Render was stopped"),
    }
    Ok(())
}
