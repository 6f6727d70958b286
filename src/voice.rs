//! Voice reference preparation.
//!
//! Turns a raw recording into a clean reference clip for voice cloning:
//! resample to the rate the inference engine expects, normalise loudness,
//! find the densest-speech window in long recordings, and trim the edges of
//! silence.

use crate::AudioClip;

/// Sample rate expected by the inference engine for reference audio.
pub const REFERENCE_SAMPLE_RATE: u32 = 16_000;

/// Default window length for best-segment selection, in milliseconds.
pub const DEFAULT_TARGET_MS: u64 = 15_000;

/// Loudness target for reference clips.
const TARGET_DBFS: f32 = -20.0;

/// Energy analysis frame width.
const FRAME_MS: u64 = 10;

/// Fraction of peak RMS above which a frame counts as speech.
const SPEECH_THRESHOLD: f32 = 0.1;

/// Sliding-window stride for segment selection.
const STRIDE_MS: u64 = 1_000;

/// Edge-trim silence threshold.
const SILENCE_DBFS: f32 = -40.0;

/// Padding kept around the detected speech region when trimming.
const PADDING_MS: u64 = 100;

/// Fade applied to trimmed edges to avoid clicks.
const FADE_MS: u64 = 50;

/// Prepare a raw recording as a voice reference clip.
///
/// The clip is resampled to 16 kHz mono and loudness-normalised to −20 dBFS.
/// If it is longer than `target_ms`, the densest-speech window of that length
/// is selected first; either way leading and trailing silence is stripped.
///
/// Returns the prepared clip and the selected window's start offset in
/// seconds within the original recording (0.0 when no windowing was needed).
pub fn prepare_reference(clip: &AudioClip, target_ms: u64) -> (AudioClip, f64) {
    let mut clip = resample(clip, REFERENCE_SAMPLE_RATE);
    normalize_loudness(&mut clip, TARGET_DBFS);

    if clip.duration_ms() <= target_ms {
        log::debug!("Reference already within target duration, trimming only");
        return (strip_silence(&clip, SILENCE_DBFS, PADDING_MS), 0.0);
    }

    let (segment, start_secs) = select_best_segment(&clip, target_ms);
    log::info!(
        "Selected {:.1}s reference window starting at {:.1}s",
        segment.duration_secs(),
        start_secs
    );
    (strip_silence(&segment, SILENCE_DBFS, PADDING_MS), start_secs)
}

/// Find the window of `target_ms` with the highest speech score.
///
/// Scoring per window: 0.7 × speech density (fraction of 10 ms frames whose
/// normalised RMS exceeds 0.1) + 0.3 × continuity (1 / (1 + 0.1 ×
/// threshold-crossing count)). Windows are scanned chronologically at a one
/// second stride; strict greater-than comparison keeps the earliest window
/// on ties.
pub fn select_best_segment(clip: &AudioClip, target_ms: u64) -> (AudioClip, f64) {
    let frame_len = (clip.sample_rate as u64 * FRAME_MS / 1000) as usize;
    let rms = frame_rms(&clip.samples, frame_len.max(1));
    let num_frames = rms.len();

    // Normalise energies to [0, 1] of the peak.
    let peak = rms.iter().cloned().fold(0.0f32, f32::max);
    let rms: Vec<f32> = if peak > 0.0 {
        rms.iter().map(|v| v / peak).collect()
    } else {
        rms
    };

    let window_frames = (target_ms / FRAME_MS) as usize;
    let stride_frames = (STRIDE_MS / FRAME_MS) as usize;

    let mut best_score = -1.0f32;
    let mut best_start = 0usize;

    let scan_end = num_frames.saturating_sub(window_frames) + 1;
    let mut start = 0;
    while start < scan_end.max(1) {
        let end = (start + window_frames).min(num_frames);
        let window = &rms[start..end];

        let speech_frames = window.iter().filter(|&&v| v > SPEECH_THRESHOLD).count();
        let density = if window.is_empty() {
            0.0
        } else {
            speech_frames as f32 / window.len() as f32
        };

        let transitions = window
            .windows(2)
            .filter(|pair| (pair[0] > SPEECH_THRESHOLD) != (pair[1] > SPEECH_THRESHOLD))
            .count();
        let continuity = 1.0 / (1.0 + transitions as f32 * 0.1);

        let score = 0.7 * density + 0.3 * continuity;
        if score > best_score {
            best_score = score;
            best_start = start;
        }

        start += stride_frames;
    }

    let start_sample = best_start * frame_len;
    let end_sample = (start_sample + window_frames * frame_len).min(clip.samples.len());
    let segment = AudioClip {
        samples: clip.samples[start_sample..end_sample].to_vec(),
        sample_rate: clip.sample_rate,
    };
    let start_secs = start_sample as f64 / clip.sample_rate as f64;
    (segment, start_secs)
}

/// Strip leading and trailing silence, keeping `padding_ms` of margin and
/// applying short fades to the new edges.
///
/// A clip with no frame above the threshold is returned unchanged.
pub fn strip_silence(clip: &AudioClip, threshold_dbfs: f32, padding_ms: u64) -> AudioClip {
    let frame_len = (clip.sample_rate as u64 * FRAME_MS / 1000).max(1) as usize;
    let rms = frame_rms(&clip.samples, frame_len);

    let loud = |v: &f32| dbfs(*v) > threshold_dbfs;
    let first = rms.iter().position(loud);
    let last = rms.iter().rposition(loud);

    let (first, last) = match (first, last) {
        (Some(f), Some(l)) => (f, l),
        _ => return clip.clone(),
    };

    let padding = (clip.sample_rate as u64 * padding_ms / 1000) as usize;
    let start = (first * frame_len).saturating_sub(padding);
    let end = ((last + 1) * frame_len + padding).min(clip.samples.len());

    let mut trimmed = AudioClip {
        samples: clip.samples[start..end].to_vec(),
        sample_rate: clip.sample_rate,
    };
    apply_fades(&mut trimmed, FADE_MS);
    trimmed
}

/// Scale the clip so its overall RMS level sits at `target_dbfs`.
pub fn normalize_loudness(clip: &mut AudioClip, target_dbfs: f32) {
    let rms = overall_rms(&clip.samples);
    if rms <= 0.0 {
        return;
    }
    let gain_db = target_dbfs - dbfs(rms);
    let gain = 10f32.powf(gain_db / 20.0);
    for s in clip.samples.iter_mut() {
        *s *= gain;
    }
}

/// Resample to `target_rate` by linear interpolation.
pub fn resample(clip: &AudioClip, target_rate: u32) -> AudioClip {
    if clip.sample_rate == target_rate || clip.samples.is_empty() {
        return AudioClip {
            samples: clip.samples.clone(),
            sample_rate: target_rate,
        };
    }

    let ratio = clip.sample_rate as f64 / target_rate as f64;
    let out_len = (clip.samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = clip.samples[idx];
        let b = clip.samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }

    AudioClip {
        samples: out,
        sample_rate: target_rate,
    }
}

/// RMS energy per fixed-width frame; a trailing partial frame is dropped.
fn frame_rms(samples: &[f32], frame_len: usize) -> Vec<f32> {
    samples
        .chunks_exact(frame_len)
        .map(|frame| overall_rms(frame))
        .collect()
}

fn overall_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Decibels relative to full scale (1.0) for an amplitude value.
fn dbfs(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * amplitude.log10()
}

fn apply_fades(clip: &mut AudioClip, fade_ms: u64) {
    let fade_len = ((clip.sample_rate as u64 * fade_ms / 1000) as usize).min(clip.samples.len() / 2);
    if fade_len == 0 {
        return;
    }
    let n = clip.samples.len();
    for i in 0..fade_len {
        let t = (i + 1) as f32 / (fade_len + 1) as f32;
        clip.samples[i] *= t;
        clip.samples[n - 1 - i] *= t;
    }
}
