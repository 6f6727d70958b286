//! Chapter assembly and deliverable muxing.
//!
//! Stitches per-chunk audio into per-chapter tracks in original chunk order,
//! derives the chapter-marker metadata document, and hands the ordered
//! tracks to an external muxer for the final container file.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::RenderError;
use crate::AudioClip;

/// One rendered chapter: its title and the persisted track on disk.
#[derive(Debug, Clone)]
pub struct ChapterTrack {
    pub title: String,
    pub path: PathBuf,
    pub duration_ms: u64,
}

/// Concatenate chunk audio strictly by original chunk index.
///
/// The map is keyed by index, so iteration order is the narrative order no
/// matter which batches finished first. Returns `None` when nothing was
/// rendered for the chapter.
pub fn concat_in_order(rendered: &BTreeMap<usize, AudioClip>) -> Option<AudioClip> {
    let mut iter = rendered.values();
    let first = iter.next()?;
    let mut track = AudioClip {
        samples: Vec::with_capacity(rendered.values().map(|c| c.samples.len()).sum()),
        sample_rate: first.sample_rate,
    };
    track.append(first);
    for clip in iter {
        track.append(clip);
    }
    Some(track)
}

/// Build the FFMETADATA1 marker document for a list of chapter tracks.
///
/// One `[CHAPTER]` block per track with a millisecond timebase and
/// cumulative start/end offsets; the last chapter's end is its own start
/// plus its duration.
pub fn marker_metadata(title: &str, author: &str, tracks: &[ChapterTrack]) -> String {
    let mut doc = String::from(";FFMETADATA1\n");
    let _ = writeln!(doc, "title={title}");
    let _ = writeln!(doc, "artist={author}");
    doc.push('\n');

    let mut cursor_ms: u64 = 0;
    for track in tracks {
        let start = cursor_ms;
        let end = cursor_ms + track.duration_ms;
        doc.push_str("[CHAPTER]\n");
        doc.push_str("TIMEBASE=1/1000\n");
        let _ = writeln!(doc, "START={start}");
        let _ = writeln!(doc, "END={end}");
        let _ = writeln!(doc, "title={}", track.title);
        doc.push('\n');
        cursor_ms = end;
    }
    doc
}

/// Concatenate chapter tracks into one plain audio file with no markers
/// (single-file mode).
pub fn concat_tracks_single(tracks: &[ChapterTrack], output: &Path) -> Result<PathBuf, RenderError> {
    let mut combined: Option<AudioClip> = None;
    for track in tracks {
        let clip = AudioClip::read_wav(&track.path)?;
        match combined.as_mut() {
            Some(c) => c.append(&clip),
            None => combined = Some(clip),
        }
    }
    let combined = combined.ok_or_else(|| {
        RenderError::InputFormat("no chapter tracks to concatenate".to_string())
    })?;
    combined.write_wav(output)?;
    Ok(output.to_path_buf())
}

/// External container-muxing capability.
///
/// Given ordered track files, a marker-metadata document and an output
/// path, produce one container file with embedded chapter navigation.
pub trait Muxer {
    fn mux(
        &self,
        tracks: &[PathBuf],
        metadata: &Path,
        output: &Path,
    ) -> Result<(), RenderError>;
}

/// `ffmpeg`-based muxer producing an AAC audiobook container.
pub struct FfmpegMuxer {
    /// Audio bitrate passed to the encoder. 64k is plenty for speech.
    pub bitrate: String,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self {
            bitrate: "64k".to_string(),
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(
        &self,
        tracks: &[PathBuf],
        metadata: &Path,
        output: &Path,
    ) -> Result<(), RenderError> {
        let work_dir = metadata
            .parent()
            .ok_or_else(|| RenderError::Muxing("metadata path has no parent".to_string()))?;
        let concat_list = work_dir.join("concat_list.txt");

        let mut listing = String::new();
        for track in tracks {
            // ffmpeg concat demuxer syntax; single quotes in paths need the
            // '\'' escape.
            let safe = track.display().to_string().replace('\'', "'\\''");
            let _ = writeln!(listing, "file '{safe}'");
        }
        fs::write(&concat_list, listing)?;

        log::info!("Muxing {} tracks into {}", tracks.len(), output.display());
        let status = Command::new("ffmpeg")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(&concat_list)
            .arg("-i")
            .arg(metadata)
            .arg("-map_metadata")
            .arg("1")
            .arg("-map")
            .arg("0:a")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg(&self.bitrate)
            .arg("-y")
            .arg(output)
            .status()
            .map_err(|e| RenderError::Muxing(format!("failed to launch ffmpeg: {e}")))?;

        if !status.success() {
            return Err(RenderError::Muxing(format!(
                "ffmpeg exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioClip;
    use std::collections::BTreeMap;

    fn clip(value: f32, len: usize) -> AudioClip {
        AudioClip {
            samples: vec![value; len],
            sample_rate: 24_000,
        }
    }

    #[test]
    fn concat_follows_index_order_not_completion_order() {
        // Inserted in completion order 2, 0, 1; output must be A+B+C.
        let mut rendered = BTreeMap::new();
        rendered.insert(2, clip(0.3, 10));
        rendered.insert(0, clip(0.1, 10));
        rendered.insert(1, clip(0.2, 10));

        let track = concat_in_order(&rendered).unwrap();
        assert_eq!(track.samples.len(), 30);
        assert_eq!(track.samples[0], 0.1);
        assert_eq!(track.samples[10], 0.2);
        assert_eq!(track.samples[20], 0.3);
    }

    #[test]
    fn concat_of_nothing_is_none() {
        assert!(concat_in_order(&BTreeMap::new()).is_none());
    }

    #[test]
    fn marker_metadata_has_cumulative_offsets() {
        let tracks = vec![
            ChapterTrack {
                title: "One".to_string(),
                path: "one.wav".into(),
                duration_ms: 1500,
            },
            ChapterTrack {
                title: "Two".to_string(),
                path: "two.wav".into(),
                duration_ms: 2500,
            },
        ];
        let doc = marker_metadata("Book", "Author", &tracks);

        assert!(doc.starts_with(";FFMETADATA1\n"));
        assert!(doc.contains("title=Book\n"));
        assert!(doc.contains("artist=Author\n"));
        assert_eq!(doc.matches("[CHAPTER]").count(), 2);
        assert!(doc.contains("START=0\nEND=1500\ntitle=One"));
        assert!(doc.contains("START=1500\nEND=4000\ntitle=Two"));
        assert_eq!(doc.matches("TIMEBASE=1/1000").count(), 2);
    }

    #[test]
    fn single_file_mode_concatenates_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.wav");
        let b_path = dir.path().join("b.wav");
        clip(0.1, 100).write_wav(&a_path).unwrap();
        clip(0.2, 200).write_wav(&b_path).unwrap();

        let tracks = vec![
            ChapterTrack {
                title: "A".to_string(),
                path: a_path,
                duration_ms: 0,
            },
            ChapterTrack {
                title: "B".to_string(),
                path: b_path,
                duration_ms: 0,
            },
        ];
        let out_path = dir.path().join("book.wav");
        concat_tracks_single(&tracks, &out_path).unwrap();

        let combined = AudioClip::read_wav(&out_path).unwrap();
        assert_eq!(combined.samples.len(), 300);
        assert_eq!(combined.samples[0], 0.1);
        assert_eq!(combined.samples[100], 0.2);
    }
}
