//! Book manifest input format.
//!
//! A manifest is a JSON document produced by an upstream authoring tool:
//!
//! ```json
//! {
//!   "title": "The Book",
//!   "author": "A. Writer",
//!   "chapters": [
//!     {"id": 1, "label": "Chapter One", "style_prompt": "", "text": "..."}
//!   ]
//! }
//! ```
//!
//! Each chapter maps 1:1 to one rendered chapter track.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// One chapter of a book manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestChapter {
    pub id: u32,
    pub label: String,
    /// Optional narration-style instruction prepended to every chunk of this
    /// chapter when generating.
    #[serde(default)]
    pub style_prompt: String,
    pub text: String,
}

/// A complete book manifest: metadata plus ordered chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_author")]
    pub author: String,
    pub chapters: Vec<ManifestChapter>,
}

fn default_title() -> String {
    "Untitled Book".to_string()
}

fn default_author() -> String {
    "Unknown Author".to_string()
}

impl Manifest {
    /// Load and validate a manifest from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, RenderError> {
        let file = File::open(path).map_err(|e| {
            RenderError::InputFormat(format!("cannot open manifest {}: {e}", path.display()))
        })?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RenderError::InputFormat(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that the manifest can drive a render job.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.chapters.is_empty() {
            return Err(RenderError::InputFormat(
                "manifest contains no chapters".to_string(),
            ));
        }
        if self.chapters.iter().all(|c| c.text.trim().is_empty()) {
            return Err(RenderError::InputFormat(
                "every chapter in the manifest is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replace filesystem-hostile characters so a title or label can be used as
/// a file name.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::{sanitize_filename, Manifest};
    use std::io::Write;

    #[test]
    fn parses_manifest_with_defaults() {
        let json = r#"{
            "chapters": [
                {"id": 1, "label": "One", "text": "Hello there."}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.title, "Untitled Book");
        assert_eq!(manifest.author, "Unknown Author");
        assert_eq!(manifest.chapters[0].style_prompt, "");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn rejects_manifest_without_chapters() {
        let json = r#"{"title": "T", "author": "A", "chapters": []}"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn from_path_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"{not json").unwrap();

        let err = Manifest::from_path(&path).unwrap_err();
        assert!(matches!(err, crate::RenderError::InputFormat(_)));
    }

    #[test]
    fn sanitizes_hostile_filenames() {
        assert_eq!(sanitize_filename("a/b:c?d"), "a_b_c_d");
        assert_eq!(sanitize_filename("  Chapter 1.wav "), "Chapter 1.wav");
    }
}
