//! Stem classification after source separation.
//!
//! The separation tool reports an unordered set of files. Roles are derived
//! from file names only, so the result must not depend on listing order.

use crate::error::{PipelineError, Result};
use crate::job::StageId;
use std::path::{Path, PathBuf};

const AUDIO_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "flac", "ogg", "m4a", "aac", "opus", "aiff", "aif", "wma",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StemRole {
    Vocal,
    Instrumental,
    Unknown,
}

impl StemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StemRole::Vocal => "vocal",
            StemRole::Instrumental => "instrumental",
            StemRole::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StemRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Classify one separator output by file name.
///
/// Non-audio files are `Unknown`. An audio file whose name contains
/// `instrumental_marker` is the backing track; any other audio file is a
/// vocal candidate.
pub fn classify_stem(path: &Path, instrumental_marker: &str) -> StemRole {
    if !is_audio_file(path) {
        return StemRole::Unknown;
    }
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return StemRole::Unknown,
    };
    if !instrumental_marker.is_empty() && name.contains(instrumental_marker) {
        StemRole::Instrumental
    } else {
        StemRole::Vocal
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemAssignment {
    pub vocal: PathBuf,
    pub instrumental: PathBuf,
}

/// Pick the vocal and instrumental stems out of the separator output set.
///
/// Exactly one instrumental stem is required. When several vocal
/// candidates exist, one whose name mentions vocals wins, then the
/// lexicographically smallest path.
pub fn assign_stems(paths: &[PathBuf], instrumental_marker: &str) -> Result<StemAssignment> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut instrumentals = Vec::new();
    let mut vocals = Vec::new();
    for path in sorted {
        match classify_stem(path, instrumental_marker) {
            StemRole::Instrumental => instrumentals.push(path),
            StemRole::Vocal => vocals.push(path),
            StemRole::Unknown => {}
        }
    }

    let instrumental = match instrumentals.as_slice() {
        [one] => (*one).clone(),
        [] => {
            return Err(PipelineError::DataQuality {
                stage: StageId::Separation,
                reason: format!(
                    "no instrumental stem (marker {:?}) among {}",
                    instrumental_marker,
                    describe(paths)
                ),
            })
        }
        many => {
            return Err(PipelineError::DataQuality {
                stage: StageId::Separation,
                reason: format!("{} instrumental stems, expected one: {}", many.len(), describe(paths)),
            })
        }
    };

    let vocal = vocals
        .iter()
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_ascii_lowercase().contains("vocal"))
                .unwrap_or(false)
        })
        .or_else(|| vocals.first())
        .map(|p| (*p).clone())
        .ok_or_else(|| PipelineError::DataQuality {
            stage: StageId::Separation,
            reason: format!("no vocal stem among {}", describe(paths)),
        })?;

    Ok(StemAssignment { vocal, instrumental })
}

fn describe(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "[]".to_string();
    }
    let names: Vec<String> = paths
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect();
    format!("[{}]", names.join(", "))
}
