//! Result artifact writer

use crate::backends::RawResult;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const ARTIFACT_SUFFIX: &str = "_blast_result.xml";

/// Writes one XML artifact per query into a results directory
#[derive(Debug, Clone)]
pub struct ResultWriter {
    directory: PathBuf,
}

impl ResultWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<dir>/<sanitized id>_blast_result.xml`
    pub fn artifact_path(&self, source_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}{ARTIFACT_SUFFIX}", sanitize_stem(source_id)))
    }

    /// Write the raw report body, replacing any previous artifact
    pub fn write(&self, source_id: &str, raw: &RawResult) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.artifact_path(source_id);
        let tmp = path.with_extension("xml.tmp");
        std::fs::write(&tmp, raw.body.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        debug!("Wrote result artifact: {}", path.display());
        Ok(path)
    }
}

/// Replace characters that are unsafe in file names
pub fn sanitize_stem(id: &str) -> String {
    let stem: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "query".to_string()
    } else {
        stem.to_string()
    }
}
