//! Sequence file input
//!
//! Reads FASTA (one query per record) or flat sequence files (the whole file
//! is one sequence) into [`SequenceQuery`] values.

use crate::config::QueryDefaults;
use crate::error::InputError;
use crate::query::{SearchParameters, SearchProgram, SequenceQuery};
use bio::io::fasta;
use std::path::Path;
use tracing::debug;

/// Program, database and parameters applied to every query read from a file
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    pub program: SearchProgram,
    pub database: String,
    pub parameters: SearchParameters,
    pub cross_species: bool,
}

impl QueryTemplate {
    pub fn new(program: SearchProgram, database: impl Into<String>) -> Self {
        Self {
            program,
            database: database.into(),
            parameters: SearchParameters::default(),
            cross_species: false,
        }
    }

    fn build(&self, id: String, sequence: &str, source: &Path) -> SequenceQuery {
        SequenceQuery::new(
            id,
            sequence,
            self.program,
            self.database.clone(),
            self.parameters.clone(),
        )
        .with_source(source)
        .with_cross_species(self.cross_species)
    }
}

impl From<&QueryDefaults> for QueryTemplate {
    fn from(defaults: &QueryDefaults) -> Self {
        Self {
            program: defaults.program,
            database: defaults.database.clone(),
            parameters: defaults.parameters.clone(),
            cross_species: defaults.cross_species,
        }
    }
}

fn unreadable(path: &Path, reason: impl ToString) -> InputError {
    InputError::Unreadable {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Read every sequence in `path`.
///
/// A single-record file yields id `<stem>`; multi-record FASTA yields
/// `<stem>_<record id>` per record. Queries are not validated here.
pub fn read_sequences(
    path: &Path,
    template: &QueryTemplate,
) -> Result<Vec<SequenceQuery>, InputError> {
    let content = std::fs::read_to_string(path).map_err(|e| unreadable(path, e))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "query".to_string());

    if !content.trim_start().starts_with('>') {
        debug!("Reading flat sequence file: {}", path.display());
        return Ok(vec![template.build(stem, &content, path)]);
    }

    let records = fasta::Reader::new(content.as_bytes())
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| unreadable(path, e))?;

    if records.is_empty() {
        return Err(InputError::EmptySequence(stem));
    }

    let single = records.len() == 1;
    let queries = records
        .iter()
        .map(|record| {
            let id = if single {
                stem.clone()
            } else {
                format!("{stem}_{}", record.id())
            };
            let sequence = String::from_utf8_lossy(record.seq());
            template.build(id, &sequence, path)
        })
        .collect::<Vec<_>>();

    debug!(
        "Read {} FASTA record(s) from {}",
        queries.len(),
        path.display()
    );
    Ok(queries)
}
