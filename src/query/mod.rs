//! Sequence queries and search parameters
//!
//! A [`SequenceQuery`] is normalized on construction and immutable once it is
//! part of a batch. Everything that affects the search result lives either on
//! the query itself or in its [`SearchParameters`].

use crate::error::InputError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// BLAST program to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProgram {
    #[default]
    Blastn,
    Blastp,
    Blastx,
    Tblastn,
    Tblastx,
}

impl SearchProgram {
    /// Program name as understood by BLAST+ and the NCBI URL API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blastn => "blastn",
            Self::Blastp => "blastp",
            Self::Blastx => "blastx",
            Self::Tblastn => "tblastn",
            Self::Tblastx => "tblastx",
        }
    }

    /// Whether the query is a nucleotide sequence
    pub fn nucleotide_query(&self) -> bool {
        matches!(self, Self::Blastn | Self::Blastx | Self::Tblastx)
    }
}

impl fmt::Display for SearchProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchProgram {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blastn" => Ok(Self::Blastn),
            "blastp" => Ok(Self::Blastp),
            "blastx" => Ok(Self::Blastx),
            "tblastn" => Ok(Self::Tblastn),
            "tblastx" => Ok(Self::Tblastx),
            other => Err(format!("unknown BLAST program: {other}")),
        }
    }
}

/// Tunable search parameters
///
/// Field order is part of the fingerprint encoding; append new fields at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParameters {
    /// Seed word size
    pub word_size: Option<u32>,
    /// Expectation value threshold
    pub evalue: f64,
    /// Match reward (nucleotide only)
    pub reward: Option<i32>,
    /// Mismatch penalty (nucleotide only)
    pub penalty: Option<i32>,
    /// Maximum number of hits returned
    pub hitlist_size: u32,
    /// Maximum HSPs per subject
    pub max_hsps: Option<u32>,
    /// Use megablast (blastn only)
    pub megablast: bool,
    /// Low-complexity filter string, e.g. "L"
    pub filter: Option<String>,
    /// Scoring matrix (protein searches)
    pub matrix: Option<String>,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            word_size: Some(28),
            evalue: 10.0,
            reward: None,
            penalty: None,
            hitlist_size: 50,
            max_hsps: Some(1),
            megablast: true,
            filter: None,
            matrix: None,
        }
    }
}

impl SearchParameters {
    /// Apply a relaxation preset: e-value is widened (never narrowed), the
    /// other overrides replace the current value.
    pub fn relaxed(&self, preset: &ParameterPreset) -> Self {
        let mut params = self.clone();
        if let Some(evalue) = preset.evalue {
            params.evalue = params.evalue.max(evalue);
        }
        if let Some(word_size) = preset.word_size {
            params.word_size = Some(word_size);
        }
        if let Some(megablast) = preset.megablast {
            params.megablast = megablast;
        }
        params
    }
}

/// Parameter overrides applied by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterPreset {
    pub evalue: Option<f64>,
    pub word_size: Option<u32>,
    pub megablast: Option<bool>,
}

/// One sequence to search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceQuery {
    /// Source identifier, used to name result artifacts
    pub id: String,
    /// File the sequence came from, if any
    pub source: Option<PathBuf>,
    /// Normalized sequence: uppercase, no whitespace or digits
    sequence: String,
    pub program: SearchProgram,
    pub database: String,
    pub parameters: SearchParameters,
    /// Query and subject are expected to come from different species
    pub cross_species: bool,
}

impl SequenceQuery {
    pub fn new(
        id: impl Into<String>,
        raw_sequence: &str,
        program: SearchProgram,
        database: impl Into<String>,
        parameters: SearchParameters,
    ) -> Self {
        Self {
            id: id.into(),
            source: None,
            sequence: normalize_sequence(raw_sequence),
            program,
            database: database.into(),
            parameters,
            cross_species: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_cross_species(mut self, cross_species: bool) -> Self {
        self.cross_species = cross_species;
        self
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// The query in FASTA form, as fed to BLAST+ on stdin
    pub fn to_fasta(&self) -> String {
        let mut fasta = format!(">{}\n", self.id);
        for line in self.sequence.as_bytes().chunks(80) {
            fasta.push_str(&String::from_utf8_lossy(line));
            fasta.push('\n');
        }
        fasta
    }

    /// Reject empty sequences and residues outside the IUPAC alphabet.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.sequence.is_empty() {
            return Err(InputError::EmptySequence(self.id.clone()));
        }

        let allowed = if self.program.nucleotide_query() {
            NUCLEOTIDE_ALPHABET
        } else {
            PROTEIN_ALPHABET
        };

        match self
            .sequence
            .chars()
            .enumerate()
            .find(|(_, c)| !allowed.contains(*c))
        {
            Some((position, residue)) => Err(InputError::InvalidResidue {
                id: self.id.clone(),
                residue,
                position: position + 1,
            }),
            None => Ok(()),
        }
    }
}

const NUCLEOTIDE_ALPHABET: &str = "ACGTURYSWKMBDHVN-";
const PROTEIN_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ*-";

/// Strip whitespace and digits, uppercase the rest
pub fn normalize_sequence(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_digit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
