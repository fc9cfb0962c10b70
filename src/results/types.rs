//! Structured BLAST report types

use serde::{Deserialize, Serialize};

/// One parsed BLAST report (a single query)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlastReport {
    pub program: String,
    pub version: Option<String>,
    pub database: String,
    pub query_id: Option<String>,
    pub query_def: Option<String>,
    pub query_len: u32,
    pub hits: Vec<Hit>,
    /// Server or engine message, e.g. "No hits found"
    pub message: Option<String>,
}

impl BlastReport {
    pub fn has_hits(&self) -> bool {
        !self.hits.is_empty()
    }

    /// Hit with the lowest best-HSP e-value
    pub fn top_hit(&self) -> Option<&Hit> {
        self.hits.iter().min_by(|a, b| {
            let ea = a.best_hsp().map_or(f64::INFINITY, |h| h.evalue);
            let eb = b.best_hsp().map_or(f64::INFINITY, |h| h.evalue);
            ea.total_cmp(&eb)
        })
    }
}

/// A database sequence matching the query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub num: u32,
    pub id: String,
    pub definition: String,
    pub accession: String,
    /// Subject length
    pub length: u32,
    pub hsps: Vec<Hsp>,
    /// Fraction of the query covered by the union of all HSPs, in [0, 1]
    pub query_coverage: f64,
}

impl Hit {
    /// HSP with the highest bit score
    pub fn best_hsp(&self) -> Option<&Hsp> {
        self.hsps
            .iter()
            .max_by(|a, b| a.bit_score.total_cmp(&b.bit_score))
    }
}

/// High-scoring segment pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hsp {
    pub bit_score: f64,
    pub score: Option<u32>,
    pub evalue: f64,
    pub query_from: u32,
    pub query_to: u32,
    pub hit_from: u32,
    pub hit_to: u32,
    pub identity: u32,
    pub positive: Option<u32>,
    pub gaps: u32,
    pub align_len: u32,
}

impl Hsp {
    /// Percent identity over the alignment
    pub fn identity_percent(&self) -> f64 {
        if self.align_len == 0 {
            0.0
        } else {
            self.identity as f64 / self.align_len as f64 * 100.0
        }
    }

    /// Query interval, start <= end
    pub fn query_span(&self) -> (u32, u32) {
        (
            self.query_from.min(self.query_to),
            self.query_from.max(self.query_to),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hsp(bit_score: f64, evalue: f64) -> Hsp {
        Hsp {
            bit_score,
            evalue,
            identity: 90,
            align_len: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_best_hsp_and_top_hit() {
        let report = BlastReport {
            hits: vec![
                Hit {
                    accession: "A".into(),
                    hsps: vec![hsp(50.0, 1e-5), hsp(80.0, 1e-10)],
                    ..Default::default()
                },
                Hit {
                    accession: "B".into(),
                    hsps: vec![hsp(200.0, 1e-60)],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(report.hits[0].best_hsp().unwrap().bit_score, 80.0);
        assert_eq!(report.top_hit().unwrap().accession, "B");
        assert_eq!(hsp(1.0, 1.0).identity_percent(), 90.0);
    }
}
