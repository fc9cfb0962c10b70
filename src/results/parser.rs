//! BLAST XML (`-outfmt 5` / `FORMAT_TYPE=XML`) report parser

use super::types::{BlastReport, Hit, Hsp};
use crate::backends::RawResult;
use crate::error::ParseError;
use serde::Deserialize;

/// Converts raw backend output into a structured report.
///
/// Implementations are pure: no I/O and no backend calls.
pub trait ResultParser: Send + Sync {
    fn parse(&self, raw: &RawResult) -> Result<BlastReport, ParseError>;
}

/// Parser for the NCBI BLAST XML dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlReportParser;

impl XmlReportParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, xml: &str) -> Result<BlastReport, ParseError> {
        if !xml.contains("<BlastOutput") {
            return Err(ParseError::NotBlastOutput(
                "missing <BlastOutput> root element".to_string(),
            ));
        }

        let parsed: BlastOutputXml =
            quick_xml::de::from_str(xml).map_err(|e| ParseError::Xml(e.to_string()))?;

        let iterations = parsed
            .iterations
            .map(|i| i.iterations)
            .unwrap_or_default();
        let query_len = parsed
            .query_len
            .or_else(|| iterations.first().and_then(|i| i.query_len))
            .unwrap_or(0);

        let mut hits = Vec::new();
        let mut message = None;
        for iteration in iterations {
            if message.is_none() {
                message = iteration.message.clone();
            }
            for hit in iteration.hits.map(|h| h.hits).unwrap_or_default() {
                hits.push(convert_hit(hit, query_len)?);
            }
        }

        Ok(BlastReport {
            program: parsed.program.unwrap_or_default(),
            version: parsed.version,
            database: parsed.database.unwrap_or_default(),
            query_id: parsed.query_id,
            query_def: parsed.query_def,
            query_len,
            hits,
            message,
        })
    }
}

impl ResultParser for XmlReportParser {
    fn parse(&self, raw: &RawResult) -> Result<BlastReport, ParseError> {
        self.parse_str(&raw.body)
    }
}

fn convert_hit(hit: HitXml, query_len: u32) -> Result<Hit, ParseError> {
    let hsps = hit
        .hsps
        .map(|h| h.hsps)
        .unwrap_or_default()
        .into_iter()
        .map(convert_hsp)
        .collect::<Result<Vec<_>, _>>()?;
    let query_coverage = coverage(&hsps, query_len);

    Ok(Hit {
        num: hit.num.unwrap_or(0),
        id: hit.id.unwrap_or_default(),
        definition: hit.definition.unwrap_or_default(),
        accession: hit.accession.unwrap_or_default(),
        length: hit.length.unwrap_or(0),
        hsps,
        query_coverage,
    })
}

fn convert_hsp(hsp: HspXml) -> Result<Hsp, ParseError> {
    let align_len = hsp.align_len.unwrap_or(0);
    let identity = hsp.identity.unwrap_or(0);
    if identity > align_len {
        return Err(ParseError::InvalidValue {
            tag: "Hsp_identity".to_string(),
            value: format!("{identity} exceeds alignment length {align_len}"),
        });
    }

    Ok(Hsp {
        bit_score: hsp.bit_score.unwrap_or(0.0),
        score: hsp.score.map(|s| s.max(0.0) as u32),
        evalue: hsp.evalue.unwrap_or(f64::INFINITY),
        query_from: hsp.query_from.unwrap_or(0),
        query_to: hsp.query_to.unwrap_or(0),
        hit_from: hsp.hit_from.unwrap_or(0),
        hit_to: hsp.hit_to.unwrap_or(0),
        identity,
        positive: hsp.positive,
        gaps: hsp.gaps.unwrap_or(0),
        align_len,
    })
}

/// Union of HSP query intervals over the query length
fn coverage(hsps: &[Hsp], query_len: u32) -> f64 {
    if query_len == 0 || hsps.is_empty() {
        return 0.0;
    }
    let mut spans: Vec<(u32, u32)> = hsps.iter().map(Hsp::query_span).collect();
    spans.sort_unstable();

    let mut covered = 0u32;
    let mut current: Option<(u32, u32)> = None;
    for (start, end) in spans {
        current = match current {
            Some((s, e)) if start <= e.saturating_add(1) => Some((s, e.max(end))),
            Some((s, e)) => {
                covered += e - s + 1;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((s, e)) = current {
        covered += e - s + 1;
    }
    (covered as f64 / query_len as f64).min(1.0)
}

#[derive(Debug, Deserialize)]
#[serde(rename = "BlastOutput")]
struct BlastOutputXml {
    #[serde(rename = "BlastOutput_program")]
    program: Option<String>,
    #[serde(rename = "BlastOutput_version")]
    version: Option<String>,
    #[serde(rename = "BlastOutput_db")]
    database: Option<String>,
    #[serde(rename = "BlastOutput_query-ID")]
    query_id: Option<String>,
    #[serde(rename = "BlastOutput_query-def")]
    query_def: Option<String>,
    #[serde(rename = "BlastOutput_query-len")]
    query_len: Option<u32>,
    #[serde(rename = "BlastOutput_iterations")]
    iterations: Option<IterationsXml>,
}

#[derive(Debug, Deserialize)]
struct IterationsXml {
    #[serde(rename = "Iteration", default)]
    iterations: Vec<IterationXml>,
}

#[derive(Debug, Deserialize)]
struct IterationXml {
    #[serde(rename = "Iteration_query-len")]
    query_len: Option<u32>,
    #[serde(rename = "Iteration_hits")]
    hits: Option<HitsXml>,
    #[serde(rename = "Iteration_message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HitsXml {
    #[serde(rename = "Hit", default)]
    hits: Vec<HitXml>,
}

#[derive(Debug, Deserialize)]
struct HitXml {
    #[serde(rename = "Hit_num")]
    num: Option<u32>,
    #[serde(rename = "Hit_id")]
    id: Option<String>,
    #[serde(rename = "Hit_def")]
    definition: Option<String>,
    #[serde(rename = "Hit_accession")]
    accession: Option<String>,
    #[serde(rename = "Hit_len")]
    length: Option<u32>,
    #[serde(rename = "Hit_hsps")]
    hsps: Option<HspsXml>,
}

#[derive(Debug, Deserialize)]
struct HspsXml {
    #[serde(rename = "Hsp", default)]
    hsps: Vec<HspXml>,
}

#[derive(Debug, Deserialize)]
struct HspXml {
    #[serde(rename = "Hsp_bit-score")]
    bit_score: Option<f64>,
    #[serde(rename = "Hsp_score")]
    score: Option<f64>,
    #[serde(rename = "Hsp_evalue")]
    evalue: Option<f64>,
    #[serde(rename = "Hsp_query-from")]
    query_from: Option<u32>,
    #[serde(rename = "Hsp_query-to")]
    query_to: Option<u32>,
    #[serde(rename = "Hsp_hit-from")]
    hit_from: Option<u32>,
    #[serde(rename = "Hsp_hit-to")]
    hit_to: Option<u32>,
    #[serde(rename = "Hsp_identity")]
    identity: Option<u32>,
    #[serde(rename = "Hsp_positive")]
    positive: Option<u32>,
    #[serde(rename = "Hsp_gaps")]
    gaps: Option<u32>,
    #[serde(rename = "Hsp_align-len")]
    align_len: Option<u32>,
}
