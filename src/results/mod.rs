//! Result parsing and persistence
//!
//! Turns raw backend output into structured [`BlastReport`]s and writes the
//! per-query XML artifacts.

mod parser;
mod types;
mod writer;

pub use parser::{ResultParser, XmlReportParser};
pub use types::*;
pub use writer::{sanitize_stem, ResultWriter};
