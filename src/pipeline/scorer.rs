//! Relevance scoring functions

use serde::{Serialize, Serializer};

use crate::index::doc_table::DocMeta;
use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::query::iterators::Record;
use crate::{Error, Result};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const BM25_TANH_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerKind {
    TfIdf,
    TfIdfDocNorm,
    Bm25,
    Bm25Std,
    Bm25StdTanh,
    DisMax,
    DocScore,
}

impl ScorerKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TFIDF" => Ok(ScorerKind::TfIdf),
            "TFIDF.DOCNORM" => Ok(ScorerKind::TfIdfDocNorm),
            "BM25" => Ok(ScorerKind::Bm25),
            "BM25STD" => Ok(ScorerKind::Bm25Std),
            "BM25STD.TANH" => Ok(ScorerKind::Bm25StdTanh),
            "DISMAX" => Ok(ScorerKind::DisMax),
            "DOCSCORE" => Ok(ScorerKind::DocScore),
            other => Err(Error::bad_argument(format!("Scoring function `{other}` not found"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerKind::TfIdf => "TFIDF",
            ScorerKind::TfIdfDocNorm => "TFIDF.DOCNORM",
            ScorerKind::Bm25 => "BM25",
            ScorerKind::Bm25Std => "BM25STD",
            ScorerKind::Bm25StdTanh => "BM25STD.TANH",
            ScorerKind::DisMax => "DISMAX",
            ScorerKind::DocScore => "DOCSCORE",
        }
    }
}

impl Serialize for ScorerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Index-wide statistics sampled when the query starts
#[derive(Debug, Clone, Copy, Default)]
pub struct CorpusStats {
    pub num_docs: u64,
    pub avg_doc_len: f64,
}

/// Inverse document frequency used by the TF-IDF family.
pub fn idf(num_docs: u64, term_docs: u64) -> f64 {
    let term_docs = term_docs.max(1) as f64;
    (1.0 + (num_docs as f64 + 1.0) / term_docs).log2()
}

/// Inverse document frequency used by the BM25 family.
pub fn bm25_idf(num_docs: u64, term_docs: u64) -> f64 {
    let n = num_docs as f64;
    let df = term_docs as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln().max(0.0)
}

/// Score one result.
pub fn score(kind: ScorerKind, record: &Record, doc: &DocMeta, stats: &CorpusStats) -> f64 {
    match kind {
        ScorerKind::TfIdf => {
            if doc.max_freq == 0 {
                return 0.0;
            }
            tfidf(record) / doc.max_freq as f64 * doc.score
        }
        ScorerKind::TfIdfDocNorm => {
            if doc.len == 0 {
                return 0.0;
            }
            tfidf(record) / doc.len as f64 * doc.score
        }
        ScorerKind::Bm25 => bm25(record, doc, stats) * doc.score,
        ScorerKind::Bm25Std => bm25(record, doc, stats),
        ScorerKind::Bm25StdTanh => (bm25(record, doc, stats) / BM25_TANH_FACTOR).tanh(),
        ScorerKind::DisMax => dismax(record),
        ScorerKind::DocScore => doc.score,
    }
}

fn tfidf(record: &Record) -> f64 {
    match record {
        Record::Term { hit, weight } => weight * hit.freq as f64 * hit.idf,
        Record::Union { children, weight } | Record::Intersect { children, weight } => {
            weight * children.iter().map(tfidf).sum::<f64>()
        }
        Record::Virtual { .. } | Record::Metric { .. } => 0.0,
    }
}

fn bm25(record: &Record, doc: &DocMeta, stats: &CorpusStats) -> f64 {
    match record {
        Record::Term { hit, weight } => {
            let f = hit.freq as f64;
            let len_ratio = if stats.avg_doc_len > 0.0 {
                doc.len as f64 / stats.avg_doc_len
            } else {
                1.0
            };
            let norm = f + BM25_K1 * (1.0 - BM25_B + BM25_B * len_ratio);
            weight * hit.bm25_idf * f * (BM25_K1 + 1.0) / norm
        }
        Record::Union { children, weight } | Record::Intersect { children, weight } => {
            weight * children.iter().map(|c| bm25(c, doc, stats)).sum::<f64>()
        }
        Record::Virtual { .. } | Record::Metric { .. } => 0.0,
    }
}

fn dismax(record: &Record) -> f64 {
    match record {
        Record::Term { hit, weight } => weight * hit.freq as f64,
        Record::Union { children, weight } => {
            weight * children.iter().map(dismax).fold(0.0, f64::max)
        }
        Record::Intersect { children, weight } => weight * children.iter().map(dismax).sum::<f64>(),
        Record::Virtual { weight } => *weight,
        Record::Metric { .. } => 0.0,
    }
}

/// Scores rows coming from the index stage.
pub struct Scorer {
    upstream: BoxedProcessor,
    kind: ScorerKind,
}

impl Scorer {
    pub fn new(upstream: BoxedProcessor, kind: ScorerKind) -> Self {
        Self { upstream, kind }
    }
}

impl ResultProcessor for Scorer {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let Some(mut row) = self.upstream.next(ctx)? else {
            return Ok(None);
        };
        if let (Some(record), Some(meta)) = (&row.record, &row.meta) {
            row.score = score(self.kind, record, meta, &ctx.stats);
        }
        Ok(Some(row))
    }

    fn name(&self) -> &'static str {
        "Scorer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::iterators::TermHit;
    use std::sync::Arc;

    fn term(freq: u32, idf: f64) -> Record {
        Record::Term {
            hit: TermHit {
                term: Arc::from("t"),
                idf,
                bm25_idf: idf,
                freq,
                field_mask: 1,
                offsets: vec![],
            },
            weight: 1.0,
        }
    }

    fn doc(score: f64, max_freq: u32, len: u32) -> DocMeta {
        let mut meta = DocMeta::new("d", score);
        meta.max_freq = max_freq;
        meta.len = len;
        meta
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(ScorerKind::parse("bm25std.tanh").unwrap(), ScorerKind::Bm25StdTanh);
        assert!(ScorerKind::parse("NOPE").is_err());
    }

    #[test]
    fn test_tfidf_scales_with_doc_score() {
        let stats = CorpusStats::default();
        let low = score(ScorerKind::TfIdf, &term(10, 1.0), &doc(0.5, 10, 6), &stats);
        let high = score(ScorerKind::TfIdf, &term(10, 1.0), &doc(1.0, 10, 8), &stats);
        assert!(high > low);
        assert!((high - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_dismax_takes_max_over_union() {
        let rec = Record::Union {
            children: vec![term(2, 1.0), term(5, 1.0)],
            weight: 1.0,
        };
        assert_eq!(score(ScorerKind::DisMax, &rec, &doc(1.0, 5, 7), &CorpusStats::default()), 5.0);
    }

    #[test]
    fn test_bm25_tanh_is_bounded() {
        let stats = CorpusStats {
            num_docs: 10,
            avg_doc_len: 5.0,
        };
        let s = score(ScorerKind::Bm25StdTanh, &term(50, 3.0), &doc(1.0, 50, 5), &stats);
        assert!(s > 0.0 && s < 1.0);
    }

    #[test]
    fn test_idf_decreases_with_df() {
        assert!(idf(100, 1) > idf(100, 50));
        assert!(bm25_idf(100, 1) > bm25_idf(100, 50));
    }
}
