use std::collections::HashMap;

use tracing::warn;

use crate::embed::cosine;
use crate::tokenize::{term_frequency, tokenize};

const K1: f32 = 1.5;
const B: f32 = 0.75;
/// Raw BM25 is normalized into [0,1] by this divisor.
const NORMALIZER: f32 = 10.0;
/// Assumed average document length for single-document scoring, where no
/// corpus statistics exist (fact values are short).
const SINGLE_DOC_AVGDL: f32 = 50.0;

/// BM25 against one standalone document. Term saturation and length
/// normalization only — with a corpus of one there is no meaningful IDF.
/// Output normalized to [0,1].
pub fn bm25_single(query: &str, doc: &str) -> f32 {
    let doc_tf = term_frequency(doc);
    let doc_len = doc_tf.values().sum::<usize>() as f32;
    if doc_len == 0.0 {
        return 0.0;
    }

    let mut score = 0.0f32;
    for term in tokenize(query) {
        let tf = *doc_tf.get(&term).unwrap_or(&0) as f32;
        if tf == 0.0 {
            continue;
        }
        score += tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * doc_len / SINGLE_DOC_AVGDL));
    }
    (score / NORMALIZER).clamp(0.0, 1.0)
}

struct DocStats {
    tf: HashMap<String, usize>,
    len: f32,
}

/// BM25 + cosine scorer over a fixed document corpus. IDF, average length,
/// and per-document term tables are computed once at construction.
pub struct HybridScorer {
    docs: Vec<DocStats>,
    idf: HashMap<String, f32>,
    avgdl: f32,
    bm25_weight: f32,
    cosine_weight: f32,
}

impl HybridScorer {
    pub fn new(documents: &[String]) -> Self {
        Self::with_weights(documents, 0.4, 0.6)
    }

    /// Weights must sum to 1.0; invalid pairs fall back to the defaults.
    pub fn with_weights(documents: &[String], bm25_weight: f32, cosine_weight: f32) -> Self {
        let (bm25_weight, cosine_weight) = if (bm25_weight + cosine_weight - 1.0).abs() > 1e-3 {
            warn!(
                bm25 = bm25_weight,
                cosine = cosine_weight,
                "hybrid weights must sum to 1.0, using 0.4/0.6"
            );
            (0.4, 0.6)
        } else {
            (bm25_weight, cosine_weight)
        };

        let docs: Vec<DocStats> = documents
            .iter()
            .map(|d| {
                let tf = term_frequency(d);
                let len = tf.values().sum::<usize>() as f32;
                DocStats { tf, len }
            })
            .collect();

        let n = docs.len() as f32;
        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in &docs {
            for term in doc.tf.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let idf = df
            .into_iter()
            .map(|(term, df)| {
                let df = df as f32;
                (term, ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();

        let avgdl = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| d.len).sum::<f32>() / n
        };

        Self {
            docs,
            idf,
            avgdl,
            bm25_weight,
            cosine_weight,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// BM25 score of `query` against document `doc_index`, normalized to
    /// [0,1].
    pub fn bm25(&self, query: &str, doc_index: usize) -> f32 {
        let Some(doc) = self.docs.get(doc_index) else {
            return 0.0;
        };
        if doc.len == 0.0 || self.avgdl == 0.0 {
            return 0.0;
        }

        let mut score = 0.0f32;
        for term in tokenize(query) {
            let tf = *doc.tf.get(&term).unwrap_or(&0) as f32;
            if tf == 0.0 {
                continue;
            }
            let idf = *self.idf.get(&term).unwrap_or(&0.0);
            score += idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * doc.len / self.avgdl));
        }
        (score / NORMALIZER).clamp(0.0, 1.0)
    }

    /// Fused score. Missing vectors degrade to pure BM25 at full weight.
    pub fn hybrid(
        &self,
        query: &str,
        doc_index: usize,
        query_vec: Option<&[f32]>,
        doc_vec: Option<&[f32]>,
    ) -> f32 {
        let bm25 = self.bm25(query, doc_index);
        match (query_vec, doc_vec) {
            (Some(qv), Some(dv)) => self.bm25_weight * bm25 + self.cosine_weight * cosine(qv, dv),
            _ => bm25,
        }
    }
}
