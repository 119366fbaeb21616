//! Exact nearest-neighbour index over chunk embeddings.

use std::{fmt, str::FromStr};

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::{
    chunking::Chunk,
    embedding::{Embedder, check_dimensions},
    error::{Error, Result},
};

/// Default number of results returned by a search.
pub const DEFAULT_TOP_K: usize = 3;

/// Distance metric used to rank chunks.
///
/// Both metrics produce a score where larger means closer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Metric {
    /// Cosine similarity, in `[-1, 1]`.
    #[default]
    Cosine,
    /// `1 / (1 + euclidean_distance)`, in `(0, 1]`.
    Euclidean,
}

impl Metric {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(Error::Config(format!("unknown metric: {other}"))),
        }
    }
}

/// Returns 0.0 if either vector has zero magnitude.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// A chunk returned by a search, with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f32,
}

/// Chunks and their embeddings, searchable by similarity.
///
/// Built once per document version and never mutated afterwards; a changed
/// document gets a new index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    chunks: Vec<Chunk>,
    embeddings: Vec<Vec<f32>>,
    dimension: Option<usize>,
    metric: Metric,
}

impl VectorIndex {
    /// Embed every chunk and index the results.
    pub fn build(
        chunks: Vec<Chunk>,
        embedder: &dyn Embedder,
        metric: Metric,
    ) -> Result<Self> {
        let texts: Vec<&str> =
            chunks.iter().map(|c| c.content.as_str()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts)?
        };
        Self::from_embeddings(chunks, embeddings, metric)
    }

    /// Index chunks with precomputed embeddings, one per chunk.
    pub fn from_embeddings(
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
        metric: Metric,
    ) -> Result<Self> {
        if chunks.len() != embeddings.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        let dimension = check_dimensions(&embeddings)?;

        debug!(
            chunks = chunks.len(),
            dimension = dimension.unwrap_or(0),
            %metric,
            "built vector index"
        );

        Ok(Self {
            chunks,
            embeddings,
            dimension,
            metric,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Embedding dimension, or `None` for an empty index.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Return the `k` chunks closest to `query`, best first.
    ///
    /// Equal scores are ordered by chunk index. An empty index or `k == 0`
    /// yields no results; `k` beyond the chunk count yields every chunk.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .par_iter()
            .enumerate()
            .map(|(i, embedding)| {
                let score = self.metric.score(query, embedding);
                // NaN would otherwise sort above every real score.
                if score.is_finite() {
                    (i, score)
                } else {
                    (i, f32::NEG_INFINITY)
                }
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| SearchHit {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }

    /// Embed `query` with `embedder` and search.
    pub fn query(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let vector = embedder.embed(query)?;
        self.search(&vector, k)
    }
}
