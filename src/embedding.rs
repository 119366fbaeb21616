use crate::error::{Error, Result};

/// Maps text to a fixed-length vector.
///
/// Implementations must return vectors of the same dimension for every call
/// within a session. Backend failures are reported as
/// [`Error::EmbeddingUnavailable`] and are never retried here.
pub trait Embedder: Send + Sync {
    /// Identifies the vector space. Embeddings from embedders with different
    /// model IDs are never compared or cached together.
    fn model_id(&self) -> &str;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving input order.
    ///
    /// The default implementation calls [`embed`](Embedder::embed) once per
    /// text; backends with native batching should override it.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Default dimension for [`HashEmbedder`].
pub const DEFAULT_HASH_DIMENSIONS: usize = 256;

/// A deterministic embedder based on feature hashing.
///
/// Lower-cased word tokens and their character trigrams are hashed with
/// BLAKE3 into signed buckets, and the result is L2-normalised. It needs no
/// model download, so it backs offline use and tests.
///
/// # Examples
///
/// ```
/// use policyseek::embedding::{Embedder, HashEmbedder};
///
/// let embedder = HashEmbedder::new(64);
/// let a = embedder.embed("four star hotels").unwrap();
/// let b = embedder.embed("four star hotels").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    model_id: String,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMENSIONS)
    }
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("hash-{dimensions}"),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = blake3::hash(feature.as_bytes());
        let bytes = digest.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
            bytes[6], bytes[7],
        ]) as usize
            % self.dimensions;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in words(text) {
            self.add_feature(&mut vector, &format!("w:{word}"), 1.0);

            let padded: Vec<char> =
                format!("^{word}$").chars().collect();
            for trigram in padded.windows(3) {
                let gram: String = trigram.iter().collect();
                self.add_feature(&mut vector, &format!("t:{gram}"), 0.5);
            }
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

/// Lower-cased alphanumeric runs.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Scale a vector to unit length in place. Zero vectors are left unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Check that every vector has the same, non-zero dimension.
///
/// Returns that dimension, or `None` for an empty batch.
pub fn check_dimensions(vectors: &[Vec<f32>]) -> Result<Option<usize>> {
    let Some(first) = vectors.first() else {
        return Ok(None);
    };
    let expected = first.len();
    if expected == 0 {
        return Err(Error::EmbeddingUnavailable(
            "embedder returned an empty vector".to_string(),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(Error::DimensionMismatch {
            expected,
            actual: bad.len(),
        });
    }
    Ok(Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed("Travel insurance is mandatory").unwrap();
        let b = embedder.embed("Travel insurance is mandatory").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_embedder_output_is_unit_length() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed("Hotels must offer WiFi").unwrap();
        assert_eq!(v.len(), DEFAULT_HASH_DIMENSIONS);
        let norm = dot(&v, &v).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_case_insensitive() {
        let embedder = HashEmbedder::new(64);
        assert_eq!(
            embedder.embed("BUDGET Limit").unwrap(),
            embedder.embed("budget limit").unwrap()
        );
    }

    #[test]
    fn related_text_scores_higher() {
        let embedder = HashEmbedder::new(512);
        let query = embedder.embed("hotel star rating").unwrap();
        let related = embedder
            .embed("Accommodations must have a 4-star hotel rating")
            .unwrap();
        let unrelated = embedder
            .embed("Carry a printed copy of your passport")
            .unwrap();
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed("").unwrap();
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn model_id_encodes_dimension() {
        assert_eq!(HashEmbedder::new(32).model_id(), "hash-32");
    }

    #[test]
    fn default_batch_preserves_order() {
        let embedder = HashEmbedder::new(32);
        let batch = embedder.embed_batch(&["one", "two"]).unwrap();
        assert_eq!(batch[0], embedder.embed("one").unwrap());
        assert_eq!(batch[1], embedder.embed("two").unwrap());
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);

        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn check_dimensions_detects_mismatch() {
        assert_eq!(check_dimensions(&[]).unwrap(), None);
        assert_eq!(
            check_dimensions(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap(),
            Some(2)
        );
        assert!(matches!(
            check_dimensions(&[vec![1.0, 0.0], vec![1.0]]),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            check_dimensions(&[vec![]]),
            Err(Error::EmbeddingUnavailable(_))
        ));
    }
}
