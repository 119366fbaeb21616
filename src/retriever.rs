//! Document retrieval: read, chunk, embed, index, and query.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    cache::IndexCache,
    chunking::{Chunk, ChunkingConfig, chunk_text},
    embedding::Embedder,
    embedding_db::{EmbeddingDb, embedding_key},
    error::{Error, Result},
    index::{DEFAULT_TOP_K, Metric, SearchHit, VectorIndex},
};

/// Document searched when no path is configured.
pub const DEFAULT_POLICY_PATH: &str = "policies.txt";

/// Returned in place of passages when the policy document does not exist.
pub const MISSING_DOCUMENT_MESSAGE: &str = "Policies file not found.";

/// A policy document read from disk.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
    pub content_hash: blake3::Hash,
}

impl Document {
    /// Read a UTF-8 document. A missing file is `Ok(None)`; any other I/O
    /// failure, including invalid UTF-8, is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let content_hash = blake3::hash(text.as_bytes());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    text,
                    content_hash,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of a search against a document path.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// The document does not exist.
    Missing(PathBuf),
    /// Best matches, highest score first. Empty for an empty document.
    Found(Vec<SearchHit>),
}

impl Retrieval {
    /// Render as the text handed to the caller.
    pub fn into_text(self) -> String {
        match self {
            Retrieval::Missing(_) => MISSING_DOCUMENT_MESSAGE.to_string(),
            Retrieval::Found(hits) => join_hits(&hits),
        }
    }
}

/// Join hit contents, trimmed, with a blank line between passages.
pub fn join_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| hit.chunk.content.trim())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds and queries vector indexes over policy documents.
///
/// Indexes are cached per path and rebuilt only when the document content
/// changes. With an [`EmbeddingDb`] attached, chunk embeddings are also
/// persisted across processes.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    metric: Metric,
    cache: IndexCache,
    embedding_db: Option<EmbeddingDb>,
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("model_id", &self.embedder.model_id())
            .field("chunking", &self.chunking)
            .field("metric", &self.metric)
            .field("persistent_cache", &self.embedding_db.is_some())
            .finish_non_exhaustive()
    }
}

impl Retriever {
    /// Create a retriever with default chunking and cosine similarity.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            chunking: ChunkingConfig::default(),
            metric: Metric::default(),
            cache: IndexCache::new(),
            embedding_db: None,
        }
    }

    /// Use a different chunking configuration. Invalid configs are rejected.
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Result<Self> {
        chunking.validate()?;
        self.chunking = chunking;
        Ok(self)
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Persist chunk embeddings in `db`.
    pub fn with_embedding_db(mut self, db: EmbeddingDb) -> Self {
        self.embedding_db = Some(db);
        self
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Search the document at `path` for the `k` chunks closest to `query`.
    pub fn search(
        &self,
        path: &Path,
        query: &str,
        k: usize,
    ) -> Result<Retrieval> {
        let Some(document) = Document::load(path)? else {
            warn!(path = %path.display(), "policy document not found");
            return Ok(Retrieval::Missing(path.to_path_buf()));
        };
        if k == 0 || document.text.is_empty() {
            return Ok(Retrieval::Found(Vec::new()));
        }

        let index = self.index_for(&document)?;
        let hits = match index.query(self.embedder.as_ref(), query, k) {
            Ok(hits) => hits,
            Err(e @ Error::DimensionMismatch { .. }) => {
                // The embedder changed under a cached index; rebuild next time.
                warn!(
                    path = %path.display(),
                    error = %e,
                    "dropping cached index"
                );
                self.cache.invalidate(&document.path);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(
            path = %path.display(),
            k,
            hits = hits.len(),
            "policy search complete"
        );
        Ok(Retrieval::Found(hits))
    }

    /// Search and render the result as text.
    ///
    /// A missing document yields [`MISSING_DOCUMENT_MESSAGE`]; an empty one
    /// yields an empty string.
    pub fn retrieve(&self, path: &Path, query: &str, k: usize) -> Result<String> {
        Ok(self.search(path, query, k)?.into_text())
    }

    /// Chunk the document at `path` without embedding it.
    pub fn chunks(&self, path: &Path) -> Result<Option<Vec<Chunk>>> {
        Ok(Document::load(path)?
            .map(|document| chunk_text(&document.text, &self.chunking)))
    }

    /// The index for `document`, from cache when its content is unchanged.
    pub fn index_for(&self, document: &Document) -> Result<Arc<VectorIndex>> {
        self.cache
            .get_or_build(&document.path, document.content_hash, || {
                self.build_index(document)
            })
    }

    fn build_index(&self, document: &Document) -> Result<VectorIndex> {
        let chunks = chunk_text(&document.text, &self.chunking);
        let embeddings = self.embed_chunks(&document.path, &chunks)?;
        info!(
            chunks = chunks.len(),
            model = self.embedder.model_id(),
            "indexed policy document"
        );
        VectorIndex::from_embeddings(chunks, embeddings, self.metric)
    }

    fn embed_chunks(
        &self,
        path: &Path,
        chunks: &[Chunk],
    ) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<&str> =
            chunks.iter().map(|c| c.content.as_str()).collect();
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let Some(db) = &self.embedding_db else {
            return self.embedder.embed_batch(&texts);
        };

        let model_id = self.embedder.model_id();
        let keys: Vec<[u8; 32]> = texts
            .iter()
            .map(|text| embedding_key(model_id, text))
            .collect();

        let mut slots = db.batch_load(&keys).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read embedding cache");
            vec![None; keys.len()]
        });

        let mut computed = self.fill_missing(&texts, &mut slots)?;

        // Cached vectors of another size are stale. When everything came
        // from the cache, one chunk is re-embedded to learn the dimension.
        let expected = match computed.first().and_then(|&i| slots[i].as_ref()) {
            Some(vector) => vector.len(),
            None => self.embedder.embed(texts[0])?.len(),
        };
        let mut stale = false;
        for slot in &mut slots {
            if slot.as_ref().is_some_and(|v| v.len() != expected) {
                *slot = None;
                stale = true;
            }
        }
        if stale {
            computed.extend(self.fill_missing(&texts, &mut slots)?);
        }

        let entries: Vec<([u8; 32], Vec<f32>)> = computed
            .iter()
            .filter_map(|&i| slots[i].clone().map(|v| (keys[i], v)))
            .collect();
        if let Err(e) = db.batch_store(&entries) {
            warn!(error = %e, "failed to write embedding cache");
        }
        let owner = format!("{model_id}\0{}", path.display());
        if let Err(e) = db.replace_document_keys(&owner, &keys) {
            warn!(error = %e, "failed to prune embedding cache");
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Embed the texts whose slot is empty, in one batch. Returns the
    /// indices that were filled.
    fn fill_missing(
        &self,
        texts: &[&str],
        slots: &mut [Option<Vec<f32>>],
    ) -> Result<Vec<usize>> {
        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }

        debug!(
            cached = slots.len() - missing.len(),
            computing = missing.len(),
            "embedding chunks"
        );
        let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
        let vectors = self.embedder.embed_batch(&batch)?;
        if vectors.len() != batch.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        for (&i, vector) in missing.iter().zip(vectors) {
            slots[i] = Some(vector);
        }
        Ok(missing)
    }
}

/// The single-operation surface handed to an agent.
///
/// Binds a [`Retriever`] to a document path and result count, and never
/// returns an error: failures become a descriptive message.
#[derive(Debug, Clone)]
pub struct PolicySearch {
    retriever: Arc<Retriever>,
    document_path: PathBuf,
    top_k: usize,
}

impl PolicySearch {
    pub fn new(retriever: Arc<Retriever>, document_path: PathBuf) -> Self {
        Self {
            retriever,
            document_path,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Search with an optional result count override.
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Retrieval> {
        self.retriever.search(
            &self.document_path,
            query,
            limit.unwrap_or(self.top_k),
        )
    }

    /// Relevant policy passages for `query`, as plain text.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use policyseek::{HashEmbedder, PolicySearch, Retriever};
    ///
    /// let retriever = Arc::new(Retriever::new(Arc::new(HashEmbedder::default())));
    /// let search = PolicySearch::new(retriever, "no-such-file.txt".into());
    /// assert_eq!(search.search_policies("budget"), "Policies file not found.");
    /// ```
    pub fn search_policies(&self, query: &str) -> String {
        match self.search(query, None) {
            Ok(retrieval) => retrieval.into_text(),
            Err(e) => {
                warn!(error = %e, "policy search failed");
                format!("Policy search unavailable: {e}")
            }
        }
    }
}
