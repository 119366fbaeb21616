//! policyseek - semantic search over a travel policy document.
//!
//! The document is split into overlapping chunks along paragraph, line and
//! sentence boundaries, each chunk is embedded, and queries are answered by
//! exact nearest-neighbour search. Embeddings come from a
//! [ColBERT](https://github.com/stanford-futuredata/ColBERT) model, mean
//! pooled into one vector per text, or from an offline hashing embedder.
//!
//! An agent sees a single operation, [`PolicySearch::search_policies`],
//! which always returns text.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use policyseek::{DataDir, EmbeddingDb, ModelManager, PolicySearch, Retriever};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let embedding_db = EmbeddingDb::open(&data_dir.embeddings_db()).unwrap();
//!
//! let retriever = Retriever::new(Arc::new(ModelManager::default()))
//!     .with_embedding_db(embedding_db);
//! let search = PolicySearch::new(Arc::new(retriever), "policies.txt".into());
//!
//! println!("{}", search.search_policies("maximum hotel budget per night"));
//! ```

pub mod cache;
pub mod chunking;
pub mod config_db;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod index;
pub mod mcp;
pub mod model_manager;
pub mod retriever;
pub mod settings;

pub use cache::IndexCache;
pub use chunking::{Chunk, ChunkingConfig, chunk_text};
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use embedding::{Embedder, HashEmbedder};
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use index::{Metric, SearchHit, VectorIndex};
pub use model_manager::ModelManager;
pub use retriever::{PolicySearch, Retrieval, Retriever};
pub use settings::Settings;
