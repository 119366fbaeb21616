//! Layered runtime settings.
//!
//! Each value is taken from the first source that sets it: command-line
//! flags, then environment variables, then `config.redb`, then built-in
//! defaults.

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use serde::Serialize;

use crate::{
    chunking::{ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    config_db::ConfigDb,
    embedding::{Embedder, HashEmbedder},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    index::{DEFAULT_TOP_K, Metric},
    model_manager::{DEFAULT_MODEL_ID, MODEL_ENV_VAR, ModelManager},
    retriever::{DEFAULT_POLICY_PATH, PolicySearch, Retriever},
};

pub const EMBEDDER_ENV_VAR: &str = "POLICYSEEK_EMBEDDER";
pub const POLICY_PATH_ENV_VAR: &str = "POLICYSEEK_POLICY_PATH";

pub const KEY_MODEL_NAME: &str = "model_name";
pub const KEY_POLICY_PATH: &str = "policy_path";
pub const KEY_CHUNK_SIZE: &str = "chunk_size";
pub const KEY_CHUNK_OVERLAP: &str = "chunk_overlap";
pub const KEY_TOP_K: &str = "top_k";
pub const KEY_METRIC: &str = "metric";
pub const KEY_EMBEDDER: &str = "embedder";

/// Every key accepted by `config set`.
pub const SETTING_KEYS: &[&str] = &[
    KEY_MODEL_NAME,
    KEY_POLICY_PATH,
    KEY_CHUNK_SIZE,
    KEY_CHUNK_OVERLAP,
    KEY_TOP_K,
    KEY_METRIC,
    KEY_EMBEDDER,
];

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Mean-pooled ColBERT embeddings.
    #[default]
    Colbert,
    /// Offline feature hashing.
    Hash,
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderKind::Colbert => f.write_str("colbert"),
            EmbedderKind::Hash => f.write_str("hash"),
        }
    }
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "colbert" => Ok(EmbedderKind::Colbert),
            "hash" => Ok(EmbedderKind::Hash),
            other => Err(Error::Config(format!(
                "unknown embedder: {other} (expected colbert or hash)"
            ))),
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Flag,
    Env,
    Config,
    Default,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Flag => "command line",
            Source::Env => "environment",
            Source::Config => "config.redb",
            Source::Default => "default",
        })
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub embedder: Option<EmbedderKind>,
    pub policy_path: Option<PathBuf>,
    pub top_k: Option<usize>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub model_name: String,
    pub model_source: Source,
    pub embedder: EmbedderKind,
    pub policy_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    #[serde(serialize_with = "serialize_display")]
    pub metric: Metric,
}

impl Settings {
    /// Resolve settings against the process environment.
    pub fn resolve(
        overrides: &Overrides,
        config_db: Option<&ConfigDb>,
    ) -> Result<Self> {
        Self::resolve_with(overrides, config_db, |key| std::env::var(key).ok())
    }

    /// Resolve settings, reading environment variables through `env`.
    pub fn resolve_with<F>(
        overrides: &Overrides,
        config_db: Option<&ConfigDb>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let stored = |key: &str| -> Result<Option<String>> {
            match config_db {
                Some(db) => db.get_setting(key),
                None => Ok(None),
            }
        };

        let (model_name, model_source) = if let Some(model) = &overrides.model
        {
            (model.clone(), Source::Flag)
        } else if let Some(model) = env(MODEL_ENV_VAR) {
            (model, Source::Env)
        } else if let Some(model) = stored(KEY_MODEL_NAME)? {
            (model, Source::Config)
        } else {
            (DEFAULT_MODEL_ID.to_string(), Source::Default)
        };

        let embedder = match overrides.embedder {
            Some(kind) => kind,
            None => env(EMBEDDER_ENV_VAR)
                .or(stored(KEY_EMBEDDER)?)
                .map(|v| v.parse::<EmbedderKind>())
                .transpose()?
                .unwrap_or_default(),
        };

        let policy_path = match &overrides.policy_path {
            Some(path) => path.clone(),
            None => env(POLICY_PATH_ENV_VAR)
                .or(stored(KEY_POLICY_PATH)?)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH)),
        };

        let chunk_size = stored(KEY_CHUNK_SIZE)?
            .map(|v| parse_count(KEY_CHUNK_SIZE, &v))
            .transpose()?
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        let chunk_overlap = stored(KEY_CHUNK_OVERLAP)?
            .map(|v| parse_count(KEY_CHUNK_OVERLAP, &v))
            .transpose()?
            .unwrap_or(DEFAULT_CHUNK_OVERLAP);
        let top_k = match overrides.top_k {
            Some(k) => k,
            None => stored(KEY_TOP_K)?
                .map(|v| parse_count(KEY_TOP_K, &v))
                .transpose()?
                .unwrap_or(DEFAULT_TOP_K),
        };
        let metric = stored(KEY_METRIC)?
            .map(|v| v.parse::<Metric>())
            .transpose()?
            .unwrap_or_default();

        let settings = Self {
            model_name,
            model_source,
            embedder,
            policy_path,
            chunk_size,
            chunk_overlap,
            top_k,
            metric,
        };
        settings.chunking().validate()?;
        Ok(settings)
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig::new(self.chunk_size, self.chunk_overlap)
    }

    /// Model identifier of the embedder these settings select.
    pub fn embedder_id(&self) -> String {
        match self.embedder {
            EmbedderKind::Colbert => self.model_name.clone(),
            EmbedderKind::Hash => HashEmbedder::default().model_id().to_string(),
        }
    }

    /// Construct the selected embedder. ColBERT models load lazily.
    pub fn build_embedder(&self) -> Arc<dyn Embedder> {
        match self.embedder {
            EmbedderKind::Colbert => {
                Arc::new(ModelManager::with_model_id(self.model_name.clone()))
            }
            EmbedderKind::Hash => Arc::new(HashEmbedder::default()),
        }
    }

    pub fn build_retriever(
        &self,
        embedding_db: Option<EmbeddingDb>,
    ) -> Result<Retriever> {
        let retriever = Retriever::new(self.build_embedder())
            .with_chunking(self.chunking())?
            .with_metric(self.metric);
        Ok(match embedding_db {
            Some(db) => retriever.with_embedding_db(db),
            None => retriever,
        })
    }

    pub fn build_policy_search(
        &self,
        embedding_db: Option<EmbeddingDb>,
    ) -> Result<PolicySearch> {
        let retriever = Arc::new(self.build_retriever(embedding_db)?);
        Ok(PolicySearch::new(retriever, self.policy_path.clone())
            .with_top_k(self.top_k))
    }
}

/// Check a `config set` key and value before storing them.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        KEY_MODEL_NAME | KEY_POLICY_PATH => {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{key} must not be empty")));
            }
        }
        KEY_CHUNK_SIZE | KEY_CHUNK_OVERLAP | KEY_TOP_K => {
            parse_count(key, value)?;
        }
        KEY_METRIC => {
            value.parse::<Metric>()?;
        }
        KEY_EMBEDDER => {
            value.parse::<EmbedderKind>()?;
        }
        other => {
            return Err(Error::Config(format!(
                "unknown setting: {other} (known: {})",
                SETTING_KEYS.join(", ")
            )));
        }
    }
    Ok(())
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!(
            "{key} must be a non-negative integer, got {value:?}"
        ))
    })
}

fn serialize_display<T, S>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    T: fmt::Display,
    S: serde::Serializer,
{
    serializer.collect_str(value)
}
