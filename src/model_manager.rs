use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::{debug, info};

use crate::{
    embedding::{Embedder, normalize},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "POLICYSEEK_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// ColBERT-backed [`Embedder`], loaded lazily on first use.
///
/// ColBERT produces one vector per token; these are mean-pooled and
/// L2-normalised into a single vector per text.
pub struct ModelManager {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::with_model_id(DEFAULT_MODEL_ID.to_string())
    }
}

impl ModelManager {
    /// Creates a `ModelManager` for `model_id`, a HuggingFace model ID or a
    /// local path. Environment and stored settings are resolved by
    /// [`Settings`](crate::Settings) before this is called.
    ///
    /// The model is not loaded until the first embedding call.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
        }
    }

    /// Encode texts and pool them into one vector each.
    fn encode_pooled(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut guard = self.model.lock().map_err(|_| {
            Error::EmbeddingUnavailable("model lock poisoned".to_string())
        })?;

        if guard.is_none() {
            info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(|e| model_error("failed to load model", e))?;
            *guard = Some(colbert);
        }

        let Some(model) = guard.as_mut() else {
            return Err(Error::EmbeddingUnavailable(
                "model not loaded".to_string(),
            ));
        };

        debug!(count = texts.len(), "encoding texts");
        // [batch, tokens, dimension]
        let embeddings = model
            .encode(texts, false)
            .map_err(|e| model_error("encoding failed", e))?;

        let mut pooled = mean_pool(&embeddings)?;
        for vector in &mut pooled {
            normalize(vector);
        }
        Ok(pooled)
    }
}

impl Embedder for ModelManager {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_pooled(&[text.to_string()])?
            .pop()
            .ok_or_else(|| {
                Error::EmbeddingUnavailable(
                    "model returned no embedding".to_string(),
                )
            })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        self.encode_pooled(&owned)
    }
}

/// Average token embeddings: `[batch, tokens, dim]` -> `batch x dim`.
fn mean_pool(embeddings: &Tensor) -> Result<Vec<Vec<f32>>> {
    embeddings
        .mean(1)
        .and_then(|pooled| pooled.to_vec2::<f32>())
        .map_err(|e| model_error("failed to pool token embeddings", e))
}

fn model_error(message: &str, error: impl std::fmt::Display) -> Error {
    Error::EmbeddingUnavailable(format!("{message}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_loaded(manager: &ModelManager) -> bool {
        manager.model.lock().unwrap().is_some()
    }

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::with_model_id("custom/model".to_string());
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!is_loaded(&manager));
    }

    #[test]
    fn default_uses_default_model() {
        let manager = ModelManager::default();
        assert!(!is_loaded(&manager));
        assert_eq!(manager.model_id(), DEFAULT_MODEL_ID);
    }

    #[test]
    fn empty_batch_skips_model_load() {
        let manager = ModelManager::with_model_id("custom/model".to_string());
        assert!(manager.embed_batch(&[]).unwrap().is_empty());
        assert!(!is_loaded(&manager));
    }

    #[test]
    fn mean_pool_averages_tokens() {
        // 1 text, 2 tokens, dim 2
        let t = Tensor::from_vec(
            vec![1.0f32, 0.0, 0.0, 1.0],
            (1, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let pooled = mean_pool(&t).unwrap();
        assert_eq!(pooled, vec![vec![0.5, 0.5]]);
    }
}
