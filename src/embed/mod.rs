pub mod hash;
pub mod remote;

use async_trait::async_trait;
use tracing::warn;

use crate::error::EmbedError;

pub use hash::HashEmbedder;
pub use remote::RemoteEmbedder;

/// In-process embedding model seam for the local tier. The host supplies an
/// implementation (mean-pooled, L2-normalized, fixed dimension); tests use
/// a deterministic mock.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Batched invocation for GPU utilization. Default loops over `encode`.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.encode(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str {
        "local"
    }
}

#[async_trait]
impl TextEncoder for std::sync::Arc<dyn TextEncoder> {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (**self).encode(text).await
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        (**self).encode_batch(texts).await
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Which strategy produced a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
    Hash,
}

/// Tiered embedder: local model, then remote API, then the hash fallback.
/// The ladder ends on a tier that cannot fail, so `embed` always yields a
/// vector of the configured dimension.
pub struct Embedder {
    local: Option<Box<dyn TextEncoder>>,
    remote: Option<RemoteEmbedder>,
    hash: HashEmbedder,
    dimension: usize,
}

/// What `info()` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedderInfo {
    pub tier: Tier,
    pub dimension: usize,
    pub provider: String,
}

impl Embedder {
    /// Hash-only embedder. The floor every other tier falls back to.
    pub fn hash_only(dimension: usize) -> Self {
        Self {
            local: None,
            remote: None,
            hash: HashEmbedder::new(dimension),
            dimension,
        }
    }

    pub fn with_local(mut self, encoder: impl TextEncoder + 'static) -> Self {
        debug_assert_eq!(encoder.dimension(), self.dimension);
        self.local = Some(Box::new(encoder));
        self
    }

    pub fn with_remote(mut self, remote: RemoteEmbedder) -> Self {
        debug_assert_eq!(remote.dimension(), self.dimension);
        self.remote = Some(remote);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn info(&self) -> EmbedderInfo {
        if let Some(local) = &self.local {
            EmbedderInfo {
                tier: Tier::Local,
                dimension: self.dimension,
                provider: local.name().to_string(),
            }
        } else if let Some(remote) = &self.remote {
            EmbedderInfo {
                tier: Tier::Remote,
                dimension: self.dimension,
                provider: remote.provider().to_string(),
            }
        } else {
            EmbedderInfo {
                tier: Tier::Hash,
                dimension: self.dimension,
                provider: "hash".to_string(),
            }
        }
    }

    /// Embed one text. Falls down the tier ladder on failure; the hash
    /// floor guarantees a dimension-D vector for any input.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(local) = &self.local {
            match local.encode(text).await.and_then(|v| self.check_dim(v)) {
                Ok(v) => return v,
                Err(e) => warn!(error = %e, "local embedding failed, falling back"),
            }
        }
        if let Some(remote) = &self.remote {
            match remote.embed(text).await.and_then(|v| self.check_dim(v)) {
                Ok(v) => return v,
                Err(e) => warn!(error = %e, "remote embedding failed, falling back to hash"),
            }
        }
        self.hash.embed(text)
    }

    /// Embed many texts in batches of `batch_size`. A failing batch falls
    /// back to single-item embedding of its contents rather than failing
    /// the whole call.
    pub async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Vec<Vec<f32>> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(batch_size) {
            match self.try_batch(chunk).await {
                Ok(vectors) => out.extend(vectors),
                Err(e) => {
                    warn!(
                        batch_len = chunk.len(),
                        error = %e,
                        "batch embedding failed, embedding items singly"
                    );
                    for text in chunk {
                        out.push(self.embed(text).await);
                    }
                }
            }
        }
        out
    }

    async fn try_batch(&self, chunk: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if let Some(local) = &self.local {
            let vectors = local.encode_batch(chunk).await?;
            return vectors.into_iter().map(|v| self.check_dim(v)).collect();
        }
        if let Some(remote) = &self.remote {
            let vectors = remote.embed_batch(chunk).await?;
            return vectors.into_iter().map(|v| self.check_dim(v)).collect();
        }
        Ok(chunk.iter().map(|t| self.hash.embed(t)).collect())
    }

    fn check_dim(&self, v: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
        if v.len() == self.dimension {
            Ok(v)
        } else {
            Err(EmbedError::Dimension {
                expected: self.dimension,
                got: v.len(),
            })
        }
    }

    /// Cosine similarity between two texts' embeddings.
    pub async fn similarity(&self, a: &str, b: &str) -> f32 {
        let va = self.embed(a).await;
        let vb = self.embed(b).await;
        cosine(&va, &vb)
    }
}

/// Cosine similarity. Zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// In-place L2 normalization. Zero vectors stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic encoder for tests: delegates to the hash tier but
    /// reports itself as a local model. `fail` makes every call error.
    pub struct StubEncoder {
        inner: HashEmbedder,
        pub fail: bool,
        pub fail_batch_only: bool,
    }

    impl StubEncoder {
        pub fn new(dimension: usize) -> Self {
            Self {
                inner: HashEmbedder::new(dimension),
                fail: false,
                fail_batch_only: false,
            }
        }
    }

    #[async_trait]
    impl TextEncoder for StubEncoder {
        async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            if self.fail {
                return Err(EmbedError::Request("stub encoder down".into()));
            }
            Ok(self.inner.embed(text))
        }

        async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if self.fail || self.fail_batch_only {
                return Err(EmbedError::Request("stub batch down".into()));
            }
            Ok(texts.iter().map(|t| self.inner.embed(t)).collect())
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn name(&self) -> &str {
            "stub-encoder"
        }
    }
}
