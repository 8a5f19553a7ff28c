//! Exact nearest-neighbour search over embedding vectors.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use fieldforge_shared::{Callable, FieldforgeError, ParamValue, Result};

/// Signature of an embedding function: one vector per input text.
pub type EmbedFn = Arc<dyn Fn(&[String]) -> Result<Vec<Vec<f32>>> + Send + Sync>;

/// A named embedding function.
#[derive(Clone)]
pub struct Embedder {
    name: Arc<str>,
    embed: EmbedFn,
}

impl Embedder {
    pub fn new(
        name: impl Into<Arc<str>>,
        embed: impl Fn(&[String]) -> Result<Vec<Vec<f32>>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            embed: Arc::new(embed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Embed `texts`, checking that one vector comes back per text.
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = (self.embed)(texts)?;
        if vectors.len() != texts.len() {
            return Err(FieldforgeError::Provider(format!(
                "embedder `{}` returned {} vectors for {} texts",
                self.name,
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

impl fmt::Debug for Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Embedder({})", self.name)
    }
}

impl From<Embedder> for ParamValue {
    fn from(embedder: Embedder) -> Self {
        ParamValue::Callable(Callable::new(Arc::clone(&embedder.name), embedder))
    }
}

/// Flat (brute-force) L2 index.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    /// Build an index; all vectors must share one non-zero dimension.
    pub fn build(vectors: Vec<Vec<f32>>) -> Result<Self> {
        let dim = vectors.first().map(Vec::len).unwrap_or(0);
        if dim == 0 {
            return Err(FieldforgeError::validation(
                "cannot build an index from empty vectors",
            ));
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dim) {
            return Err(FieldforgeError::validation(format!(
                "vector {bad} has dimension {}, expected {dim}",
                vectors[bad].len()
            )));
        }
        Ok(Self { dim, vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Indices of the `k` nearest vectors, nearest first; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<usize>> {
        if query.len() != self.dim {
            return Err(FieldforgeError::Provider(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dim
            )));
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, squared_l2(v, query)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        Ok(scored.into_iter().take(k).map(|(i, _)| i).collect())
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
