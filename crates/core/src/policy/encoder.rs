//! Turn observation → `StateVector`.
//!
//! Layout: `[user embedding | message | history mean | affinity | emotion | topic one-hot]`.

use rand::Rng;
use rapport_llm::embedding::{EmbedError, EmbeddingProvider};
use serde::{Deserialize, Serialize};

use crate::config::AgentCfg;
use crate::error::AgentError;
use crate::types::{Emotion, StateVector, Topic};

/// Per-user learned vector, indexed by `user_id mod rows`. Collisions are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEmbeddingTable {
    rows: usize,
    dim: usize,
    data: Vec<f32>,
}

impl UserEmbeddingTable {
    /// Uniform(-√3, √3) entries: zero mean, unit variance.
    pub fn new<R: Rng + ?Sized>(rows: usize, dim: usize, rng: &mut R) -> Self {
        let bound = 3.0_f32.sqrt();
        let data = (0..rows * dim).map(|_| rng.gen_range(-bound..bound)).collect();
        Self { rows, dim, data }
    }

    pub fn from_parts(rows: usize, dim: usize, data: Vec<f32>) -> Result<Self, AgentError> {
        if data.len() != rows * dim {
            return Err(AgentError::ShapeMismatch(format!(
                "user table {rows}x{dim} needs {} values, got {}",
                rows * dim,
                data.len()
            )));
        }
        Ok(Self { rows, dim, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn slot(&self, user_id: i64) -> usize {
        user_id.rem_euclid(self.rows as i64) as usize
    }

    pub fn row(&self, user_id: i64) -> &[f32] {
        let start = self.slot(user_id) * self.dim;
        &self.data[start..start + self.dim]
    }
}

/// Sentence embeddings for one turn, fetched before any lock is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEmbeddings {
    pub message: Vec<f32>,
    /// Mean of the used history embeddings; zeros when there is no history.
    pub history_mean: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct StateEncoder {
    sentence_dim: usize,
    history_window: usize,
}

impl StateEncoder {
    pub fn new(cfg: &AgentCfg) -> Self {
        Self { sentence_dim: cfg.sentence_dim, history_window: cfg.history_window }
    }

    /// Embed the message and the first `history_window` history entries
    /// (callers pass history newest first).
    pub async fn embed_turn(
        &self,
        provider: &dyn EmbeddingProvider,
        message: &str,
        history: &[String],
    ) -> Result<TurnEmbeddings, AgentError> {
        let mut texts = Vec::with_capacity(1 + self.history_window);
        texts.push(message.to_owned());
        texts.extend(history.iter().take(self.history_window).cloned());

        let embeddings = provider.embed_batch(&texts).await?;
        if embeddings.len() != texts.len() {
            return Err(EmbedError::RequestFailed(format!(
                "provider {} returned {} embeddings for {} texts",
                provider.name(),
                embeddings.len(),
                texts.len()
            ))
            .into());
        }
        for e in &embeddings {
            if e.len() != self.sentence_dim {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.sentence_dim,
                    got: e.len(),
                }
                .into());
            }
        }

        let mut iter = embeddings.into_iter();
        let message = iter.next().unwrap_or_else(|| vec![0.0; self.sentence_dim]);
        let mut history_mean = vec![0.0; self.sentence_dim];
        let mut used = 0usize;
        for e in iter {
            for (acc, v) in history_mean.iter_mut().zip(&e) {
                *acc += v;
            }
            used += 1;
        }
        if used > 0 {
            let n = used as f32;
            history_mean.iter_mut().for_each(|v| *v /= n);
        }
        tracing::debug!(history_used = used, "turn embedded");
        Ok(TurnEmbeddings { message, history_mean })
    }

    pub fn encode(
        &self,
        user_row: &[f32],
        embeddings: &TurnEmbeddings,
        affinity: f32,
        emotion: Emotion,
        topic: Topic,
    ) -> StateVector {
        let mut v = Vec::with_capacity(user_row.len() + 2 * self.sentence_dim + 2 + Topic::COUNT);
        v.extend_from_slice(user_row);
        v.extend_from_slice(&embeddings.message);
        v.extend_from_slice(&embeddings.history_mean);
        v.push(affinity / 100.0);
        v.push(emotion.normalized());
        let mut one_hot = [0.0; Topic::COUNT];
        one_hot[topic.index()] = 1.0;
        v.extend_from_slice(&one_hot);
        StateVector(v)
    }
}
