use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::AgentError;

/// All policy-engine parameters. Loaded from the `agent_config` table at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCfg {
    // network shape
    pub hidden_dim: usize,
    pub user_table_size: usize,
    pub user_embed_dim: usize,
    pub sentence_dim: usize,
    pub history_window: usize,

    // optimisation
    pub learning_rate: f32,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub update_epochs: usize,
    pub value_coef: f32,
    pub entropy_coef: f32,
    pub advantage_epsilon: f32,

    // confidence gate
    pub confidence_entropy_weight: f32,
    pub confidence_threshold: f32,
    pub mask_floor: f32,

    // trajectory
    pub flush_threshold: usize,
    pub trajectory_cap: usize,

    // persistence
    pub checkpoint_path: String,

    // reply generation
    pub reply_max_tokens: u32,
    pub reply_temperature: f32,
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            hidden_dim: 128,
            user_table_size: 1000,
            user_embed_dim: 16,
            sentence_dim: 768,
            history_window: 3,
            learning_rate: 3e-4,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            update_epochs: 4,
            value_coef: 0.5,
            entropy_coef: 0.01,
            advantage_epsilon: 1e-7,
            confidence_entropy_weight: 0.01,
            confidence_threshold: -0.5,
            mask_floor: 1e-8,
            flush_threshold: 5,
            trajectory_cap: 64,
            checkpoint_path: "trained_models/policy_checkpoint.json".into(),
            reply_max_tokens: 512,
            reply_temperature: 0.7,
        }
    }
}

impl AgentCfg {
    /// Load config from `agent_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM agent_config")
                .fetch_all(pool)
                .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `agent_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let entries = self.to_entries();
        for (key, value, desc) in &entries {
            sqlx::query(
                "INSERT INTO agent_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Length of the encoded state vector.
    pub fn state_dim(&self) -> usize {
        self.user_embed_dim + 2 * self.sentence_dim + 2 + crate::types::Topic::COUNT
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.hidden_dim == 0 || self.user_table_size == 0 || self.sentence_dim == 0 {
            return Err(AgentError::Config("network dimensions must be non-zero".into()));
        }
        if self.flush_threshold == 0 {
            return Err(AgentError::Config("flush_threshold must be at least 1".into()));
        }
        if self.trajectory_cap < self.flush_threshold {
            return Err(AgentError::Config(format!(
                "trajectory_cap ({}) is below flush_threshold ({})",
                self.trajectory_cap, self.flush_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.clip_epsilon) || self.clip_epsilon == 0.0 {
            return Err(AgentError::Config("clip_epsilon must lie in (0, 1)".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(AgentError::Config("learning_rate must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            hidden_dim: get_or(m, "hidden_dim", d.hidden_dim),
            user_table_size: get_or(m, "user_table_size", d.user_table_size),
            user_embed_dim: get_or(m, "user_embed_dim", d.user_embed_dim),
            sentence_dim: get_or(m, "sentence_dim", d.sentence_dim),
            history_window: get_or(m, "history_window", d.history_window),
            learning_rate: get_or(m, "learning_rate", d.learning_rate),
            gamma: get_or(m, "gamma", d.gamma),
            gae_lambda: get_or(m, "gae_lambda", d.gae_lambda),
            clip_epsilon: get_or(m, "clip_epsilon", d.clip_epsilon),
            update_epochs: get_or(m, "update_epochs", d.update_epochs),
            value_coef: get_or(m, "value_coef", d.value_coef),
            entropy_coef: get_or(m, "entropy_coef", d.entropy_coef),
            advantage_epsilon: get_or(m, "advantage_epsilon", d.advantage_epsilon),
            confidence_entropy_weight: get_or(m, "confidence_entropy_weight", d.confidence_entropy_weight),
            confidence_threshold: get_or(m, "confidence_threshold", d.confidence_threshold),
            mask_floor: get_or(m, "mask_floor", d.mask_floor),
            flush_threshold: get_or(m, "flush_threshold", d.flush_threshold),
            trajectory_cap: get_or(m, "trajectory_cap", d.trajectory_cap),
            checkpoint_path: get_or(m, "checkpoint_path", d.checkpoint_path),
            reply_max_tokens: get_or(m, "reply_max_tokens", d.reply_max_tokens),
            reply_temperature: get_or(m, "reply_temperature", d.reply_temperature),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("hidden_dim", self.hidden_dim.to_string(), "Shared trunk width"),
            ("user_table_size", self.user_table_size.to_string(), "User embedding slots (id mod size)"),
            ("user_embed_dim", self.user_embed_dim.to_string(), "User embedding width"),
            ("sentence_dim", self.sentence_dim.to_string(), "Sentence embedding width"),
            ("history_window", self.history_window.to_string(), "Prior messages averaged into the state"),
            ("learning_rate", self.learning_rate.to_string(), "Adam learning rate"),
            ("gamma", self.gamma.to_string(), "Discount factor"),
            ("gae_lambda", self.gae_lambda.to_string(), "GAE lambda"),
            ("clip_epsilon", self.clip_epsilon.to_string(), "Surrogate ratio clip"),
            ("update_epochs", self.update_epochs.to_string(), "Gradient steps per trajectory"),
            ("value_coef", self.value_coef.to_string(), "Value loss weight"),
            ("entropy_coef", self.entropy_coef.to_string(), "Entropy bonus weight"),
            ("advantage_epsilon", self.advantage_epsilon.to_string(), "Advantage normalisation epsilon"),
            ("confidence_entropy_weight", self.confidence_entropy_weight.to_string(), "Entropy weight in the confidence score"),
            ("confidence_threshold", self.confidence_threshold.to_string(), "Confidence below which a question is forced"),
            ("mask_floor", self.mask_floor.to_string(), "Minimum mass when renormalising a masked distribution"),
            ("flush_threshold", self.flush_threshold.to_string(), "Trajectory length that triggers learning"),
            ("trajectory_cap", self.trajectory_cap.to_string(), "Hard cap on buffered experiences"),
            ("checkpoint_path", self.checkpoint_path.clone(), "Policy checkpoint file"),
            ("reply_max_tokens", self.reply_max_tokens.to_string(), "Reply generation max tokens"),
            ("reply_temperature", self.reply_temperature.to_string(), "Reply generation temperature"),
        ]
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
