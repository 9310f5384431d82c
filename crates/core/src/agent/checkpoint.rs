//! Durable policy parameters.
//!
//! A checkpoint holds the network weights, the user embedding table and the
//! optimizer moments. It is written after every successful learning step and
//! read once at startup; any shape disagreement with the running
//! configuration is fatal.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::policy::{Adam, NetworkDims, PolicyValueNet, UserEmbeddingTable};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub dims: NetworkDims,
    /// `PolicyValueNet::to_flat` layout.
    pub weights: Vec<f32>,
    pub user_table: UserEmbeddingTable,
    pub optimizer: Adam,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(net: &PolicyValueNet, users: &UserEmbeddingTable, optimizer: &Adam) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            dims: net.dims(),
            weights: net.to_flat(),
            user_table: users.clone(),
            optimizer: optimizer.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild runtime parameters, rejecting anything that disagrees with
    /// the expected network and user-table shapes.
    pub fn restore(
        self,
        expected: NetworkDims,
        user_rows: usize,
        user_dim: usize,
    ) -> Result<(PolicyValueNet, UserEmbeddingTable, Adam), AgentError> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(AgentError::ShapeMismatch(format!(
                "checkpoint format {} (expected {CHECKPOINT_FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.dims != expected {
            return Err(AgentError::ShapeMismatch(format!(
                "checkpoint dims {:?} do not match configured {:?}",
                self.dims, expected
            )));
        }
        if self.user_table.rows() != user_rows || self.user_table.dim() != user_dim {
            return Err(AgentError::ShapeMismatch(format!(
                "checkpoint user table is {}x{}, configured {user_rows}x{user_dim}",
                self.user_table.rows(),
                self.user_table.dim()
            )));
        }
        let user_table =
            UserEmbeddingTable::from_parts(user_rows, user_dim, self.user_table.data().to_vec())?;

        let mut net = PolicyValueNet::zeros(expected);
        net.load_flat(&self.weights)?;
        self.optimizer.check_shape(net.param_count())?;
        Ok((net, user_table, self.optimizer))
    }
}

/// Durable checkpoint storage. Calls happen under the learning write lock,
/// so implementations are synchronous.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Option<Checkpoint>, AgentError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError>;
}

/// JSON file, replaced atomically via a sibling temp file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, AgentError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }
}

/// Process-local store; counts saves.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<Checkpoint>>,
    saves: Mutex<usize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self { slot: Mutex::new(Some(checkpoint)), saves: Mutex::new(0) }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        *self.slot.lock() = Some(checkpoint.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dims() -> NetworkDims {
        NetworkDims { state_dim: 10, hidden_dim: 8, persona_count: 6, context_count: 7, special_count: 2 }
    }

    fn sample() -> Checkpoint {
        let mut rng = StdRng::seed_from_u64(11);
        let net = PolicyValueNet::new(dims(), &mut rng);
        let users = UserEmbeddingTable::new(20, 4, &mut rng);
        let opt = Adam::new(net.param_count(), 3e-4);
        Checkpoint::capture(&net, &users, &opt)
    }

    #[test]
    fn file_roundtrip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested/policy.json"));
        assert!(store.load().unwrap().is_none());

        let ckpt = sample();
        store.save(&ckpt).unwrap();
        assert!(!store.tmp_path().exists());

        let loaded = store.load().unwrap().unwrap();
        let (net, users, opt) = loaded.restore(dims(), 20, 4).unwrap();
        assert_eq!(net.to_flat(), ckpt.weights);
        assert_eq!(&users, &ckpt.user_table);
        assert_eq!(opt, ckpt.optimizer);
    }

    #[test]
    fn mismatched_shapes_fail_loudly() {
        let other = NetworkDims { state_dim: 11, ..dims() };
        assert!(matches!(sample().restore(other, 20, 4), Err(AgentError::ShapeMismatch(_))));
        assert!(matches!(sample().restore(dims(), 21, 4), Err(AgentError::ShapeMismatch(_))));

        let mut truncated = sample();
        truncated.weights.pop();
        assert!(matches!(truncated.restore(dims(), 20, 4), Err(AgentError::ShapeMismatch(_))));

        let mut old = sample();
        old.format_version = 0;
        assert!(old.restore(dims(), 20, 4).is_err());
    }

    #[test]
    fn short_optimizer_moment_fails_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let mut json = serde_json::to_value(sample()).unwrap();
        json["optimizer"]["v"].as_array_mut().unwrap().pop();
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let loaded = FileCheckpointStore::new(&path).load().unwrap().unwrap();
        assert!(matches!(loaded.restore(dims(), 20, 4), Err(AgentError::ShapeMismatch(_))));
    }

    #[test]
    fn corrupt_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = FileCheckpointStore::new(&path);
        assert!(matches!(store.load(), Err(AgentError::CheckpointFormat(_))));
    }
}
