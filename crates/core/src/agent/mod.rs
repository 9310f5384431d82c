pub mod checkpoint;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use state::{AgentState, TurnContext};
