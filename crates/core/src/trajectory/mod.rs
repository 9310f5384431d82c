pub mod buffer;
pub mod store;

pub use buffer::{FlushOutcome, FlushReason, PolicyTrainer, TrajectoryBuffer};
pub use store::{InMemorySessionStore, PgSessionStore, SessionStore};
