pub mod history;
pub mod prompt;
pub mod turn;

pub use history::DialogueHistory;
pub use turn::{ContextAssembler, NoContext, Session, TurnOutcome, TurnProcessor};
