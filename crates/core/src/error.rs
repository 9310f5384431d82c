use rapport_llm::embedding::EmbedError;

/// Errors raised by the policy engine and its collaborators.
///
/// Upstream and shape errors stop the turn (no guessed persona/context);
/// numerical and feedback errors only ever skip a training cycle.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("embedding provider failed: {0}")]
    Embedding(#[from] EmbedError),
    #[error("emotion classifier failed: {0}")]
    Classifier(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("checkpoint io: {0}")]
    CheckpointIo(#[from] std::io::Error),
    #[error("checkpoint format: {0}")]
    CheckpointFormat(#[from] serde_json::Error),
    #[error("numerical failure during learning: {0}")]
    Numerical(String),
    #[error("invalid experience at step {step}: {reason}")]
    InvalidExperience { step: usize, reason: String },
    #[error("feedback rejected: {0}")]
    FeedbackRejected(String),
    #[error("action sampling failed: {0}")]
    Sampling(String),
    #[error("session store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("stored session buffer is malformed: {0}")]
    SessionFormat(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

