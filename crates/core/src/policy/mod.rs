//! Actor-critic policy: state encoding, network, action selection, learning.

pub mod distribution;
pub mod encoder;
pub mod learner;
pub mod network;
pub mod optimizer;
pub mod selector;

pub use encoder::{StateEncoder, TurnEmbeddings, UserEmbeddingTable};
pub use learner::{LearnReport, PpoParams, learn};
pub use network::{NetworkDims, PolicyOutput, PolicyValueNet};
pub use optimizer::Adam;
pub use selector::{GateParams, SampledAction};
