use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rapport_llm::embedding::EmbeddingProvider;

use super::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::AgentCfg;
use crate::error::AgentError;
use crate::persona::PersonaRenderer;
use crate::policy::selector::{resolve, select};
use crate::policy::{
    Adam, GateParams, LearnReport, NetworkDims, PolicyValueNet, PpoParams, StateEncoder,
    TurnEmbeddings, UserEmbeddingTable, learn,
};
use crate::trajectory::PolicyTrainer;
use crate::types::{ActionDecision, Emotion, Topic, UserProfile};

/// Everything a learning step mutates. Guarded as one unit.
struct PolicyCore {
    net: PolicyValueNet,
    users: UserEmbeddingTable,
    optimizer: Adam,
}

/// Everything one decision needs to know about the turn besides embeddings.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub user: &'a UserProfile,
    pub message: &'a str,
    pub emotion: Emotion,
    pub has_image: bool,
}

/// Process-wide policy state, constructed once and shared by `Arc`.
///
/// Inference takes the read side of the lock, learning the write side, so
/// a decision never observes a half-applied update. The embedding call is
/// the only suspension point and completes before the lock is taken.
pub struct AgentState {
    cfg: AgentCfg,
    dims: NetworkDims,
    encoder: StateEncoder,
    gate: GateParams,
    ppo: PpoParams,
    core: RwLock<PolicyCore>,
    checkpoints: Arc<dyn CheckpointStore>,
    rng: Mutex<StdRng>,
}

impl AgentState {
    /// Load parameters from `checkpoints`, or start fresh if none exist.
    /// A checkpoint that does not fit `cfg` is an error.
    pub fn initialize(cfg: AgentCfg, checkpoints: Arc<dyn CheckpointStore>) -> Result<Self, AgentError> {
        Self::initialize_with_rng(cfg, checkpoints, StdRng::from_entropy())
    }

    pub fn initialize_with_rng(
        cfg: AgentCfg,
        checkpoints: Arc<dyn CheckpointStore>,
        mut rng: StdRng,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        let dims = NetworkDims::from_cfg(&cfg);

        let core = match checkpoints.load()? {
            Some(ckpt) => {
                let saved_at = ckpt.saved_at;
                let (net, users, optimizer) =
                    ckpt.restore(dims, cfg.user_table_size, cfg.user_embed_dim)?;
                tracing::info!(%saved_at, steps = optimizer.steps_taken(), "policy checkpoint loaded");
                PolicyCore { net, users, optimizer }
            }
            None => {
                let net = PolicyValueNet::new(dims, &mut rng);
                let users = UserEmbeddingTable::new(cfg.user_table_size, cfg.user_embed_dim, &mut rng);
                let optimizer = Adam::new(net.param_count(), cfg.learning_rate);
                tracing::info!(params = net.param_count(), state_dim = dims.state_dim, "fresh policy initialized");
                PolicyCore { net, users, optimizer }
            }
        };

        Ok(Self {
            encoder: StateEncoder::new(&cfg),
            gate: GateParams::from_cfg(&cfg),
            ppo: PpoParams::from_cfg(&cfg),
            dims,
            cfg,
            core: RwLock::new(core),
            checkpoints,
            rng: Mutex::new(rng),
        })
    }

    pub fn cfg(&self) -> &AgentCfg {
        &self.cfg
    }

    pub fn dims(&self) -> NetworkDims {
        self.dims
    }

    /// Choose persona, contexts and the special action for one turn.
    pub async fn decide_action(
        &self,
        embedder: &dyn EmbeddingProvider,
        renderer: &dyn PersonaRenderer,
        turn: TurnContext<'_>,
        history: &[String],
    ) -> Result<ActionDecision, AgentError> {
        let embeddings = self.encoder.embed_turn(embedder, turn.message, history).await?;
        self.decide(&embeddings, renderer, turn)
    }

    /// Synchronous half of `decide_action`, for callers that already hold embeddings.
    pub fn decide(
        &self,
        embeddings: &TurnEmbeddings,
        renderer: &dyn PersonaRenderer,
        turn: TurnContext<'_>,
    ) -> Result<ActionDecision, AgentError> {
        let topic = Topic::detect(turn.message);
        let (sampled, state) = {
            let core = self.core.read();
            let state = self.encoder.encode(
                core.users.row(turn.user.id),
                embeddings,
                turn.user.affinity,
                turn.emotion,
                topic,
            );
            let output = core.net.forward(&state)?;
            let mut rng = self.rng.lock();
            (select(&output, &self.gate, &mut *rng)?, state)
        };

        let decision = resolve(sampled, state, renderer, turn.user, turn.has_image)?;
        tracing::info!(
            user_id = turn.user.id,
            persona = %decision.persona_name,
            contexts = ?decision.context_sources,
            confidence = decision.confidence,
            forced_question = decision.forced_question,
            ?topic,
            "action decided"
        );
        Ok(decision)
    }

    /// One PPO update followed by a checkpoint write.
    ///
    /// A failed update leaves parameters untouched. A failed write is
    /// logged; the in-memory update stands.
    pub fn learn(&self, trajectory: &[crate::types::Experience]) -> Result<LearnReport, AgentError> {
        let mut guard = self.core.write();
        let core = &mut *guard;
        let report = learn(&mut core.net, &mut core.optimizer, trajectory, &self.ppo)?;
        let ckpt = Checkpoint::capture(&core.net, &core.users, &core.optimizer);
        if let Err(e) = self.checkpoints.save(&ckpt) {
            tracing::error!(error = %e, "failed to persist policy checkpoint");
        }
        Ok(report)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let core = self.core.read();
        Checkpoint::capture(&core.net, &core.users, &core.optimizer)
    }
}

impl PolicyTrainer for AgentState {
    fn train(&self, trajectory: &[crate::types::Experience]) -> Result<LearnReport, AgentError> {
        self.learn(trajectory)
    }
}
