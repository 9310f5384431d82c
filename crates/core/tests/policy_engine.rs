//! Closed-loop tests for the adaptive persona policy.
//!
//! Everything runs in-process: hashed embeddings, the keyword emotion
//! classifier, a canned language model and in-memory session storage.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rapport_core::agent::{AgentState, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TurnContext};
use rapport_core::config::AgentCfg;
use rapport_core::dialogue::turn::CLARIFYING_QUESTION;
use rapport_core::dialogue::{Session, TurnProcessor};
use rapport_core::embedding::HashEmbedder;
use rapport_core::emotion::KeywordEmotionClassifier;
use rapport_core::error::AgentError;
use rapport_core::persona::TemplateRenderer;
use rapport_core::policy::NetworkDims;
use rapport_core::trajectory::{FlushOutcome, FlushReason, InMemorySessionStore, SessionStore};
use rapport_core::types::{ContextSource, Emotion, QUESTIONER, SpecialAction, UserProfile};
use rapport_llm::provider::MockProvider;

const DIM: usize = 32;

fn cfg() -> AgentCfg {
    AgentCfg { sentence_dim: DIM, hidden_dim: 16, user_table_size: 50, ..AgentCfg::default() }
}

/// A checkpoint derived from a seeded fresh network, with its flat weights edited.
fn store_with_weights(edit: impl FnOnce(&mut [f32], NetworkDims)) -> Arc<MemoryCheckpointStore> {
    let seed = AgentState::initialize_with_rng(cfg(), Arc::new(MemoryCheckpointStore::new()), StdRng::seed_from_u64(11))
        .unwrap();
    let mut ckpt = seed.checkpoint();
    let dims = ckpt.dims;
    edit(&mut ckpt.weights, dims);
    Arc::new(MemoryCheckpointStore::with_checkpoint(ckpt))
}

/// Value head is the tail of the flat layout: `hidden_dim` weights then one bias.
fn pin_value(weights: &mut [f32], dims: NetworkDims, value: f32) {
    let n = weights.len();
    weights[n - dims.hidden_dim - 1..].fill(0.0);
    weights[n - 1] = value;
}

/// Bias block of the context head, which follows the shared and persona layers.
fn context_bias_range(dims: NetworkDims) -> std::ops::Range<usize> {
    let h = dims.hidden_dim;
    let shared = h * dims.state_dim + h;
    let persona = dims.persona_count * h + dims.persona_count;
    let start = shared + persona + dims.context_count * h;
    start..start + dims.context_count
}

fn processor(agent: AgentState, sessions: Arc<InMemorySessionStore>) -> TurnProcessor {
    TurnProcessor::new(
        Arc::new(agent),
        Arc::new(HashEmbedder::new(DIM)),
        Arc::new(KeywordEmotionClassifier),
        Arc::new(TemplateRenderer::default()),
        sessions,
        Some(Arc::new(MockProvider::new("That sounds good."))),
    )
}

#[tokio::test]
async fn fifth_turn_triggers_learning_and_a_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let agent = AgentState::initialize_with_rng(cfg(), store.clone(), StdRng::seed_from_u64(1)).unwrap();
    let before = agent.checkpoint().weights;
    let sessions = Arc::new(InMemorySessionStore::new());
    let p = processor(agent, sessions.clone());
    let mut session = Session::new(UserProfile::new(7, "jun"));

    let messages = ["hi there", "how was your weekend", "I went hiking", "it was lovely", "I'm so happy"];
    let mut outcomes = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        let out = p.process_turn(&mut session, msg, false).await.unwrap();
        if i < 4 {
            assert_eq!(out.flush, FlushOutcome::Pending { len: i + 1 });
        }
        outcomes.push(out);
    }

    match &outcomes[4].flush {
        FlushOutcome::Learned { reason, report } => {
            assert_eq!(*reason, FlushReason::Threshold);
            assert_eq!(report.steps, 5);
            assert!(report.final_loss.is_finite());
        }
        other => panic!("expected a learning step, got {other:?}"),
    }
    assert_eq!(store.save_count(), 1);
    assert!(sessions.load(session.id).await.unwrap().is_empty());
    assert_ne!(p.agent().checkpoint().weights, before);
    assert_eq!(session.history.len(), 10);
}

#[tokio::test]
async fn explicit_feedback_terminates_and_flushes() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let agent = AgentState::initialize_with_rng(cfg(), store.clone(), StdRng::seed_from_u64(2)).unwrap();
    let sessions = Arc::new(InMemorySessionStore::new());
    let p = processor(agent, sessions.clone());
    let mut session = Session::new(UserProfile::new(7, "jun"));

    p.process_turn(&mut session, "hello", false).await.unwrap();
    p.process_turn(&mut session, "any plans for today", false).await.unwrap();
    let buffered = sessions.load(session.id).await.unwrap();
    assert_eq!(buffered.len(), 2);
    assert!(!buffered.experiences()[1].done);

    let out = p.record_feedback(session.id, 1.0).await.unwrap();
    assert!(matches!(out, FlushOutcome::Learned { reason: FlushReason::Feedback, .. }));
    assert_eq!(store.save_count(), 1);
    assert!(sessions.load(session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn low_value_forces_a_clarifying_question() {
    let store = store_with_weights(|w, dims| pin_value(w, dims, -100.0));
    let agent = AgentState::initialize(cfg(), store).unwrap();
    let sessions = Arc::new(InMemorySessionStore::new());
    let p = processor(agent, sessions.clone());
    let mut session = Session::new(UserProfile::new(3, "sol"));

    for msg in ["hmm", "what do you think", "tell me about the weather"] {
        let out = p.process_turn(&mut session, msg, false).await.unwrap();
        assert!(out.asked_question);
        assert_eq!(out.persona_name, QUESTIONER);
        assert!(out.context_sources.is_empty());
        assert_eq!(out.reply, CLARIFYING_QUESTION);
        assert!(out.confidence < -0.5);
    }

    let buffer = sessions.load(session.id).await.unwrap();
    for exp in buffer.experiences() {
        assert_eq!(exp.action.special, SpecialAction::AskQuestion.index());
        assert!(exp.log_prob.is_finite());
    }
}

#[test]
fn forced_question_skips_rendering() {
    let store = store_with_weights(|w, dims| pin_value(w, dims, -100.0));
    let agent = AgentState::initialize(cfg(), store).unwrap();
    let user = UserProfile::new(3, "sol");
    let embeddings = rapport_core::policy::TurnEmbeddings { message: vec![0.1; DIM], history_mean: vec![0.0; DIM] };
    let turn = TurnContext { user: &user, message: "hm", emotion: Emotion::Neutral, has_image: true };

    let d = agent.decide(&embeddings, &TemplateRenderer::default(), turn).unwrap();
    assert!(d.forced_question);
    assert!(d.is_question());
    assert_eq!(d.persona_prompt, "");
    assert!(d.context_sources.is_empty());
}

#[test]
fn attached_image_drops_vector_search_only() {
    let store = store_with_weights(|w, dims| {
        pin_value(w, dims, 0.0);
        w[context_bias_range(dims)].fill(50.0);
    });
    let agent = AgentState::initialize_with_rng(cfg(), store, StdRng::seed_from_u64(5)).unwrap();
    let user = UserProfile::new(3, "sol");
    let renderer = TemplateRenderer::default();
    let embeddings = rapport_core::policy::TurnEmbeddings { message: vec![0.2; DIM], history_mean: vec![0.0; DIM] };

    for _ in 0..10 {
        let plain = TurnContext { user: &user, message: "look", emotion: Emotion::Neutral, has_image: false };
        let d = agent.decide(&embeddings, &renderer, plain).unwrap();
        assert!(!d.is_question());
        assert_eq!(d.context_sources, ContextSource::ALL.to_vec());

        let with_image = TurnContext { has_image: true, ..plain };
        let d = agent.decide(&embeddings, &renderer, with_image).unwrap();
        assert_eq!(d.context_sources.len(), ContextSource::COUNT - 1);
        assert!(!d.context_sources.contains(&ContextSource::VectorSearch));
        // The recorded action still carries the sampled flag.
        assert!(d.action.context_flags[ContextSource::VectorSearch.index()]);
    }
}

#[tokio::test]
async fn file_checkpoint_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models").join("policy.json");

    let store = Arc::new(FileCheckpointStore::new(&path));
    assert!(store.load().unwrap().is_none());
    let agent = AgentState::initialize_with_rng(cfg(), store, StdRng::seed_from_u64(3)).unwrap();
    let sessions = Arc::new(InMemorySessionStore::new());
    let p = processor(agent, sessions);
    let mut session = Session::new(UserProfile::new(9, "ara"));
    p.process_turn(&mut session, "good morning", false).await.unwrap();
    p.record_feedback(session.id, 0.5).await.unwrap();
    assert!(path.exists());

    let trained = p.agent().checkpoint();
    let restarted = AgentState::initialize(cfg(), Arc::new(FileCheckpointStore::new(&path))).unwrap();
    let reloaded = restarted.checkpoint();
    assert_eq!(reloaded.weights, trained.weights);
    assert_eq!(reloaded.user_table, trained.user_table);
    assert_eq!(reloaded.optimizer, trained.optimizer);

    let resized = AgentCfg { hidden_dim: 24, ..cfg() };
    assert!(matches!(
        AgentState::initialize(resized, Arc::new(FileCheckpointStore::new(&path))),
        Err(AgentError::ShapeMismatch(_))
    ));
}

#[tokio::test]
async fn sessions_learn_independently() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let agent = AgentState::initialize_with_rng(cfg(), store.clone(), StdRng::seed_from_u64(4)).unwrap();
    let sessions = Arc::new(InMemorySessionStore::new());
    let p = processor(agent, sessions.clone());
    let mut a = Session::new(UserProfile::new(1, "a"));
    let mut b = Session::new(UserProfile::new(2, "b"));

    for _ in 0..3 {
        p.process_turn(&mut a, "hello", false).await.unwrap();
        p.process_turn(&mut b, "hello", false).await.unwrap();
    }
    assert_eq!(sessions.session_count(), 2);
    assert_eq!(sessions.load(a.id).await.unwrap().len(), 3);
    assert_eq!(sessions.load(b.id).await.unwrap().len(), 3);
    assert_eq!(store.save_count(), 0);
}
