//! One chat turn end to end: classify, backfill, decide, reply, record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rapport_llm::embedding::EmbeddingProvider;
use rapport_llm::provider::{CompletionRequest, LlmProvider};
use uuid::Uuid;

use super::history::DialogueHistory;
use super::prompt::{ContextSection, build_messages};
use crate::agent::{AgentState, TurnContext};
use crate::emotion::EmotionClassifier;
use crate::error::AgentError;
use crate::persona::PersonaRenderer;
use crate::trajectory::{FlushOutcome, SessionStore};
use crate::types::{ContextSource, Emotion, Speaker, UserProfile};

/// Reply used when the policy chooses to ask instead of answer.
pub const CLARIFYING_QUESTION: &str =
    "I'm not quite sure what you mean. Could you tell me a little more?";

/// Reply used when generation fails. The decision is still recorded.
pub const GENERATION_APOLOGY: &str = "Sorry, I couldn't put a reply together just now.";

/// Fetches material for the context sources the policy switched on.
#[async_trait::async_trait]
pub trait ContextAssembler: Send + Sync {
    async fn assemble(
        &self,
        user: &UserProfile,
        message: &str,
        sources: &[ContextSource],
    ) -> Result<Vec<ContextSection>, AgentError>;
}

/// Assembler for deployments without any retrieval backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

#[async_trait::async_trait]
impl ContextAssembler for NoContext {
    async fn assemble(
        &self,
        _user: &UserProfile,
        _message: &str,
        _sources: &[ContextSource],
    ) -> Result<Vec<ContextSection>, AgentError> {
        Ok(Vec::new())
    }
}

/// A conversation owned by the caller: who is talking and what was said.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user: UserProfile,
    pub history: DialogueHistory,
}

impl Session {
    pub fn new(user: UserProfile) -> Self {
        Self { id: Uuid::new_v4(), user, history: DialogueHistory::default() }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub persona_name: String,
    pub context_sources: Vec<ContextSource>,
    pub confidence: f32,
    pub asked_question: bool,
    pub user_emotion: Emotion,
    pub bot_emotion: Emotion,
    /// Reward credited to the previous turn, if any.
    pub backfilled_reward: Option<f32>,
    pub affinity: f32,
    pub generation_failed: bool,
    pub flush: FlushOutcome,
}

pub struct TurnProcessor {
    agent: Arc<AgentState>,
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: Arc<dyn EmotionClassifier>,
    renderer: Arc<dyn PersonaRenderer>,
    contexts: Arc<dyn ContextAssembler>,
    sessions: Arc<dyn SessionStore>,
    llm: Option<Arc<dyn LlmProvider>>,
    /// Serialises load-modify-save of one session's buffer across the
    /// awaits of a turn, so feedback arriving mid-turn is not overwritten.
    session_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl TurnProcessor {
    pub fn new(
        agent: Arc<AgentState>,
        embedder: Arc<dyn EmbeddingProvider>,
        classifier: Arc<dyn EmotionClassifier>,
        renderer: Arc<dyn PersonaRenderer>,
        sessions: Arc<dyn SessionStore>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            agent,
            embedder,
            classifier,
            renderer,
            contexts: Arc::new(NoContext),
            sessions,
            llm,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_contexts(mut self, contexts: Arc<dyn ContextAssembler>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn agent(&self) -> &Arc<AgentState> {
        &self.agent
    }

    fn session_lock(&self, session: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks.lock().entry(session).or_default().clone()
    }

    /// Credit the session's previous turn from the user's current emotion.
    pub async fn backfill(&self, session: Uuid, emotion: Emotion) -> Result<Option<f32>, AgentError> {
        let lock = self.session_lock(session);
        let _guard = lock.lock().await;
        let mut buffer = self.sessions.load(session).await?;
        let reward = buffer.backfill(emotion);
        if reward.is_some() {
            self.sessions.save(session, &buffer).await?;
        }
        Ok(reward)
    }

    pub async fn process_turn(
        &self,
        session: &mut Session,
        message: &str,
        has_image: bool,
    ) -> Result<TurnOutcome, AgentError> {
        let lock = self.session_lock(session.id);
        let _guard = lock.lock().await;
        let cfg = self.agent.cfg();
        let user_emotion = self.classifier.classify(message, Speaker::User).await?;

        let mut buffer = self.sessions.load(session.id).await?;
        let backfilled_reward = buffer.backfill(user_emotion);
        if let Some(reward) = backfilled_reward {
            tracing::debug!(session = %session.id, reward, emotion = user_emotion.as_str(), "implicit reward backfilled");
        }

        let history = session.history.newest_texts(cfg.history_window);
        let turn = TurnContext { user: &session.user, message, emotion: user_emotion, has_image };
        let decision = match self
            .agent
            .decide_action(self.embedder.as_ref(), self.renderer.as_ref(), turn, &history)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.sessions.save(session.id, &buffer).await?;
                return Err(e);
            }
        };

        let (reply, generation_failed) = if decision.is_question() {
            (CLARIFYING_QUESTION.to_owned(), false)
        } else {
            self.generate(session, &decision.persona_prompt, &decision.context_sources, message).await
        };

        let bot_emotion = match self.classifier.classify(&reply, Speaker::Bot).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "bot emotion classification failed, assuming neutral");
                Emotion::Neutral
            }
        };
        session.user.adjust_affinity(bot_emotion.affinity_delta());
        session.history.push(Speaker::User, message);
        session.history.push(Speaker::Bot, reply.clone());

        let flush = buffer.record(
            decision.to_experience(),
            cfg.flush_threshold,
            cfg.trajectory_cap,
            self.agent.as_ref(),
        );
        self.sessions.save(session.id, &buffer).await?;

        Ok(TurnOutcome {
            reply,
            persona_name: decision.persona_name,
            context_sources: decision.context_sources,
            confidence: decision.confidence,
            asked_question: decision.action.is_ask_question(),
            user_emotion,
            bot_emotion,
            backfilled_reward,
            affinity: session.user.affinity,
            generation_failed,
            flush,
        })
    }

    /// Explicit rating of the last turn: terminal reward and an immediate update.
    /// Rejected feedback leaves the stored buffer unchanged.
    pub async fn record_feedback(&self, session: Uuid, reward: f32) -> Result<FlushOutcome, AgentError> {
        let lock = self.session_lock(session);
        let _guard = lock.lock().await;
        let mut buffer = self.sessions.load(session).await?;
        let outcome = buffer.feedback(reward, self.agent.as_ref())?;
        self.sessions.save(session, &buffer).await?;
        Ok(outcome)
    }

    /// Discard whatever the session still has buffered. Unrated turns are
    /// not trained on.
    pub async fn end_session(&self, session: Uuid) -> Result<(), AgentError> {
        let lock = self.session_lock(session);
        {
            let _guard = lock.lock().await;
            self.sessions.clear(session).await?;
        }
        self.session_locks.lock().remove(&session);
        tracing::debug!(%session, "session ended");
        Ok(())
    }

    async fn generate(
        &self,
        session: &Session,
        persona_prompt: &str,
        sources: &[ContextSource],
        message: &str,
    ) -> (String, bool) {
        let Some(llm) = &self.llm else {
            tracing::warn!("no language model configured");
            return (GENERATION_APOLOGY.to_owned(), true);
        };

        let sections = if sources.is_empty() {
            Vec::new()
        } else {
            match self.contexts.assemble(&session.user, message, sources).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "context assembly failed, continuing without context");
                    Vec::new()
                }
            }
        };

        let cfg = self.agent.cfg();
        let request = CompletionRequest {
            messages: build_messages(persona_prompt, &sections, session.history.recent(2 * cfg.history_window), message),
            max_tokens: cfg.reply_max_tokens,
            temperature: cfg.reply_temperature,
        };
        match llm.complete(request).await {
            Ok(resp) => {
                tracing::debug!(provider = llm.name(), input_tokens = resp.input_tokens, output_tokens = resp.output_tokens, "reply generated");
                (resp.content, false)
            }
            Err(e) => {
                tracing::warn!(provider = llm.name(), error = %e, "reply generation failed");
                (GENERATION_APOLOGY.to_owned(), true)
            }
        }
    }
}
