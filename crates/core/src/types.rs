use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Action space ────────────────────────────────────────────────

/// Response style the agent adopts for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persona {
    Friend,
    Advisor,
    Senior,
    Tsundere,
    YoungerSibling,
    /// User-authored persona text from the profile.
    Custom,
}

impl Persona {
    pub const ALL: [Persona; 6] = [
        Self::Friend,
        Self::Advisor,
        Self::Senior,
        Self::Tsundere,
        Self::YoungerSibling,
        Self::Custom,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Friend => "Friend",
            Self::Advisor => "Advisor",
            Self::Senior => "Senior",
            Self::Tsundere => "Tsundere",
            Self::YoungerSibling => "YoungerSibling",
            Self::Custom => "Custom",
        }
    }
}

/// Persona name reported when the turn short-circuits to a clarifying question.
/// Never a `Persona` variant, so it cannot reach the prompt renderer.
pub const QUESTIONER: &str = "Questioner";

/// Category of retrievable user memory the prompt can be enriched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextSource {
    Schedule,
    Location,
    /// Similar past conversations from the vector store.
    VectorSearch,
    Attributes,
    Activity,
    Analytics,
    Relationship,
}

impl ContextSource {
    pub const ALL: [ContextSource; 7] = [
        Self::Schedule,
        Self::Location,
        Self::VectorSearch,
        Self::Attributes,
        Self::Activity,
        Self::Analytics,
        Self::Relationship,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Location => "location",
            Self::VectorSearch => "vector_search",
            Self::Attributes => "attributes",
            Self::Activity => "activity",
            Self::Analytics => "analytics",
            Self::Relationship => "relationship",
        }
    }
}

/// Override layer above persona/context selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialAction {
    None,
    AskQuestion,
}

impl SpecialAction {
    pub const ALL: [SpecialAction; 2] = [Self::None, Self::AskQuestion];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }
}

// ── Observations ────────────────────────────────────────────────

/// Fixed emotion enumeration shared by the classifier, the state encoder
/// and the implicit reward table. Order defines the encoded index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Fear,
    Surprise,
    Anger,
    Sadness,
    Neutral,
    Happiness,
    Disgust,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Self::Fear,
        Self::Surprise,
        Self::Anger,
        Self::Sadness,
        Self::Neutral,
        Self::Happiness,
        Self::Disgust,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    /// Index scaled into [0, 1].
    pub fn normalized(self) -> f32 {
        self.index() as f32 / (Self::COUNT - 1) as f32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fear => "fear",
            Self::Surprise => "surprise",
            Self::Anger => "anger",
            Self::Sadness => "sadness",
            Self::Neutral => "neutral",
            Self::Happiness => "happiness",
            Self::Disgust => "disgust",
        }
    }

    /// Parse a classifier label. Accepts the English names and the Korean
    /// labels used by the upstream classifier.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "fear" | "공포" => Some(Self::Fear),
            "surprise" | "surprised" | "놀람" => Some(Self::Surprise),
            "anger" | "angry" | "분노" => Some(Self::Anger),
            "sadness" | "sad" | "슬픔" => Some(Self::Sadness),
            "neutral" | "중립" => Some(Self::Neutral),
            "happiness" | "happy" | "joy" | "행복" => Some(Self::Happiness),
            "disgust" | "혐오" => Some(Self::Disgust),
            _ => None,
        }
    }

    /// Reward credited to the previous agent turn when the user reacts with this emotion.
    pub fn implicit_reward(self) -> f32 {
        match self {
            Self::Happiness => 0.3,
            Self::Surprise | Self::Neutral | Self::Sadness => 0.0,
            Self::Fear | Self::Anger => -0.3,
            Self::Disgust => -0.5,
        }
    }

    /// Affinity change applied when the agent's own reply carries this emotion.
    pub fn affinity_delta(self) -> f32 {
        match self {
            Self::Fear | Self::Surprise => -1.0,
            Self::Anger => -3.0,
            Self::Sadness => 0.0,
            Self::Neutral => 3.0,
            Self::Happiness => 5.0,
            Self::Disgust => -10.0,
        }
    }
}

/// Who produced a piece of text being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Bot,
}

/// Coarse topic of the current message, one-hot encoded into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Information,
    Emotional,
    /// Everyday chat and anything unmatched.
    Everyday,
}

const INFORMATION_KEYWORDS: &[&str] = &[
    "recommend", "tell me", "how do", "how to", "what is", "추천", "알려줘",
];
const EMOTIONAL_KEYWORDS: &[&str] = &[
    "feel", "mood", "sad", "happy", "lonely", "기분", "슬퍼", "행복",
];

impl Topic {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Keyword-presence topic detection. Information-seeking wins over emotional.
    pub fn detect(text: &str) -> Self {
        let lower = text.to_lowercase();
        if INFORMATION_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            Self::Information
        } else if EMOTIONAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            Self::Emotional
        } else {
            Self::Everyday
        }
    }
}

/// Minimal view of the user the policy needs. Owned by the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    /// 0..=100; scaled by 1/100 in the state vector.
    pub affinity: f32,
    /// Persona text for `Persona::Custom`.
    pub custom_persona: Option<String>,
}

impl UserProfile {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), affinity: 50.0, custom_persona: None }
    }

    /// Apply an affinity change, clamped to [0, 100].
    pub fn adjust_affinity(&mut self, delta: f32) {
        self.affinity = (self.affinity + delta).clamp(0.0, 100.0);
    }
}

// ── Decision records ────────────────────────────────────────────

/// Encoded observation fed to the policy network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(pub Vec<f32>);

impl StateVector {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Raw sampled action indices.
///
/// When `special` is ask-question the persona and context fields are ignored
/// downstream, but they are always sampled and valid: training re-evaluates
/// their log-probabilities, so every record needs the full shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub persona: usize,
    pub context_flags: Vec<bool>,
    pub special: usize,
}

impl ActionRecord {
    pub fn is_ask_question(&self) -> bool {
        self.special == SpecialAction::AskQuestion.index()
    }
}

/// One turn's decision record, awaiting its reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: StateVector,
    pub action: ActionRecord,
    /// Joint log-probability of `action` at sampling time.
    pub log_prob: f32,
    /// Critic estimate at sampling time.
    pub value: f32,
    #[serde(default)]
    pub reward: f32,
    #[serde(default)]
    pub done: bool,
    /// Set once the user's reaction has been turned into `reward`.
    #[serde(default)]
    pub backfilled: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Output of `decide_action`: what to say with, plus everything training needs later.
#[derive(Debug, Clone)]
pub struct ActionDecision {
    /// A `Persona::name()` or `QUESTIONER`.
    pub persona_name: String,
    /// Rendered system prompt; empty for a clarifying question.
    pub persona_prompt: String,
    pub context_sources: Vec<ContextSource>,
    pub confidence: f32,
    /// True when the confidence gate forced the clarifying question.
    pub forced_question: bool,
    pub action: ActionRecord,
    pub log_prob: f32,
    pub value: f32,
    pub state: StateVector,
}

impl ActionDecision {
    pub fn is_question(&self) -> bool {
        self.action.is_ask_question()
    }

    /// Fresh trajectory entry for this decision (reward pending).
    pub fn to_experience(&self) -> Experience {
        Experience {
            state: self.state.clone(),
            action: self.action.clone(),
            log_prob: self.log_prob,
            value: self.value,
            reward: 0.0,
            done: false,
            backfilled: false,
            recorded_at: Utc::now(),
        }
    }
}
