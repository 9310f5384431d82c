use std::sync::Arc;

use rapport_llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

use crate::error::AgentError;
use crate::types::{Emotion, Speaker};

/// Labels a piece of text with one of the fixed emotions.
#[async_trait::async_trait]
pub trait EmotionClassifier: Send + Sync {
    async fn classify(&self, text: &str, speaker: Speaker) -> Result<Emotion, AgentError>;
}

/// Keyword tables checked in order; the first hit wins.
const KEYWORDS: &[(Emotion, &[&str])] = &[
    (Emotion::Disgust, &["disgusting", "gross", "yuck", "revolting", "역겨", "징그"]),
    (Emotion::Anger, &["angry", "furious", "annoying", "hate", "mad at", "화나", "짜증"]),
    (Emotion::Fear, &["scared", "afraid", "terrified", "anxious", "worried", "무서", "불안"]),
    (Emotion::Sadness, &["sad", "depressed", "lonely", "miss you", "cry", "슬퍼", "우울", "외로"]),
    (Emotion::Surprise, &["wow", "no way", "really?", "unbelievable", "surprised", "헐", "대박", "깜짝"]),
    (Emotion::Happiness, &["happy", "glad", "great", "love", "thanks", "haha", "좋아", "행복", "고마워"]),
];

/// Deterministic classifier with no network dependency.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordEmotionClassifier;

impl KeywordEmotionClassifier {
    pub fn detect(text: &str) -> Emotion {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .find(|(_, kws)| kws.iter().any(|kw| lower.contains(kw)))
            .map(|(emotion, _)| *emotion)
            .unwrap_or(Emotion::Neutral)
    }
}

#[async_trait::async_trait]
impl EmotionClassifier for KeywordEmotionClassifier {
    async fn classify(&self, text: &str, _speaker: Speaker) -> Result<Emotion, AgentError> {
        Ok(Self::detect(text))
    }
}

const CLASSIFIER_PROMPT: &str = "Classify the emotion of the message below. \
Answer with exactly one word from: fear, surprise, anger, sadness, neutral, happiness, disgust.";

/// Asks a chat model for a single label. Unparseable answers count as neutral;
/// provider failures are errors.
pub struct LlmEmotionClassifier {
    provider: Arc<dyn LlmProvider>,
}

impl LlmEmotionClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn parse_answer(answer: &str) -> Option<Emotion> {
        answer
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .find_map(Emotion::parse)
    }
}

#[async_trait::async_trait]
impl EmotionClassifier for LlmEmotionClassifier {
    async fn classify(&self, text: &str, speaker: Speaker) -> Result<Emotion, AgentError> {
        let who = match speaker {
            Speaker::User => "user",
            Speaker::Bot => "assistant",
        };
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(CLASSIFIER_PROMPT),
                ChatMessage::user(format!("Speaker: {who}\nMessage: {text}")),
            ],
            max_tokens: 8,
            temperature: 0.0,
        };
        let response = self
            .provider
            .complete(request)
            .await
            .map_err(|e| AgentError::Classifier(e.to_string()))?;

        Ok(Self::parse_answer(&response.content).unwrap_or_else(|| {
            tracing::debug!(answer = %response.content, "unparseable emotion label, using neutral");
            Emotion::Neutral
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_llm::provider::MockProvider;

    #[test]
    fn keyword_detection() {
        assert_eq!(KeywordEmotionClassifier::detect("I'm so happy today"), Emotion::Happiness);
        assert_eq!(KeywordEmotionClassifier::detect("오늘 너무 우울해"), Emotion::Sadness);
        assert_eq!(KeywordEmotionClassifier::detect("ugh, gross"), Emotion::Disgust);
        assert_eq!(KeywordEmotionClassifier::detect("I hate this, so annoying"), Emotion::Anger);
        assert_eq!(KeywordEmotionClassifier::detect("what time is it"), Emotion::Neutral);
    }

    #[tokio::test]
    async fn llm_label_is_parsed() {
        let c = LlmEmotionClassifier::new(Arc::new(MockProvider::new("Happiness.")));
        assert_eq!(c.classify("yay", Speaker::User).await.unwrap(), Emotion::Happiness);

        let c = LlmEmotionClassifier::new(Arc::new(MockProvider::new("label: 분노")));
        assert_eq!(c.classify("...", Speaker::Bot).await.unwrap(), Emotion::Anger);
    }

    #[tokio::test]
    async fn unparseable_answer_is_neutral() {
        let c = LlmEmotionClassifier::new(Arc::new(MockProvider::new("I cannot tell")));
        assert_eq!(c.classify("hm", Speaker::User).await.unwrap(), Emotion::Neutral);
    }

    #[tokio::test]
    async fn provider_failure_is_an_error() {
        let c = LlmEmotionClassifier::new(Arc::new(MockProvider::failing()));
        assert!(matches!(c.classify("hm", Speaker::User).await, Err(AgentError::Classifier(_))));
    }
}
