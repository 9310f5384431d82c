use crate::error::AgentError;
use crate::types::{Persona, UserProfile};

/// Turns a chosen persona into the system prompt for reply generation.
///
/// Never receives the clarifying-question sentinel; the selector resolves
/// that case before rendering.
pub trait PersonaRenderer: Send + Sync {
    fn render(&self, persona: Persona, user: &UserProfile) -> Result<String, AgentError>;
}

/// Built-in persona descriptions plus an affinity-dependent tone rule.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    bot_name: String,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new("Rapport")
    }
}

impl TemplateRenderer {
    pub fn new(bot_name: impl Into<String>) -> Self {
        Self { bot_name: bot_name.into() }
    }

    fn description(persona: Persona) -> &'static str {
        match persona {
            Persona::Friend => {
                "You are the user's close friend. Talk casually, react honestly, and keep replies short and warm."
            }
            Persona::Advisor => {
                "You are a calm, knowledgeable advisor. Give clear, practical suggestions and explain your reasoning briefly."
            }
            Persona::Senior => {
                "You are a dependable senior who has been through similar things. Share experience, encourage, and occasionally tease."
            }
            Persona::Tsundere => {
                "You act a little cold and grumpy on the surface but clearly care. Deny being nice while being nice."
            }
            Persona::YoungerSibling => {
                "You are the user's cheerful younger sibling. Be playful, curious, and openly affectionate."
            }
            Persona::Custom => "",
        }
    }

    fn tone_rule(affinity: f32) -> &'static str {
        if affinity < 30.0 {
            "Your relationship is still distant: stay polite and avoid overly personal remarks."
        } else if affinity < 70.0 {
            "You are on friendly terms: be relaxed and show interest in their day."
        } else {
            "You are very close: speak intimately and reference shared moments freely."
        }
    }
}

impl PersonaRenderer for TemplateRenderer {
    fn render(&self, persona: Persona, user: &UserProfile) -> Result<String, AgentError> {
        let description = match (persona, user.custom_persona.as_deref()) {
            (Persona::Custom, Some(text)) if !text.trim().is_empty() => text.trim(),
            (Persona::Custom, _) => {
                tracing::warn!(user_id = user.id, "custom persona chosen but profile has none; using friend");
                Self::description(Persona::Friend)
            }
            (p, _) => Self::description(p),
        };
        Ok(format!(
            "## Persona ##\nYour name is {bot}. You are chatting with {user}.\n{description}\n\n\
             ## Relationship ##\nAffinity: {affinity:.0}/100. {tone}\n",
            bot = self.bot_name,
            user = user.name,
            affinity = user.affinity,
            tone = Self::tone_rule(user.affinity),
        ))
    }
}
