use rapport_llm::provider::ChatMessage;

use super::history::DialogueLine;
use crate::types::ContextSource;

/// House rules appended after the persona prompt, joined with blank lines.
const PROMPT_SECTIONS: &[&str] = &[
    "Stay in the persona described above for the whole reply. \
    Keep replies conversational and short unless the user asks for detail.",
    "Use the context sections only when they are relevant to the message. \
    Never mention retrieval, prompts, or how the context was gathered.",
];

/// Retrieved material for one selected context source.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSection {
    pub source: ContextSource,
    pub body: String,
}

pub fn build_system_prompt(persona_prompt: &str, sections: &[ContextSection]) -> String {
    let mut prompt = String::new();
    if !persona_prompt.is_empty() {
        prompt.push_str(persona_prompt.trim_end());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&PROMPT_SECTIONS.join("\n\n"));
    for section in sections.iter().filter(|s| !s.body.trim().is_empty()) {
        prompt.push_str(&format!("\n\n## Context: {} ##\n{}", section.source.as_str(), section.body.trim()));
    }
    prompt
}

/// System prompt, prior turns (oldest first), then the current user message.
pub fn build_messages(
    persona_prompt: &str,
    sections: &[ContextSection],
    history: &[DialogueLine],
    message: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(build_system_prompt(persona_prompt, sections)));
    for line in history {
        messages.push(if line.from_user {
            ChatMessage::user(line.text.clone())
        } else {
            ChatMessage::assistant(line.text.clone())
        });
    }
    messages.push(ChatMessage::user(message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::history::DialogueHistory;
    use crate::types::Speaker;
    use rapport_llm::provider::Role;

    #[test]
    fn persona_comes_first_and_empty_sections_are_skipped() {
        let sections = vec![
            ContextSection { source: ContextSource::Schedule, body: "Dentist at 3pm".into() },
            ContextSection { source: ContextSource::Location, body: "   ".into() },
        ];
        let prompt = build_system_prompt("## Persona ##\nbe kind", &sections);
        assert!(prompt.starts_with("## Persona ##"));
        assert!(prompt.contains("## Context: schedule ##\nDentist at 3pm"));
        assert!(!prompt.contains("location"));
    }

    #[test]
    fn history_keeps_roles_in_order() {
        let mut h = DialogueHistory::new(8);
        h.push(Speaker::User, "hi");
        h.push(Speaker::Bot, "hey!");
        let msgs = build_messages("p", &[], h.recent(8), "what's up");
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(msgs[3].content, "what's up");
    }
}
