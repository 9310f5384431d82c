use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Speaker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueLine {
    pub from_user: bool,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl DialogueLine {
    pub fn speaker(&self) -> Speaker {
        if self.from_user { Speaker::User } else { Speaker::Bot }
    }
}

/// Recent conversation for one session, oldest evicted first once full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueHistory {
    lines: Vec<DialogueLine>,
    capacity: usize,
}

impl Default for DialogueHistory {
    fn default() -> Self {
        Self::new(32)
    }
}

impl DialogueHistory {
    pub fn new(capacity: usize) -> Self {
        Self { lines: Vec::with_capacity(capacity), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        if self.lines.len() >= self.capacity {
            self.lines.remove(0);
        }
        self.lines.push(DialogueLine {
            from_user: speaker == Speaker::User,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Up to `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> &[DialogueLine] {
        let start = self.lines.len().saturating_sub(limit);
        &self.lines[start..]
    }

    /// Texts of the last `limit` lines, newest first.
    pub fn newest_texts(&self, limit: usize) -> Vec<String> {
        self.lines.iter().rev().take(limit).map(|l| l.text.clone()).collect()
    }
}
