use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One content part in the upstream `contents` wire shape:
/// `{"text": …}` or `{"inline_data": {"mime_type": …, "data": …}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload, passed through untouched.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Append-only conversation log shared by all request tasks.
///
/// One mutex guards the whole sequence; none of the operations hold it
/// across I/O. History lives for the process lifetime only.
pub struct ChatHistory {
    base_prompt: String,
    turns: Mutex<Vec<Turn>>,
}

impl ChatHistory {
    pub fn new(base_prompt: String) -> Self {
        Self {
            base_prompt,
            turns: Mutex::new(Vec::new()),
        }
    }

    fn turns(&self) -> MutexGuard<'_, Vec<Turn>> {
        self.turns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a user turn. On the very first turn of a conversation the
    /// configured base prompt is prepended as an extra text part.
    pub fn append_user(&self, mut parts: Vec<Part>) {
        let mut turns = self.turns();
        if turns.is_empty() && !self.base_prompt.is_empty() {
            parts.insert(0, Part::Text(self.base_prompt.clone()));
        }
        turns.push(Turn {
            role: Role::User,
            parts,
        });
    }

    /// Append a model turn, but only when the last existing turn is a user
    /// turn. Returns whether the turn was appended.
    pub fn append_model(&self, text: String) -> bool {
        let mut turns = self.turns();
        if !matches!(turns.last(), Some(turn) if turn.role == Role::User) {
            return false;
        }
        turns.push(Turn {
            role: Role::Model,
            parts: vec![Part::Text(text)],
        });
        true
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns().clone()
    }

    pub fn last_role(&self) -> Option<Role> {
        self.turns().last().map(|turn| turn.role)
    }

    pub fn clear(&self) {
        self.turns().clear();
    }
}
