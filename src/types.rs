//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityKind;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire string used by both the LLM payloads and the transcript
    /// data-channel lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation, immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A synthesis voice from the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Voice {
    /// Directory name, e.g. "en-US-Standard-C".
    pub name: String,
    /// BCP-47 language code the voice speaks.
    pub language_code: String,
    pub gender: String,
}

/// The (voice, language) pair chosen once per session on the first
/// successful language detection. Immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub voice: Voice,
    pub language: String,
}

impl Character {
    pub fn new(voice: Voice, language: impl Into<String>) -> Self {
        Self {
            voice,
            language: language.into(),
        }
    }
}

/// Persisted conversation record. This layout is a stable contract for
/// the history view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub activity_kind: ActivityKind,
    pub user_id: String,
    pub language: String,
    pub messages: Vec<Message>,
    pub timestamp: DateTime<Utc>,
}
