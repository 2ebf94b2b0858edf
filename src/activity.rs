//! Conversational activities.
//!
//! An activity fixes the system-role prompt prefix for a session. The
//! contract is only that the prefix consists of system messages, in
//! order, before any user/assistant message; the wording is per-kind.

use serde::{Deserialize, Serialize};

use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Free-form conversation practice.
    #[default]
    Unstructured,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Unstructured => "unstructured",
        }
    }

    /// The system-role prompt prefix for this activity.
    ///
    /// Note the voice and language are chosen from the user's first
    /// utterance and then fixed; if the user switches languages
    /// mid-session the assistant's voice does not follow.
    pub fn prompt(&self) -> Vec<Message> {
        match self {
            ActivityKind::Unstructured => vec![
                Message::system(
                    "You are a conversational partner for helping language learners \
                     practice a second language.",
                ),
                Message::system(
                    "DO NOT provide a translation. Respond in the language the user \
                     speaks unless asked explicitly for a translation.",
                ),
                Message::system(
                    "In the conversation section, after these instructions, DO NOT \
                     break character.",
                ),
            ],
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn prompt_is_all_system_messages() {
        let prompt = ActivityKind::Unstructured.prompt();
        assert!(!prompt.is_empty());
        assert!(prompt.iter().all(|m| m.role == Role::System));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ActivityKind::Unstructured).unwrap();
        assert_eq!(json, "\"unstructured\"");
    }
}
