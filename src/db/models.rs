use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Source;
use crate::commands::chat::ChatEvent;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub message_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A message as the UI holds it.
///
/// Assistant drafts grow while a turn streams and freeze once a terminal
/// event has been applied.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachment_refs: Vec<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub used_knowledge_base: bool,
    #[serde(default)]
    pub used_web_search: bool,
    pub response_time_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub complete: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, attachment_refs: Vec<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachment_refs,
            sources: Vec::new(),
            used_knowledge_base: false,
            used_web_search: false,
            response_time_seconds: None,
            timestamp: Utc::now(),
            cancelled: false,
            complete: true,
        }
    }

    pub fn assistant_draft() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            attachment_refs: Vec::new(),
            sources: Vec::new(),
            used_knowledge_base: false,
            used_web_search: false,
            response_time_seconds: None,
            timestamp: Utc::now(),
            cancelled: false,
            complete: false,
        }
    }

    /// Fold a controller event into this draft. Returns `false` if the
    /// message was already complete and nothing changed.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        if self.complete {
            return false;
        }
        match event {
            ChatEvent::Metadata {
                sources,
                used_rag,
                used_web_search,
            } => {
                self.sources = sources.clone();
                self.used_knowledge_base = *used_rag;
                self.used_web_search = *used_web_search;
            }
            ChatEvent::Chunk { full, .. } => {
                self.content.clone_from(full);
            }
            ChatEvent::Done {
                response_time,
                full,
            } => {
                self.content.clone_from(full);
                self.response_time_seconds = Some(*response_time);
                self.complete = true;
            }
            ChatEvent::Cancelled { partial } => {
                self.content.clone_from(partial);
                self.cancelled = true;
                self.complete = true;
            }
            ChatEvent::Error { .. } => {
                self.complete = true;
            }
        }
        true
    }
}

/// Row shape of the local message cache.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_follows_stream_and_freezes_on_done() {
        let mut msg = ChatMessage::assistant_draft();
        assert!(msg.apply(&ChatEvent::Metadata {
            sources: vec![Source::Name("Chamorro dictionary".into())],
            used_rag: true,
            used_web_search: false,
        }));
        msg.apply(&ChatEvent::Chunk {
            delta: "Håfa".into(),
            full: "Håfa".into(),
        });
        msg.apply(&ChatEvent::Chunk {
            delta: " adai".into(),
            full: "Håfa adai".into(),
        });
        assert!(msg.apply(&ChatEvent::Done {
            response_time: 1.5,
            full: "Håfa adai".into(),
        }));

        assert_eq!(msg.content, "Håfa adai");
        assert!(msg.used_knowledge_base);
        assert_eq!(msg.response_time_seconds, Some(1.5));
        assert!(msg.complete);

        assert!(!msg.apply(&ChatEvent::Chunk {
            delta: "!".into(),
            full: "Håfa adai!".into(),
        }));
        assert_eq!(msg.content, "Håfa adai");
    }

    #[test]
    fn cancelled_draft_keeps_partial_text() {
        let mut msg = ChatMessage::assistant_draft();
        msg.apply(&ChatEvent::Chunk {
            delta: "Si".into(),
            full: "Si".into(),
        });
        msg.apply(&ChatEvent::Cancelled {
            partial: "Si".into(),
        });
        assert!(msg.cancelled);
        assert!(msg.complete);
        assert_eq!(msg.content, "Si");
        assert_eq!(msg.response_time_seconds, None);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }
}
