// src/models.rs

use crate::constants::*;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Conversations keyed by id. Ids are time-ordered, so iteration order is
/// creation order.
pub type ConversationMap = BTreeMap<String, Conversation>;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional display hints attached to a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
}

/// Represents a message in the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            meta: None,
        }
    }

    /// An empty assistant message used as the streaming target.
    pub fn placeholder() -> Self {
        Self::new(Role::Assistant, String::new())
    }
}

/// Represents a named conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: NEW_CHAT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a message and returns its index.
    ///
    /// The first user message names the conversation.
    pub fn append(&mut self, message: Message) -> usize {
        if self.messages.is_empty() && message.role == Role::User {
            self.title = derive_title(&message.content);
        }
        self.messages.push(message);
        self.touch();
        self.messages.len() - 1
    }

    /// Overwrites the content of the streaming placeholder at `index`.
    ///
    /// Returns `false` without touching anything when the slot no longer holds
    /// the same assistant message (e.g. the conversation was cleared).
    pub fn write_reply(&mut self, index: usize, message: &Message) -> bool {
        match self.messages.get_mut(index) {
            Some(slot) if slot.id == message.id && slot.role == Role::Assistant => {
                slot.content.clone_from(&message.content);
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Empties the transcript and resets the title.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.title = NEW_CHAT_TITLE.to_string();
        self.touch();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Bumps `updated_at`, keeping it strictly increasing.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// User-editable chat settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ChatConfig {
    pub fn temperature_in_range(temperature: f32) -> bool {
        (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature)
    }
}

/// Logs details of each API call.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiCallLog {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub request_summary: String,
    pub response_status: u16,
    pub response_time_ms: u128,
}

/// Title for a conversation whose first user message is `content`.
pub fn derive_title(content: &str) -> String {
    content.chars().take(TITLE_MAX_CHARS).collect()
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}
