// src/store.rs

use crate::constants::DEFAULT_TEMPERATURE;
use crate::errors::{ChatError, ChatResult};
use crate::models::{ChatConfig, Conversation, ConversationMap, Message};
use crate::storage::Storage;
use log::{debug, error, info, warn};

/// In-memory conversations plus the current-selection pointer, backed by a
/// `Storage`.
///
/// Loads degrade to empty/default values and saves log failures instead of
/// raising: the in-memory state always stays authoritative.
pub struct ConversationStore {
    conversations: ConversationMap,
    current_id: Option<String>,
    config: ChatConfig,
    storage: Box<dyn Storage>,
}

impl ConversationStore {
    /// Loads persisted state and makes sure a current conversation exists.
    ///
    /// The stored current id wins when it still exists, then the first
    /// conversation; with no history a fresh conversation is created.
    pub fn bootstrap(storage: Box<dyn Storage>) -> Self {
        let conversations = storage.load_conversations().unwrap_or_else(|e| {
            error!("Failed to load conversations: {}", e);
            None
        });
        let config = storage.load_config().unwrap_or_else(|e| {
            error!("Failed to load chat config: {}", e);
            None
        });
        let stored_current = storage.load_current_id().unwrap_or_else(|e| {
            error!("Failed to load current conversation id: {}", e);
            None
        });

        let mut config = config.unwrap_or_default();
        if !ChatConfig::temperature_in_range(config.temperature) {
            warn!(
                "Stored temperature {} is out of range; using {}",
                config.temperature, DEFAULT_TEMPERATURE
            );
            config.temperature = DEFAULT_TEMPERATURE;
        }

        let mut store = Self {
            conversations: conversations.unwrap_or_default(),
            current_id: None,
            config,
            storage,
        };

        match stored_current.filter(|id| store.conversations.contains_key(id)) {
            Some(id) => store.current_id = Some(id),
            None => match store.conversations.keys().next().cloned() {
                Some(first) => store.select_unchecked(first),
                None => {
                    store.create_conversation();
                }
            },
        }

        info!(
            "Loaded {} conversation(s), current: {:?}",
            store.conversations.len(),
            store.current_id
        );
        store
    }

    pub fn conversations(&self) -> &ConversationMap {
        &self.conversations
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current_id
            .as_ref()
            .and_then(|id| self.conversations.get(id))
    }

    /// Conversations, most recently updated first.
    pub fn list(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.values().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    /// Creates an empty conversation, selects it and persists both.
    pub fn create_conversation(&mut self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        self.conversations.insert(id.clone(), conversation);
        self.checkpoint();
        self.select_unchecked(id.clone());
        debug!("Created conversation {}", id);
        id
    }

    pub fn select(&mut self, id: &str) -> ChatResult<()> {
        if !self.conversations.contains_key(id) {
            return Err(ChatError::ConversationNotFound { id: id.to_string() });
        }
        self.select_unchecked(id.to_string());
        Ok(())
    }

    fn select_unchecked(&mut self, id: String) {
        if let Err(e) = self.storage.save_current_id(&id) {
            error!("Failed to save current conversation id: {}", e);
        }
        self.current_id = Some(id);
    }

    /// Empties the current conversation's transcript.
    pub fn clear_current(&mut self) -> ChatResult<()> {
        let id = self.current_id.clone().ok_or(ChatError::NoActiveConversation)?;
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::ConversationNotFound { id })?;
        conversation.clear();
        self.checkpoint();
        Ok(())
    }

    /// Deletes a conversation. If it was current, the first remaining one is
    /// selected, or a new one is created when none remain.
    pub fn delete(&mut self, id: &str) -> ChatResult<()> {
        if self.conversations.remove(id).is_none() {
            return Err(ChatError::ConversationNotFound { id: id.to_string() });
        }
        self.checkpoint();
        info!("Deleted conversation {}", id);

        if self.current_id.as_deref() == Some(id) {
            self.current_id = None;
            match self.conversations.keys().next().cloned() {
                Some(next) => self.select_unchecked(next),
                None => {
                    self.create_conversation();
                }
            }
        }
        Ok(())
    }

    pub fn delete_current(&mut self) -> ChatResult<()> {
        let id = self.current_id.clone().ok_or(ChatError::NoActiveConversation)?;
        self.delete(&id)
    }

    /// Appends a message and returns its index, or `None` if the
    /// conversation is gone.
    pub fn append_message(&mut self, conversation_id: &str, message: Message) -> Option<usize> {
        self.conversations
            .get_mut(conversation_id)
            .map(|conversation| conversation.append(message))
    }

    /// Writes the streaming reply into its slot. `false` when the target has
    /// vanished.
    pub fn write_reply(&mut self, conversation_id: &str, index: usize, reply: &Message) -> bool {
        self.conversations
            .get_mut(conversation_id)
            .map(|conversation| conversation.write_reply(index, reply))
            .unwrap_or(false)
    }

    /// Persists every conversation. Failures are logged; returns whether the
    /// write succeeded.
    pub fn checkpoint(&mut self) -> bool {
        match self.storage.save_conversations(&self.conversations) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save conversations: {}", e);
                false
            }
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Replaces the chat settings and persists them.
    pub fn update_config(&mut self, config: ChatConfig) -> ChatResult<()> {
        if !ChatConfig::temperature_in_range(config.temperature) {
            return Err(ChatError::config_error(format!(
                "Temperature must be between 0.0 and 1.5 (got {})",
                config.temperature
            )));
        }
        if let Err(e) = self.storage.save_config(&config) {
            error!("Failed to save chat config: {}", e);
        }
        self.config = config;
        Ok(())
    }

    /// Merges imported conversations (imported ids win), persists, and
    /// selects the first imported one. Returns how many were merged.
    pub fn merge(&mut self, imported: ConversationMap) -> usize {
        let count = imported.len();
        let first = imported.keys().next().cloned();
        if count == 0 {
            warn!("Archive contained no conversations");
            return 0;
        }

        self.conversations.extend(imported);
        self.checkpoint();
        if let Some(first) = first {
            self.select_unchecked(first);
        }
        info!("Imported {} conversation(s)", count);
        count
    }
}
