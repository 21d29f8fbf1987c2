// src/storage.rs

use crate::constants::{CHATS_KEY, CONFIG_KEY, CURRENT_CHAT_KEY};
use crate::errors::{ChatError, ChatResult};
use crate::models::{ChatConfig, ConversationMap};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Raw persistence operations. `Ok(None)` means nothing has been stored yet.
///
/// Callers decide how to degrade; see `ConversationStore`.
pub trait Storage: Send {
    fn load_conversations(&self) -> ChatResult<Option<ConversationMap>>;
    fn save_conversations(&self, conversations: &ConversationMap) -> ChatResult<()>;
    fn load_current_id(&self) -> ChatResult<Option<String>>;
    fn save_current_id(&self, id: &str) -> ChatResult<()>;
    fn load_config(&self) -> ChatResult<Option<ChatConfig>>;
    fn save_config(&self, config: &ChatConfig) -> ChatResult<()>;
}

impl<T: Storage + Sync + ?Sized> Storage for Arc<T> {
    fn load_conversations(&self) -> ChatResult<Option<ConversationMap>> {
        (**self).load_conversations()
    }

    fn save_conversations(&self, conversations: &ConversationMap) -> ChatResult<()> {
        (**self).save_conversations(conversations)
    }

    fn load_current_id(&self) -> ChatResult<Option<String>> {
        (**self).load_current_id()
    }

    fn save_current_id(&self, id: &str) -> ChatResult<()> {
        (**self).save_current_id(id)
    }

    fn load_config(&self) -> ChatResult<Option<ChatConfig>> {
        (**self).load_config()
    }

    fn save_config(&self, config: &ChatConfig) -> ChatResult<()> {
        (**self).save_config(config)
    }
}

/// One file per key inside a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn read(&self, key: &str) -> ChatResult<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChatError::storage_error(format!("Failed to read {}: {}", key, e))),
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> ChatResult<Option<T>> {
        match self.read(key)? {
            Some(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| ChatError::storage_error(format!("Failed to parse {}: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Writes through a temp file in the same directory so a crash never
    /// leaves a half-written key behind.
    fn write(&self, key: &str, contents: &[u8]) -> ChatResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ChatError::storage_error(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let mut file = NamedTempFile::new_in(&self.dir)
            .map_err(|e| ChatError::storage_error(format!("Failed to write {}: {}", key, e)))?;
        file.write_all(contents)
            .map_err(|e| ChatError::storage_error(format!("Failed to write {}: {}", key, e)))?;
        file.persist(self.path(key))
            .map_err(|e| ChatError::storage_error(format!("Failed to write {}: {}", key, e.error)))?;
        Ok(())
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> ChatResult<()> {
        let serialized = serde_json::to_vec(value)?;
        self.write(key, &serialized)
    }
}

impl Storage for JsonFileStorage {
    fn load_conversations(&self) -> ChatResult<Option<ConversationMap>> {
        self.read_json(CHATS_KEY)
    }

    fn save_conversations(&self, conversations: &ConversationMap) -> ChatResult<()> {
        self.write_json(CHATS_KEY, conversations)
    }

    fn load_current_id(&self) -> ChatResult<Option<String>> {
        Ok(self
            .read(CURRENT_CHAT_KEY)?
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    fn save_current_id(&self, id: &str) -> ChatResult<()> {
        self.write(CURRENT_CHAT_KEY, id.as_bytes())
    }

    fn load_config(&self) -> ChatResult<Option<ChatConfig>> {
        self.read_json(CONFIG_KEY)
    }

    fn save_config(&self, config: &ChatConfig) -> ChatResult<()> {
        self.write_json(CONFIG_KEY, config)
    }
}

/// Keeps serialized values in memory; handy for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<&'static str, String>>,
    conversation_saves: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &'static str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn put(&self, key: &'static str, value: String) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }

    pub fn contains(&self, key: &'static str) -> bool {
        self.get(key).is_some()
    }

    /// How many conversation checkpoints have been written.
    pub fn conversation_saves(&self) -> usize {
        self.conversation_saves.load(Ordering::SeqCst)
    }
}

impl Storage for MemoryStorage {
    fn load_conversations(&self) -> ChatResult<Option<ConversationMap>> {
        self.get(CHATS_KEY)
            .map(|raw| serde_json::from_str(&raw).map_err(ChatError::from))
            .transpose()
    }

    fn save_conversations(&self, conversations: &ConversationMap) -> ChatResult<()> {
        self.put(CHATS_KEY, serde_json::to_string(conversations)?);
        self.conversation_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_current_id(&self) -> ChatResult<Option<String>> {
        Ok(self.get(CURRENT_CHAT_KEY))
    }

    fn save_current_id(&self, id: &str) -> ChatResult<()> {
        self.put(CURRENT_CHAT_KEY, id.to_string());
        Ok(())
    }

    fn load_config(&self) -> ChatResult<Option<ChatConfig>> {
        self.get(CONFIG_KEY)
            .map(|raw| serde_json::from_str(&raw).map_err(ChatError::from))
            .transpose()
    }

    fn save_config(&self, config: &ChatConfig) -> ChatResult<()> {
        self.put(CONFIG_KEY, serde_json::to_string(config)?);
        Ok(())
    }
}
