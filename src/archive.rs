// src/archive.rs
//
// Import/export of the whole conversation mapping as one JSON document.

use crate::constants::APP_NAME;
use crate::errors::{ChatError, ChatResult};
use crate::models::ConversationMap;
use crate::store::ConversationStore;
use chrono::Local;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// `lmchat-chats-YYYY-MM-DD.json` for today's local date.
pub fn archive_file_name() -> String {
    format!("{}-chats-{}.json", APP_NAME, Local::now().format("%Y-%m-%d"))
}

pub fn export_archive(conversations: &ConversationMap) -> ChatResult<String> {
    Ok(serde_json::to_string_pretty(conversations)?)
}

/// Writes every conversation in `store` to a dated archive inside `dir`.
pub fn export_to_dir(store: &ConversationStore, dir: &Path) -> ChatResult<PathBuf> {
    let path = dir.join(archive_file_name());
    fs::write(&path, export_archive(store.conversations())?)?;
    info!("Exported {} conversation(s) to {}", store.len(), path.display());
    Ok(path)
}

/// Parses an archive. Anything that is not a conversation mapping is a
/// format error.
pub fn parse_archive(contents: &str) -> ChatResult<ConversationMap> {
    serde_json::from_str(contents).map_err(|e| ChatError::archive_error(e.to_string()))
}

/// Reads and merges an archive file. The store is untouched unless the whole
/// file parses.
pub fn import_file(store: &mut ConversationStore, path: &Path) -> ChatResult<usize> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ChatError::archive_error(format!("Failed to read file: {}", e)))?;
    let imported = parse_archive(&contents)?;
    Ok(store.merge(imported))
}
