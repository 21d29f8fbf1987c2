// Endpoint defaults (LM Studio style local server)
pub const DEFAULT_API_HOST: &str = "localhost";
pub const DEFAULT_API_PORT: u16 = 1238;
pub const DEFAULT_API_TOKEN: &str = "lm-studio";

// Chat defaults
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 1.5;

// Conversation titles
pub const NEW_CHAT_TITLE: &str = "New Chat";
pub const TITLE_MAX_CHARS: usize = 50;

// Streaming checkpoints
pub const DEFAULT_CHECKPOINT_EVERY_FRAGMENTS: usize = 16;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 750;

// Storage keys
pub const CHATS_KEY: &str = "chats-v2.json";
pub const CONFIG_KEY: &str = "config-v2.json";
pub const CURRENT_CHAT_KEY: &str = "current-chat-v2";

pub const APP_NAME: &str = "lmchat";
pub const LOG_FILE_BASENAME: &str = "lmchat";
