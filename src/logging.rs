// src/logging.rs

use crate::constants::LOG_FILE_BASENAME;
use crate::errors::{ChatError, ChatResult};
use crate::models::ApiCallLog;
use flexi_logger::{FileSpec, Logger, LoggerHandle, WriteMode};
use log::info;
use std::path::Path;

/// Target used for the per-request API call records.
pub const API_LOG_TARGET: &str = "api";

/// Starts file logging under `log_dir`; the terminal belongs to the chat.
///
/// Keep the returned handle alive for the lifetime of the program.
pub fn init_logging(level: &str, log_dir: &Path) -> ChatResult<LoggerHandle> {
    Logger::try_with_env_or_str(level)
        .map_err(|e| ChatError::config_error(format!("Invalid log level '{}': {}", level, e)))?
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename(LOG_FILE_BASENAME)
                .suppress_timestamp(),
        )
        .append()
        .write_mode(WriteMode::BufferAndFlush)
        .format(flexi_logger::detailed_format)
        .start()
        .map_err(|e| ChatError::config_error(format!("Failed to start logger: {}", e)))
}

/// Logs an API call on the `api` target.
pub fn log_api_call(log: &ApiCallLog) {
    info!(
        target: API_LOG_TARGET,
        "[{}] {} - {} - Status: {} - Time: {}ms",
        log.timestamp.to_rfc3339(),
        log.endpoint,
        log.request_summary,
        log.response_status,
        log.response_time_ms
    );
}
