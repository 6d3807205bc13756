use crate::config::Config;
use log::{error, info};
use spectre_lb::Node;

pub const VALID_LOG_LEVELS: &[&str] = &[
    "whisper", "haunt", "spooky", "scream", "poltergeist", "silence",
    "trace", "debug", "info", "warn", "error", "off",
];

pub const VALID_CLOSE_MODES: &[&str] = &["half", "full"];

pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

pub fn validate(config: &Config) -> bool {
    info!("Starting configuration validation...");

    // --- Validate Log level ---
    if !VALID_LOG_LEVELS.iter().any(|lvl| lvl.eq_ignore_ascii_case(&config.log.level)) {
        error!("Invalid log level: {}", config.log.level);
        return false;
    }

    // --- Validate listen address ---
    if config.listen.address.is_empty() {
        error!("Listen address is empty");
        return false;
    }

    // --- Validate listen port ---
    if config.listen.port == 0 || config.listen.port > 65535 {
        error!(
            "Invalid listen port: {} (must be between 1 and 65535)",
            config.listen.port
        );
        return false;
    }

    // --- Validate backends ---
    if config.backends.is_empty() {
        error!("No backends configured");
        return false;
    }

    for backend in &config.backends {
        if let Err(reason) = backend.parse::<Node>() {
            error!("Invalid backend address: {}", reason);
            return false;
        }
    }

    // --- Validate relay settings ---
    if config.relay.buffer_size == 0 || config.relay.buffer_size > MAX_BUFFER_SIZE {
        error!(
            "Invalid relay buffer size: {} (must be between 1 and {})",
            config.relay.buffer_size, MAX_BUFFER_SIZE
        );
        return false;
    }

    if !VALID_CLOSE_MODES
        .iter()
        .any(|mode| mode.eq_ignore_ascii_case(&config.relay.close_mode))
    {
        error!("Invalid close mode: {}", config.relay.close_mode);
        return false;
    }

    if config.relay.connect_timeout_ms == 0 {
        error!("Backend connect timeout is invalid (0)");
        return false;
    }

    if config.relay.drain_timeout_ms == Some(0) {
        error!("Drain timeout is invalid (0), omit it to wait indefinitely");
        return false;
    }

    info!("Configuration validation passed successfully");

    true
}
