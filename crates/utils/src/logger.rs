use std::{
    fs::{OpenOptions, create_dir_all},
    path::Path,
};

use env_logger::{Builder, Target};
use log::LevelFilter;

pub fn parse_level(log_level: &str) -> Option<LevelFilter> {
    let level = match log_level.to_lowercase().as_str() {
        "whisper" => LevelFilter::Trace,
        "haunt" => LevelFilter::Debug,
        "spooky" => LevelFilter::Info,
        "scream" => LevelFilter::Warn,
        "poltergeist" => LevelFilter::Error,
        "silence" => LevelFilter::Off,

        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,

        _ => return None,
    };
    Some(level)
}

pub fn init_logger(log_level: &str, log_file: Option<&str>) -> Result<(), String> {
    let level = parse_level(log_level).unwrap_or_else(|| {
        eprintln!(
            "Invalid log level '{}', defaulting to 'spooky' (info)",
            log_level
        );
        LevelFilter::Info
    });

    let mut builder = Builder::new();
    builder.filter_level(level).format_timestamp_secs();

    // else → default (stderr)
    if let Some(log_file) = log_file {
        let file = open_log_file(log_file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|err| format!("Failed to install logger: {}", err))
}

fn open_log_file(log_file: &str) -> Result<std::fs::File, String> {
    if let Some(parent) = Path::new(log_file).parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent).map_err(|err| {
                format!("Failed to create log directory '{}': {}", parent.display(), err)
            })?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|err| format!("Failed to open log file '{}': {}", log_file, err))
}
