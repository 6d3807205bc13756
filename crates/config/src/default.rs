use crate::config::{Listen, Log, Relay};

// default values
pub fn get_default_version() -> u32 {
    1
}

pub fn get_default_port() -> u32 {
    9889
}

pub fn get_default_address() -> String {
    String::from("0.0.0.0")
}

pub fn get_default_backends() -> Vec<String> {
    vec![
        String::from("localhost:8090"),
        String::from("localhost:8091"),
    ]
}

pub fn get_default_buffer_size() -> usize {
    4096
}

pub fn get_default_close_mode() -> String {
    String::from("half")
}

pub fn get_default_connect_timeout_ms() -> u64 {
    2000
}

pub fn get_default_log_level() -> String {
    String::from("info")
}

pub fn get_default_listen() -> Listen {
    Listen {
        address: get_default_address(),
        port: get_default_port(),
    }
}

pub fn get_default_relay() -> Relay {
    Relay {
        buffer_size: get_default_buffer_size(),
        close_mode: get_default_close_mode(),
        connect_timeout_ms: get_default_connect_timeout_ms(),
        drain_timeout_ms: None,
    }
}

pub fn get_default_log() -> Log {
    Log {
        level: get_default_log_level(),
        file: None,
    }
}
