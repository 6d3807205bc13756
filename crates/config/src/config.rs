use serde::{Deserialize, Serialize};

use crate::default::{
    get_default_address, get_default_backends, get_default_buffer_size,
    get_default_close_mode, get_default_connect_timeout_ms, get_default_listen,
    get_default_log, get_default_log_level, get_default_port, get_default_relay,
    get_default_version,
};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "get_default_version")]
    pub version: u32,

    #[serde(default = "get_default_listen")]
    pub listen: Listen,

    // "host:port", rotated in the order given
    #[serde(default = "get_default_backends")]
    pub backends: Vec<String>,

    #[serde(default = "get_default_relay")]
    pub relay: Relay,

    #[serde(default = "get_default_log")]
    pub log: Log,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Listen {
    #[serde(default = "get_default_address")]
    pub address: String, // "0.0.0.0"

    #[serde(default = "get_default_port")]
    pub port: u32, // 9889
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Relay {
    #[serde(default = "get_default_buffer_size")]
    pub buffer_size: usize, // bytes per read

    #[serde(default = "get_default_close_mode")]
    pub close_mode: String, // half | full

    #[serde(default = "get_default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // absent = wait for every session on shutdown
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Log {
    // whisper -> trace
    // haunt -> debug
    // spooky -> info
    // scream -> warn
    // poltergeist -> error
    // silence -> off
    #[serde(default = "get_default_log_level")]
    pub level: String,

    // stderr when unset
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: get_default_version(),
            listen: get_default_listen(),
            backends: get_default_backends(),
            relay: get_default_relay(),
            log: get_default_log(),
        }
    }
}

impl Default for Listen {
    fn default() -> Self {
        get_default_listen()
    }
}

impl Default for Relay {
    fn default() -> Self {
        get_default_relay()
    }
}

impl Default for Log {
    fn default() -> Self {
        get_default_log()
    }
}

impl Listen {
    pub fn socket_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}
