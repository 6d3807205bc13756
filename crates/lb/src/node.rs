use std::{fmt, str::FromStr};

/// A backend the balancer can route to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    host: String,
    port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Node {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{value}'"))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated IPv6 host in '{value}'"))?,
            None if host.contains(':') => {
                return Err(format!("IPv6 host must be bracketed in '{value}'"));
            }
            None => host,
        };

        if host.is_empty() {
            return Err(format!("missing host in '{value}'"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{value}'"))?;
        if port == 0 {
            return Err(format!("port 0 is not routable in '{value}'"));
        }

        Ok(Self::new(host, port))
    }
}
