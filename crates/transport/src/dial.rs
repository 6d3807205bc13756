use std::{fmt, io, time::Duration};

use log::{debug, warn};
use spectre_lb::Node;
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum DialError {
    Connect { node: Node, source: io::Error },
    Timeout { node: Node, after: Duration },
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Connect { node, source } => {
                write!(f, "failed to connect to backend {node}: {source}")
            }
            DialError::Timeout { node, after } => {
                write!(f, "connect to backend {node} timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DialError::Connect { source, .. } => Some(source),
            DialError::Timeout { .. } => None,
        }
    }
}

/// Opens a TCP connection to `node`, giving up after `connect_timeout`.
pub async fn dial(node: &Node, connect_timeout: Duration) -> Result<TcpStream, DialError> {
    debug!("Connecting to backend {}", node);

    let connect = TcpStream::connect((node.host(), node.port()));
    let stream = match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(DialError::Connect {
                node: node.clone(),
                source,
            });
        }
        Err(_) => {
            return Err(DialError::Timeout {
                node: node.clone(),
                after: connect_timeout,
            });
        }
    };

    // latency over batching for relayed chunks
    if let Err(err) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY towards {}: {}", node, err);
    }

    Ok(stream)
}
