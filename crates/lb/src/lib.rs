use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use log::debug;

mod node;

pub use node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LbError {
    EmptyBackendSet,
    InvalidNode { address: String, reason: String },
}

impl fmt::Display for LbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LbError::EmptyBackendSet => write!(f, "no backends configured"),
            LbError::InvalidNode { address, reason } => {
                write!(f, "invalid backend '{address}': {reason}")
            }
        }
    }
}

impl std::error::Error for LbError {}

/// Round-robin cursor over a list of `len` entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Returns the index to hand out and moves the cursor past it.
    pub fn advance(&mut self, len: usize) -> usize {
        debug_assert!(len > 0);
        let idx = self.next % len;
        self.next = (idx + 1) % len;
        idx
    }
}

/// The configured backends and the rotation over them.
pub struct BackendSet {
    nodes: Vec<Node>,
    cursor: Mutex<RoundRobin>,
}

impl BackendSet {
    pub fn new(nodes: Vec<Node>) -> Result<Self, LbError> {
        if nodes.is_empty() {
            return Err(LbError::EmptyBackendSet);
        }

        Ok(Self {
            nodes,
            cursor: Mutex::new(RoundRobin::new()),
        })
    }

    pub fn from_config<S: AsRef<str>>(addresses: &[S]) -> Result<Self, LbError> {
        let nodes = addresses
            .iter()
            .map(|address| {
                let address = address.as_ref();
                address.parse::<Node>().map_err(|reason| LbError::InvalidNode {
                    address: address.to_string(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(nodes)
    }

    pub fn next(&self) -> Node {
        let idx = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(self.nodes.len());

        let node = self.nodes[idx].clone();
        debug!("Round-robin picked backend #{} ({})", idx, node);
        node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}
