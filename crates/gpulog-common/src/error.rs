use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Expected, per-unit failures of a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{node} card{card_id} {chart}: fetch failed: {cause}")]
    FetchFailed {
        node: String,
        card_id: u32,
        chart: String,
        cause: String,
    },

    #[error("attribution fetch failed: {cause}")]
    AttributionFailed { cause: String },

    #[error("malformed attribution response: {0}")]
    MalformedResponse(String),

    #[error("unknown card id {0}")]
    UnknownCardId(u32),

    #[error("unknown logical index {0}")]
    UnknownIndex(u32),

    #[error("{node}: failed to write {}: {source}", .path.display())]
    WriteFailed {
        node: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The unit of work a [`CollectError`] applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Gpu {
        node: String,
        logical_index: Option<u32>,
        card_id: u32,
    },
    Node(String),
    Attribution,
}

impl Unit {
    pub fn node(&self) -> Option<&str> {
        match self {
            Unit::Gpu { node, .. } | Unit::Node(node) => Some(node),
            Unit::Attribution => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Gpu { node, logical_index: Some(i), card_id } => {
                write!(f, "{node}:GPU[{i}] (card {card_id})")
            }
            Unit::Gpu { node, logical_index: None, card_id } => write!(f, "{node}:card {card_id}"),
            Unit::Node(node) => write!(f, "{node}"),
            Unit::Attribution => write!(f, "attribution"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{unit}: {error}")]
pub struct UnitError {
    pub unit: Unit,
    #[source]
    pub error: CollectError,
}

impl UnitError {
    pub fn new(unit: Unit, error: CollectError) -> Self {
        Self { unit, error }
    }

    pub fn is_attribution(&self) -> bool {
        matches!(self.unit, Unit::Attribution)
    }
}
