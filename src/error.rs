//! Error taxonomy for the detector core.
//!
//! The variants here are *fatal* internal-consistency errors: a malformed
//! record store or a rule-engine bug. The analysis cannot soundly continue
//! once one of these is raised, so they propagate straight to the driver
//! and a nonzero exit. Tolerated trace anomalies (truncated traces, a
//! thread appearing mid-stream) never construct a `DetectorError`; the
//! parser logs a warning and synthesizes a starting state instead.

use thiserror::Error;

/// Fatal analysis errors.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    /// An op id outside 1..=op_count reached the graph.
    #[error("invalid op id {0}")]
    InvalidOp(usize),

    /// A node id outside the allocated node range reached the graph.
    #[error("invalid node id {0}")]
    InvalidNode(usize),

    /// Adding this edge would create a cycle: the reverse edge already
    /// exists. The happens-before relation must be a strict partial
    /// order, so this is a rule-engine bug, never a tolerated race.
    #[error("happens-before cycle: edge {dst} -> {src} exists, refusing {src} -> {dst}")]
    CycleDetected { src: usize, dst: usize },

    /// Source and destination ops compress into the same graph node.
    #[error("self-loop edge on node {0}")]
    SelfLoop(usize),

    /// A map entry the rules rely on is absent (e.g. an enq with no
    /// recorded target task).
    #[error("missing {kind} record for {key}")]
    MissingRecord { kind: &'static str, key: String },

    /// The trace produced more graph nodes than the configured ceiling.
    #[error("giving up: trace produced {nodes} nodes, limit is {limit}")]
    NodeLimitExceeded { nodes: usize, limit: usize },

    /// The trace is structurally unusable (e.g. empty after filtering).
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
}

pub type Result<T> = std::result::Result<T, DetectorError>;
