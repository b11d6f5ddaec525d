//! Runtime configuration for the detector.
//!
//! The original tool selected rules and heuristics with compile-time
//! switches; here every switch is an explicit field so behavior is
//! selectable per run and testable in isolation.

/// Default ceiling on compressed graph nodes before the run gives up.
pub const DEFAULT_NODE_LIMIT: usize = 15_000;

/// Node count at or below which the graph also keeps a dense boolean
/// matrix for O(1) edge-existence queries. Above it, only the adjacency
/// lists are used (the matrix is O(nodes²) bits and does not scale).
pub const DEFAULT_DENSE_MATRIX_LIMIT: usize = 4_096;

/// Per-run detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Also run the data-race sweep. The trace may omit read/write
    /// instrumentation, in which case this finds nothing.
    pub data_races: bool,

    /// Apply the false-positive suppression heuristic to unordered
    /// use/free pairs (same task, atomic, free in the same thread).
    /// Suppressions are counted, never hidden.
    pub suppress_false_positives: bool,

    /// Report only the first finding per free op (UAF) or per alloc op
    /// (race) instead of every conflicting pair.
    pub first_per_object: bool,

    /// Ceiling on compressed graph nodes; exceeding it is fatal unless
    /// `run_over_node_limit` is set.
    pub node_limit: usize,

    /// Keep going past `node_limit` (memory permitting).
    pub run_over_node_limit: bool,

    /// See [`DEFAULT_DENSE_MATRIX_LIMIT`].
    pub dense_matrix_limit: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            data_races: false,
            suppress_false_positives: true,
            first_per_object: false,
            node_limit: DEFAULT_NODE_LIMIT,
            run_over_node_limit: false,
            dense_matrix_limit: DEFAULT_DENSE_MATRIX_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_switches() {
        let cfg = DetectorConfig::default();
        assert!(!cfg.data_races);
        assert!(cfg.suppress_false_positives);
        assert!(!cfg.first_per_object);
        assert_eq!(cfg.node_limit, 15_000);
    }
}
