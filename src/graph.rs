//! The happens-before graph: a node-compressed directed graph over trace
//! operations.
//!
//! Consecutive memory operations (alloc/free/read/write) of one block are
//! folded into a single graph node; every synchronization-relevant op keeps
//! its own node, so the vertex count is proportional to the "interesting"
//! ops rather than the raw trace length. Nodes never span blocks.
//!
//! Edges are stored as a per-node adjacency list sorted by destination,
//! which allows equal-range scans over all parallel edges into one
//! destination node (the transitive rule prunes those down to a canonical
//! earliest-op edge). For small traces a dense boolean matrix mirrors the
//! lists for O(1) existence queries; above
//! [`dense_matrix_limit`](crate::config::DetectorConfig::dense_matrix_limit)
//! only the lists are used.
//!
//! The edge relation on nodes must remain acyclic at all times: the
//! happens-before relation is a strict partial order, and any rule that
//! would close a cycle is a fatal internal-consistency error, never a
//! tolerated race.
//!
//! `HbGraph` is not thread-safe; one instance per trace run.

use tracing::{debug, trace};

use crate::config::DetectorConfig;
use crate::error::{DetectorError, Result};
use crate::trace::{BlockId, OpId, TraceStore};

/// 0-based graph node id.
pub type NodeId = usize;

/// Whether an edge was derived from single-thread reasoning. Same-thread
/// edges compose transitively without restriction; cross-thread edges are
/// the weaker class the transitive rule treats conservatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    SameThread,
    CrossThread,
}

impl EdgeKind {
    /// Kind of a direct edge between two ops, from their threads.
    pub fn between(store: &TraceStore, a: OpId, b: OpId) -> EdgeKind {
        if store.op(a).thread == store.op(b).thread {
            EdgeKind::SameThread
        } else {
            EdgeKind::CrossThread
        }
    }
}

/// Result of an edge insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAdd {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy)]
struct OpEdge {
    dst_node: NodeId,
    dst_op: OpId,
    kind: EdgeKind,
}

/// Dense bit matrix over node pairs, kept only for small traces.
#[derive(Debug)]
struct BitMatrix {
    words: Vec<u64>,
    n: usize,
}

impl BitMatrix {
    fn new(n: usize) -> Self {
        Self { words: vec![0; (n * n + 63) / 64], n }
    }

    fn get(&self, i: usize, j: usize) -> bool {
        let bit = i * self.n + j;
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, i: usize, j: usize, value: bool) {
        let bit = i * self.n + j;
        if value {
            self.words[bit / 64] |= 1 << (bit % 64);
        } else {
            self.words[bit / 64] &= !(1 << (bit % 64));
        }
    }
}

/// The happens-before graph over one trace.
#[derive(Debug)]
pub struct HbGraph {
    /// Graph node of each op; indexed by op id (slot 0 unused).
    node_of_op: Vec<NodeId>,
    /// Ops owned by each node, in block order.
    ops_in_node: Vec<Vec<OpId>>,
    block_of_node: Vec<BlockId>,
    /// Outgoing edges per node, sorted by (dst_node, dst_op).
    adj: Vec<Vec<OpEdge>>,
    /// Block-level successors; indexed by block id (slot 0 unused).
    block_adj: Vec<Vec<BlockId>>,
    matrix: Option<BitMatrix>,
    op_edge_count: usize,
    block_edge_count: usize,
}

impl HbGraph {
    /// Build the graph skeleton for a parsed trace: assign every op to a
    /// compressed node and size the adjacency structures. No edges yet.
    pub fn build(store: &TraceStore, config: &DetectorConfig) -> Result<Self> {
        let mut node_of_op = vec![0usize; store.op_count() + 1];
        let mut ops_in_node: Vec<Vec<OpId>> = Vec::new();
        let mut block_of_node: Vec<BlockId> = Vec::new();

        for block in store.blocks() {
            let mut open_run: Option<NodeId> = None;
            let mut cur = Some(block.first_op);
            while let Some(op_id) = cur {
                let op = store.op(op_id);
                if op.kind.is_memory() {
                    let node = match open_run {
                        Some(n) => n,
                        None => {
                            let n = ops_in_node.len();
                            ops_in_node.push(Vec::new());
                            block_of_node.push(block.id);
                            open_run = Some(n);
                            n
                        }
                    };
                    ops_in_node[node].push(op_id);
                    node_of_op[op_id] = node;
                } else {
                    let n = ops_in_node.len();
                    ops_in_node.push(vec![op_id]);
                    block_of_node.push(block.id);
                    node_of_op[op_id] = n;
                    open_run = None;
                }
                cur = op.next_in_block;
            }
        }

        let nodes = ops_in_node.len();
        if nodes > config.node_limit && !config.run_over_node_limit {
            return Err(DetectorError::NodeLimitExceeded {
                nodes,
                limit: config.node_limit,
            });
        }

        let matrix = if nodes <= config.dense_matrix_limit {
            Some(BitMatrix::new(nodes))
        } else {
            debug!(nodes, limit = config.dense_matrix_limit, "dense matrix disabled");
            None
        };

        Ok(Self {
            node_of_op,
            adj: vec![Vec::new(); nodes],
            block_adj: vec![Vec::new(); store.block_count() + 1],
            ops_in_node,
            block_of_node,
            matrix,
            op_edge_count: 0,
            block_edge_count: 0,
        })
    }

    /// Test-only constructor: `n` nodes, each its own op and block, node i
    /// owning op i+1 in block i+1. Used by property tests that exercise the
    /// edge operations without a parsed trace.
    pub fn with_discrete_nodes(n: usize, dense_matrix_limit: usize) -> Self {
        Self {
            node_of_op: (0..=n).map(|i| i.saturating_sub(1)).collect(),
            ops_in_node: (1..=n).map(|op| vec![op]).collect(),
            block_of_node: (1..=n).collect(),
            adj: vec![Vec::new(); n],
            block_adj: vec![Vec::new(); n + 1],
            matrix: if n <= dense_matrix_limit {
                Some(BitMatrix::new(n))
            } else {
                None
            },
            op_edge_count: 0,
            block_edge_count: 0,
        }
    }

    pub fn node_count(&self) -> usize {
        self.ops_in_node.len()
    }

    pub fn op_edge_count(&self) -> usize {
        self.op_edge_count
    }

    pub fn block_edge_count(&self) -> usize {
        self.block_edge_count
    }

    /// Graph node an op was compressed into.
    pub fn node_of(&self, op: OpId) -> Result<NodeId> {
        self.node_of_op
            .get(op)
            .copied()
            .filter(|_| op >= 1)
            .ok_or(DetectorError::InvalidOp(op))
    }

    /// Ops owned by a node, in block order.
    pub fn ops_in_node(&self, node: NodeId) -> Result<&[OpId]> {
        self.ops_in_node
            .get(node)
            .map(Vec::as_slice)
            .ok_or(DetectorError::InvalidNode(node))
    }

    fn node_edge_exists(&self, src: NodeId, dst: NodeId) -> bool {
        if let Some(m) = &self.matrix {
            return m.get(src, dst);
        }
        let list = &self.adj[src];
        let i = list.partition_point(|e| e.dst_node < dst);
        i < list.len() && list[i].dst_node == dst
    }

    /// Does a direct happens-before edge exist from `src`'s node to
    /// `dst`'s node?
    pub fn op_edge_exists(&self, src: OpId, dst: OpId) -> Result<bool> {
        let ns = self.node_of(src)?;
        let nd = self.node_of(dst)?;
        if ns == nd {
            return Ok(false);
        }
        Ok(self.node_edge_exists(ns, nd))
    }

    /// Insert a happens-before edge from `src` to `dst`.
    ///
    /// Fails if the ops compress into the same node (self-loop) or if the
    /// reverse edge exists (cycle): both violate the partial-order
    /// invariant and abort the analysis.
    pub fn add_op_edge(&mut self, src: OpId, dst: OpId, kind: EdgeKind) -> Result<EdgeAdd> {
        let ns = self.node_of(src)?;
        let nd = self.node_of(dst)?;
        if ns == nd {
            return Err(DetectorError::SelfLoop(ns));
        }
        if self.node_edge_exists(nd, ns) {
            return Err(DetectorError::CycleDetected { src, dst });
        }
        if self.node_edge_exists(ns, nd) {
            return Ok(EdgeAdd::AlreadyPresent);
        }

        let edge = OpEdge { dst_node: nd, dst_op: dst, kind };
        let pos = self.adj[ns]
            .partition_point(|e| (e.dst_node, e.dst_op) < (nd, dst));
        self.adj[ns].insert(pos, edge);
        if let Some(m) = &mut self.matrix {
            m.set(ns, nd, true);
        }
        self.op_edge_count += 1;

        let bs = self.block_of_node[ns];
        let bd = self.block_of_node[nd];
        if bs != bd && !self.block_adj[bs].contains(&bd) {
            let pos = self.block_adj[bs].partition_point(|&b| b < bd);
            self.block_adj[bs].insert(pos, bd);
            self.block_edge_count += 1;
        }
        trace!(src, dst, ?kind, "op edge added");
        Ok(EdgeAdd::Added)
    }

    /// Remove one specific edge entry. Used only by the transitive rule to
    /// collapse parallel edges into a single canonical earliest-op edge;
    /// block-level adjacency is intentionally left untouched because the
    /// canonical edge is re-added immediately.
    pub(crate) fn remove_op_edge(&mut self, src: OpId, dst: OpId) -> Result<()> {
        let ns = self.node_of(src)?;
        let nd = self.node_of(dst)?;
        let before = self.adj[ns].len();
        self.adj[ns].retain(|e| !(e.dst_node == nd && e.dst_op == dst));
        let removed = before - self.adj[ns].len();
        self.op_edge_count -= removed;
        if removed > 0 && !self.adj[ns].iter().any(|e| e.dst_node == nd) {
            if let Some(m) = &mut self.matrix {
                m.set(ns, nd, false);
            }
        }
        Ok(())
    }

    /// Destination ops of all edges out of `src`'s node that land in
    /// `block`, ascending.
    pub(crate) fn edges_into_block(&self, src: OpId, block: BlockId) -> Result<Vec<OpId>> {
        let ns = self.node_of(src)?;
        Ok(self.adj[ns]
            .iter()
            .filter(|e| self.block_of_node[e.dst_node] == block)
            .map(|e| e.dst_op)
            .collect())
    }

    /// Blocks reachable by at least one direct edge out of `block`.
    pub fn block_successors(&self, block: BlockId) -> &[BlockId] {
        &self.block_adj[block]
    }

    /// Is `a` ordered strictly before `b` in the happens-before relation,
    /// as far as the materialized edges show?
    ///
    /// Within one block, ops are totally ordered by program order. Across
    /// blocks, the query scans for an edge from any op at-or-after `a` in
    /// `a`'s block to any op at-or-before `b` in `b`'s block; together with
    /// the transitive rule's block closure this resolves multi-hop chains.
    pub fn ordered_before(&self, store: &TraceStore, a: OpId, b: OpId) -> Result<bool> {
        if a == b {
            return Ok(false);
        }
        let op_a = store.try_op(a).ok_or(DetectorError::InvalidOp(a))?;
        let op_b = store.try_op(b).ok_or(DetectorError::InvalidOp(b))?;
        if op_a.block == op_b.block {
            // Op ids are assigned in trace order, so within a block the id
            // order is program order.
            return Ok(a < b);
        }
        let block_b = op_b.block;
        let mut cur = Some(a);
        let mut last_node = None;
        while let Some(x) = cur {
            let nx = self.node_of(x)?;
            if last_node != Some(nx) {
                last_node = Some(nx);
                for e in &self.adj[nx] {
                    if self.block_of_node[e.dst_node] == block_b && e.dst_op <= b {
                        return Ok(true);
                    }
                }
            }
            cur = store.op(x).next_in_block;
        }
        Ok(false)
    }

    /// Kind recorded on the direct node edge between two ops, if present.
    pub fn edge_kind(&self, src: OpId, dst: OpId) -> Result<Option<EdgeKind>> {
        let ns = self.node_of(src)?;
        let nd = self.node_of(dst)?;
        Ok(self.adj[ns]
            .iter()
            .find(|e| e.dst_node == nd)
            .map(|e| e.kind))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{OpPayload, TraceStore};

    fn small_store() -> TraceStore {
        let mut s = TraceStore::new();
        s.record_op(0, OpPayload::ThreadInit);
        s.record_op(0, OpPayload::Alloc { addr: 0x100, size: 8 });
        s.record_op(0, OpPayload::Write { addr: 0x100 });
        s.record_op(0, OpPayload::Free { addr: 0x100, size: 8 });
        s.record_op(0, OpPayload::Read { addr: 0x100 });
        s.record_op(0, OpPayload::ThreadExit);
        s.finalize();
        s
    }

    #[test]
    fn test_memory_run_compressed_into_one_node() {
        let store = small_store();
        let g = HbGraph::build(&store, &DetectorConfig::default()).unwrap();
        // threadinit | alloc write free read | threadexit
        assert_eq!(g.node_count(), 3);
        let n = g.node_of(2).unwrap();
        assert_eq!(g.node_of(3).unwrap(), n);
        assert_eq!(g.node_of(4).unwrap(), n);
        assert_eq!(g.node_of(5).unwrap(), n);
        assert_ne!(g.node_of(1).unwrap(), n);
        assert_eq!(g.ops_in_node(n).unwrap(), &[2, 3, 4, 5]);
    }

    #[test]
    fn test_add_edge_idempotent() {
        let mut g = HbGraph::with_discrete_nodes(4, 4096);
        assert_eq!(g.add_op_edge(1, 2, EdgeKind::SameThread).unwrap(), EdgeAdd::Added);
        assert_eq!(
            g.add_op_edge(1, 2, EdgeKind::SameThread).unwrap(),
            EdgeAdd::AlreadyPresent
        );
        assert_eq!(g.op_edge_count(), 1);
        assert!(g.op_edge_exists(1, 2).unwrap());
        assert!(!g.op_edge_exists(2, 1).unwrap());
    }

    #[test]
    fn test_reverse_edge_is_cycle_error() {
        let mut g = HbGraph::with_discrete_nodes(3, 4096);
        g.add_op_edge(1, 2, EdgeKind::SameThread).unwrap();
        let err = g.add_op_edge(2, 1, EdgeKind::SameThread).unwrap_err();
        assert!(matches!(err, DetectorError::CycleDetected { .. }));
    }

    #[test]
    fn test_self_loop_rejected() {
        let store = small_store();
        let mut g = HbGraph::build(&store, &DetectorConfig::default()).unwrap();
        // ops 2 and 5 share a node
        let err = g.add_op_edge(2, 5, EdgeKind::SameThread).unwrap_err();
        assert!(matches!(err, DetectorError::SelfLoop(_)));
    }

    #[test]
    fn test_invalid_op_rejected() {
        let g = HbGraph::with_discrete_nodes(2, 4096);
        assert!(matches!(
            g.op_edge_exists(0, 1).unwrap_err(),
            DetectorError::InvalidOp(0)
        ));
        assert!(matches!(
            g.op_edge_exists(1, 99).unwrap_err(),
            DetectorError::InvalidOp(99)
        ));
    }

    #[test]
    fn test_list_only_mode_matches_matrix_mode() {
        let mut dense = HbGraph::with_discrete_nodes(8, 4096);
        let mut sparse = HbGraph::with_discrete_nodes(8, 0);
        for (a, b) in [(1, 2), (2, 4), (1, 5), (3, 7)] {
            dense.add_op_edge(a, b, EdgeKind::CrossThread).unwrap();
            sparse.add_op_edge(a, b, EdgeKind::CrossThread).unwrap();
        }
        for a in 1..=8 {
            for b in 1..=8 {
                if a == b {
                    continue;
                }
                assert_eq!(
                    dense.op_edge_exists(a, b).unwrap(),
                    sparse.op_edge_exists(a, b).unwrap(),
                    "mismatch at ({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn test_node_limit_enforced() {
        let store = small_store();
        let cfg = DetectorConfig { node_limit: 2, ..Default::default() };
        let err = HbGraph::build(&store, &cfg).unwrap_err();
        assert!(matches!(err, DetectorError::NodeLimitExceeded { .. }));

        let cfg = DetectorConfig {
            node_limit: 2,
            run_over_node_limit: true,
            ..Default::default()
        };
        assert!(HbGraph::build(&store, &cfg).is_ok());
    }

    #[test]
    fn test_ordered_before_within_block_and_across() {
        let store = small_store();
        let g = HbGraph::build(&store, &DetectorConfig::default()).unwrap();
        // program order inside the single block
        assert!(g.ordered_before(&store, 2, 5).unwrap());
        assert!(!g.ordered_before(&store, 5, 2).unwrap());

        // second thread, edge threadexit(6) -> join-free op via explicit add
        let mut s2 = TraceStore::new();
        s2.record_op(0, OpPayload::ThreadInit);
        s2.record_op(0, OpPayload::Free { addr: 0x10, size: 4 });
        s2.record_op(0, OpPayload::Fork { child: 1 });
        s2.record_op(1, OpPayload::ThreadInit);
        s2.record_op(1, OpPayload::Read { addr: 0x10 });
        s2.record_op(1, OpPayload::ThreadExit);
        s2.finalize();
        let mut g2 = HbGraph::build(&s2, &DetectorConfig::default()).unwrap();
        g2.add_op_edge(3, 4, EdgeKind::CrossThread).unwrap();
        // free(2) precedes fork(3) in-block; fork -> threadinit(4) precedes read(5)
        assert!(g2.ordered_before(&s2, 2, 5).unwrap());
        assert!(!g2.ordered_before(&s2, 5, 2).unwrap());
    }
}
