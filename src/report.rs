//! Findings and the analysis report.
//!
//! A [`Finding`] is one conflicting pair of operations together with the
//! allocation it refers to; the [`AnalysisReport`] aggregates findings and
//! the graph counters and renders them as text or JSON.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::trace::{OpId, ThreadId};

/// Classification of a conflicting pair, from the thread, task and
/// parent-task relationship of the two operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaceKind {
    /// Different threads.
    Multithreaded,
    /// Same thread, same task (or same compressed block run).
    Singlethreaded,
    /// Same thread, sibling tasks nested under one parent.
    NestedNested,
    /// Same thread, one task nested directly under the other.
    NestedPrimary,
    /// Same thread, distinct tasks whose dequeues the graph orders.
    NestedWithTasksOrdered,
    /// Same thread, at least one of the tasks is non-atomic.
    NonatomicWithOther,
    /// Different threads, at least one op outside any task.
    NoTaskMultithreaded,
    /// Same thread, at least one op outside any task.
    NoTaskSinglethreaded,
    /// Alloc and use share an atomic task but the free ran elsewhere.
    SameTaskAllocMultithreaded,
    /// Matched the false-positive heuristic; reported only when
    /// suppression is disabled.
    SuppressedFalsePositive,
}

/// One conflicting pair.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// The free op (UAF) or the first access (race).
    pub op1: OpId,
    pub thread1: ThreadId,
    /// The use op (UAF) or the second access (race).
    pub op2: OpId,
    pub thread2: ThreadId,
    /// Allocation the conflict refers to; absent when the trace starts
    /// after the allocation.
    pub alloc_op: Option<OpId>,
    pub alloc_thread: Option<ThreadId>,
    pub kind: RaceKind,
    pub is_uaf: bool,
    /// True when the graph orders the free before the use; unordered
    /// pairs are reported as potential.
    pub definite: bool,
}

/// Aggregated result of one analysis run.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub findings: Vec<Finding>,
    pub uaf_count: usize,
    pub race_count: usize,
    pub suppressed_false_positives: usize,
    pub node_count: usize,
    pub op_edge_count: usize,
    pub block_edge_count: usize,
}

impl AnalysisReport {
    pub fn new(node_count: usize, op_edge_count: usize, block_edge_count: usize) -> Self {
        Self {
            findings: Vec::new(),
            uaf_count: 0,
            race_count: 0,
            suppressed_false_positives: 0,
            node_count,
            op_edge_count,
            block_edge_count,
        }
    }

    pub fn push(&mut self, finding: Finding) {
        if finding.is_uaf {
            self.uaf_count += 1;
        } else {
            self.race_count += 1;
        }
        self.findings.push(finding);
    }

    /// Human-readable report, findings grouped by allocation.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Graph: {} nodes, {} op edges, {} block edges", self.node_count, self.op_edge_count, self.block_edge_count);

        let mut by_alloc: BTreeMap<Option<OpId>, Vec<&Finding>> = BTreeMap::new();
        for f in &self.findings {
            by_alloc.entry(f.alloc_op).or_default().push(f);
        }
        for (alloc, group) in &by_alloc {
            for f in group {
                let certainty = if f.definite { "Definite" } else { "Potential" };
                let what = if f.is_uaf { "UAF" } else { "race" };
                let _ = writeln!(
                    out,
                    "{} {} between op {} (thread {}) and op {} (thread {}) [{:?}]",
                    certainty, what, f.op1, f.thread1, f.op2, f.thread2, f.kind
                );
            }
            match (alloc, group.first().and_then(|f| f.alloc_thread)) {
                (Some(a), Some(t)) => {
                    let _ = writeln!(out, "  memory originally allocated at op {a} (thread {t})");
                }
                (None, _) => {
                    let _ = writeln!(out, "  allocation not present in the trace");
                }
                _ => {}
            }
        }

        if self.uaf_count == 0 {
            let _ = writeln!(out, "No use-after-free in the trace");
        } else {
            let _ = writeln!(out, "Found {} use-after-free pair(s)", self.uaf_count);
        }
        if self.race_count > 0 {
            let _ = writeln!(out, "Found {} data race(s)", self.race_count);
        }
        if self.suppressed_false_positives > 0 {
            let _ = writeln!(
                out,
                "Suppressed {} likely false positive(s)",
                self.suppressed_false_positives
            );
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
