//! Conflict detection over the completed happens-before graph.
//!
//! The UAF sweep visits every free op and compares it against the reads
//! and writes falling inside the freed range: a free ordered before a use
//! is a definite use-after-free, a use ordered before the free is safe,
//! and an unordered pair is a potential use-after-free unless the
//! false-positive heuristic recognizes it as an artifact of in-task
//! initialization. The race sweep compares same-address accesses inside
//! each allocation for unordered write/write and write/read pairs.

use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::error::Result;
use crate::graph::HbGraph;
use crate::report::{AnalysisReport, Finding, RaceKind};
use crate::rules;
use crate::trace::{OpId, TraceStore};

/// Run the whole pipeline on a parsed trace: build the graph, infer edges
/// to fixpoint, then sweep for conflicts.
pub fn analyze(store: &TraceStore, config: &DetectorConfig) -> Result<AnalysisReport> {
    let mut graph = HbGraph::build(store, config)?;
    rules::run_inference(store, &mut graph)?;
    let mut report = AnalysisReport::new(
        graph.node_count(),
        graph.op_edge_count(),
        graph.block_edge_count(),
    );
    find_use_after_free(store, &graph, config, &mut report)?;
    if config.data_races {
        find_data_races(store, &graph, config, &mut report)?;
    }
    Ok(report)
}

fn finding(
    store: &TraceStore,
    op1: OpId,
    op2: OpId,
    alloc: Option<OpId>,
    kind: RaceKind,
    is_uaf: bool,
    definite: bool,
) -> Finding {
    Finding {
        op1,
        thread1: store.op(op1).thread,
        op2,
        thread2: store.op(op2).thread,
        alloc_op: alloc,
        alloc_thread: alloc.map(|a| store.op(a).thread),
        kind,
        is_uaf,
        definite,
    }
}

/// Did `alloc` happen before `use_op` according to the graph (or program
/// order, when the two ops share a compressed node)?
fn allocated_before(
    store: &TraceStore,
    graph: &HbGraph,
    alloc: OpId,
    use_op: OpId,
) -> Result<bool> {
    if graph.node_of(alloc)? == graph.node_of(use_op)? {
        Ok(alloc < use_op)
    } else {
        graph.ordered_before(store, alloc, use_op)
    }
}

pub fn find_use_after_free(
    store: &TraceStore,
    graph: &HbGraph,
    config: &DetectorConfig,
    report: &mut AnalysisReport,
) -> Result<()> {
    for (&free, members) in &store.free_members {
        if members.alloc.is_none() {
            warn!(op = free, "free without a matching allocation in the trace");
        }
        let mut found_for_free = false;
        for &use_op in members.reads.iter().chain(members.writes.iter()) {
            if config.first_per_object && found_for_free {
                break;
            }
            check_uaf_pair(
                store,
                graph,
                config,
                free,
                use_op,
                members.alloc,
                report,
                &mut found_for_free,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_uaf_pair(
    store: &TraceStore,
    graph: &HbGraph,
    config: &DetectorConfig,
    free: OpId,
    use_op: OpId,
    alloc: Option<OpId>,
    report: &mut AnalysisReport,
    found: &mut bool,
) -> Result<()> {
    // Same compressed node: program order within the block decides, and
    // the pair is single-threaded by construction.
    if graph.node_of(free)? == graph.node_of(use_op)? {
        if free < use_op {
            report.push(finding(
                store,
                free,
                use_op,
                alloc,
                RaceKind::Singlethreaded,
                true,
                true,
            ));
            *found = true;
        }
        return Ok(());
    }

    if graph.ordered_before(store, free, use_op)? {
        let kind = race_kind(store, graph, free, use_op)?;
        report.push(finding(store, free, use_op, alloc, kind, true, true));
        *found = true;
        return Ok(());
    }
    if graph.ordered_before(store, use_op, free)? {
        return Ok(());
    }

    // Unordered. An allocation used inside its own still-atomic task is
    // ordinary initialization; if the free also ran on the using thread
    // the pair cannot interleave and is considered a false positive.
    let mut kind = race_kind(store, graph, free, use_op)?;
    if let Some(alloc_op) = alloc {
        let same_atomic_task = match (&store.op(alloc_op).task, &store.op(use_op).task) {
            (Some(a), Some(u)) if a == u => store.require_task(a)?.atomic,
            _ => false,
        };
        if same_atomic_task && allocated_before(store, graph, alloc_op, use_op)? {
            if store.op(free).thread == store.op(use_op).thread {
                if config.suppress_false_positives {
                    debug!(free, use_op, alloc_op, "suppressed in-task init false positive");
                    report.suppressed_false_positives += 1;
                    return Ok(());
                }
                kind = RaceKind::SuppressedFalsePositive;
            } else {
                kind = RaceKind::SameTaskAllocMultithreaded;
            }
        }
    }
    report.push(finding(store, free, use_op, alloc, kind, true, false));
    *found = true;
    Ok(())
}

pub fn find_data_races(
    store: &TraceStore,
    graph: &HbGraph,
    config: &DetectorConfig,
    report: &mut AnalysisReport,
) -> Result<()> {
    for (&alloc, members) in &store.alloc_members {
        let mut found_for_alloc = false;
        let writes: Vec<OpId> = members.writes.iter().copied().collect();
        'alloc: for (i, &w1) in writes.iter().enumerate() {
            for &other in writes[i + 1..].iter().chain(members.reads.iter()) {
                if config.first_per_object && found_for_alloc {
                    break 'alloc;
                }
                let a1 = store.write_set[&w1].addr;
                let a2 = store
                    .write_set
                    .get(&other)
                    .map(|a| a.addr)
                    .or_else(|| store.read_set.get(&other).map(|a| a.addr));
                if a2 != Some(a1) {
                    continue;
                }
                if graph.node_of(w1)? == graph.node_of(other)? {
                    continue;
                }
                if graph.ordered_before(store, w1, other)?
                    || graph.ordered_before(store, other, w1)?
                {
                    continue;
                }
                let kind = race_kind(store, graph, w1, other)?;
                report.push(finding(store, w1, other, Some(alloc), kind, false, false));
                found_for_alloc = true;
            }
        }
    }
    Ok(())
}

/// Classify a conflicting pair by thread, task and parent-task
/// relationship.
pub fn race_kind(store: &TraceStore, graph: &HbGraph, op1: OpId, op2: OpId) -> Result<RaceKind> {
    let t1 = store.op(op1).thread;
    let t2 = store.op(op2).thread;
    let (task1, task2) = match (&store.op(op1).task, &store.op(op2).task) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => {
            return Ok(if t1 != t2 {
                RaceKind::NoTaskMultithreaded
            } else {
                RaceKind::NoTaskSinglethreaded
            });
        }
    };
    if t1 != t2 {
        return Ok(RaceKind::Multithreaded);
    }
    if task1 == task2 {
        return Ok(RaceKind::Singlethreaded);
    }
    let rec1 = store.require_task(&task1)?;
    let rec2 = store.require_task(&task2)?;
    if rec1.parent_task.as_deref() == Some(task2.as_str())
        || rec2.parent_task.as_deref() == Some(task1.as_str())
    {
        return Ok(RaceKind::NestedPrimary);
    }
    if rec1.parent_task.is_some() && rec1.parent_task == rec2.parent_task {
        return Ok(RaceKind::NestedNested);
    }
    if let (Some(d1), Some(d2)) = (rec1.deq_op, rec2.deq_op) {
        if graph.ordered_before(store, d1, d2)? || graph.ordered_before(store, d2, d1)? {
            return Ok(RaceKind::NestedWithTasksOrdered);
        }
    }
    if !rec1.atomic || !rec2.atomic {
        return Ok(RaceKind::NonatomicWithOther);
    }
    Ok(RaceKind::Singlethreaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{OpPayload, ThreadId};

    fn run(ops: &[(ThreadId, OpPayload)], config: &DetectorConfig) -> AnalysisReport {
        let mut s = TraceStore::new();
        for (t, p) in ops {
            s.record_op(*t, p.clone());
        }
        s.finalize();
        analyze(&s, config).unwrap()
    }

    #[test]
    fn test_same_node_use_after_free_is_definite_singlethreaded() {
        let report = run(
            &[
                (0, OpPayload::ThreadInit),
                (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
                (0, OpPayload::Write { addr: 0x100 }),
                (0, OpPayload::Free { addr: 0x100, size: 8 }),
                (0, OpPayload::Read { addr: 0x100 }),
                (0, OpPayload::ThreadExit),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(report.uaf_count, 1);
        let f = &report.findings[0];
        assert_eq!((f.op1, f.op2), (4, 5));
        assert_eq!(f.kind, RaceKind::Singlethreaded);
        assert!(f.definite);
        assert_eq!(f.alloc_op, Some(2));
    }

    #[test]
    fn test_use_ordered_before_free_is_not_reported() {
        let report = run(
            &[
                (0, OpPayload::ThreadInit),
                (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
                (0, OpPayload::Fork { child: 1 }),
                (1, OpPayload::ThreadInit),
                (1, OpPayload::Write { addr: 0x100 }),
                (1, OpPayload::ThreadExit),
                (0, OpPayload::Join { child: 1 }),
                (0, OpPayload::Free { addr: 0x100, size: 8 }),
                (0, OpPayload::ThreadExit),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(report.uaf_count, 0);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_free_ordered_before_use_is_definite_cross_thread() {
        let report = run(
            &[
                (0, OpPayload::ThreadInit),
                (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
                (0, OpPayload::Free { addr: 0x100, size: 8 }),
                (0, OpPayload::Fork { child: 1 }),
                (1, OpPayload::ThreadInit),
                (1, OpPayload::Read { addr: 0x100 }),
                (1, OpPayload::ThreadExit),
                (0, OpPayload::ThreadExit),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(report.uaf_count, 1);
        let f = &report.findings[0];
        assert!(f.definite);
        assert_eq!((f.op1, f.op2), (3, 6));
        assert_eq!(f.kind, RaceKind::NoTaskMultithreaded);
    }

    #[test]
    fn test_in_task_init_false_positive_suppressed() {
        let trace = [
            (0, OpPayload::ThreadInit),
            (0, OpPayload::EnterLoop),
            (0, OpPayload::Deq { task: "0xa".into() }),
            (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
            (0, OpPayload::Write { addr: 0x100 }),
            (0, OpPayload::End { task: "0xa".into() }),
            (0, OpPayload::Deq { task: "0xb".into() }),
            (0, OpPayload::Free { addr: 0x100, size: 8 }),
            (0, OpPayload::End { task: "0xb".into() }),
            (0, OpPayload::ExitLoop),
            (0, OpPayload::ThreadExit),
        ];
        let report = run(&trace, &DetectorConfig::default());
        assert_eq!(report.uaf_count, 0);
        assert_eq!(report.suppressed_false_positives, 1);

        // with suppression off the pair is reported and labeled
        let report = run(
            &trace,
            &DetectorConfig { suppress_false_positives: false, ..Default::default() },
        );
        assert_eq!(report.uaf_count, 1);
        assert_eq!(report.findings[0].kind, RaceKind::SuppressedFalsePositive);
        assert!(!report.findings[0].definite);
    }

    #[test]
    fn test_unordered_loop_tasks_are_potential_uaf() {
        let report = run(
            &[
                (0, OpPayload::ThreadInit),
                (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
                (0, OpPayload::EnterLoop),
                (0, OpPayload::Deq { task: "0xa".into() }),
                (0, OpPayload::Write { addr: 0x100 }),
                (0, OpPayload::End { task: "0xa".into() }),
                (0, OpPayload::Deq { task: "0xb".into() }),
                (0, OpPayload::Free { addr: 0x100, size: 8 }),
                (0, OpPayload::End { task: "0xb".into() }),
                (0, OpPayload::ExitLoop),
                (0, OpPayload::ThreadExit),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(report.uaf_count, 1);
        let f = &report.findings[0];
        assert!(!f.definite);
        assert_eq!((f.op1, f.op2), (8, 5));
    }

    #[test]
    fn test_race_requires_unordered_and_same_address() {
        let trace = [
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Alloc { addr: 0x100, size: 16 }),
            (0, OpPayload::Fork { child: 1 }),
            (0, OpPayload::Write { addr: 0x100 }),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::Write { addr: 0x100 }),
            (1, OpPayload::Write { addr: 0x108 }),
            (1, OpPayload::ThreadExit),
            (0, OpPayload::ThreadExit),
        ];
        let off = run(&trace, &DetectorConfig::default());
        assert_eq!(off.race_count, 0);

        let on = run(&trace, &DetectorConfig { data_races: true, ..Default::default() });
        // only the same-address unordered pair races; 0x108 does not
        assert_eq!(on.race_count, 1);
        let f = &on.findings[0];
        assert_eq!((f.op1, f.op2), (4, 6));
        assert_eq!(f.kind, RaceKind::NoTaskMultithreaded);
        assert!(!f.is_uaf);
    }

    #[test]
    fn test_first_per_object_keeps_one_finding_per_free() {
        let report = run(
            &[
                (0, OpPayload::ThreadInit),
                (0, OpPayload::Alloc { addr: 0x100, size: 8 }),
                (0, OpPayload::Free { addr: 0x100, size: 8 }),
                (0, OpPayload::Fork { child: 1 }),
                (1, OpPayload::ThreadInit),
                (1, OpPayload::Read { addr: 0x100 }),
                (1, OpPayload::Write { addr: 0x100 }),
                (1, OpPayload::ThreadExit),
                (0, OpPayload::ThreadExit),
            ],
            &DetectorConfig { first_per_object: true, ..Default::default() },
        );
        assert_eq!(report.uaf_count, 1);
    }
}
