//! Edge-inference rule battery.
//!
//! Seed rules run once over the parsed trace: fork/join, event-loop program
//! order, enqueue-to-dequeue, task program order, and the pause/resume/reset
//! correlation. Closure rules then loop to a fixpoint, each pass deriving
//! edges from the ones already present: FIFO dispatch for atomic tasks,
//! non-preemption, the nested-task FIFO family, reset-driven resume
//! ordering, and block-level transitivity.
//!
//! Every rule reads the immutable [`TraceStore`] and mutates the
//! [`HbGraph`]; edges are only ever added (the transitive rule's
//! remove/re-add canonicalization nets out to a no-op on reachability), so
//! the fixpoint loop terminates once a full pass adds nothing.

use tracing::{debug, info, trace, warn};

use crate::error::{DetectorError, Result};
use crate::graph::{EdgeAdd, EdgeKind, HbGraph};
use crate::trace::{BlockId, OpId, TraceStore};

/// Whether one rule pass grew the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    EdgesAdded,
    NoChange,
}

fn outcome(added: bool) -> RuleOutcome {
    if added {
        RuleOutcome::EdgesAdded
    } else {
        RuleOutcome::NoChange
    }
}

type RuleFn = fn(&TraceStore, &mut HbGraph) -> Result<RuleOutcome>;

/// Run the seed rules once, then the closure rules until no rule adds an
/// edge. Any rule error aborts inference.
pub fn run_inference(store: &TraceStore, graph: &mut HbGraph) -> Result<()> {
    seed_fork_join_loop(store, graph)?;
    seed_task_order(store, graph)?;
    seed_pause_resume_reset(store, graph)?;

    let closure: [(&str, RuleFn); 4] = [
        ("fifo", fifo_atomic_nopre),
        ("fifo-nested", fifo_nested),
        ("enqreset", enqreset_resume),
        ("transitive", transitive),
    ];
    let mut passes = 0usize;
    loop {
        passes += 1;
        let mut any = false;
        for (name, rule) in closure {
            if rule(store, graph)? == RuleOutcome::EdgesAdded {
                trace!(pass = passes, rule = name, "closure rule added edges");
                any = true;
            }
        }
        if !any {
            break;
        }
    }
    info!(
        passes,
        op_edges = graph.op_edge_count(),
        block_edges = graph.block_edge_count(),
        "edge inference reached fixpoint"
    );
    Ok(())
}

/// Add the edge unless one already exists between the two nodes.
fn add_edge(
    graph: &mut HbGraph,
    store: &TraceStore,
    src: OpId,
    dst: OpId,
    rule: &'static str,
    added: &mut bool,
) -> Result<()> {
    if graph.op_edge_exists(src, dst)? {
        return Ok(());
    }
    if graph.add_op_edge(src, dst, EdgeKind::between(store, src, dst))? == EdgeAdd::Added {
        *added = true;
        debug!(rule, src, dst, "edge added");
    }
    Ok(())
}

fn thread_blocks(
    store: &TraceStore,
    first: Option<BlockId>,
) -> impl Iterator<Item = BlockId> + '_ {
    std::iter::successors(first, move |&b| store.block(b).next_in_thread)
}

fn task_blocks(
    store: &TraceStore,
    first: Option<BlockId>,
) -> impl Iterator<Item = BlockId> + '_ {
    std::iter::successors(first, move |&b| store.block(b).next_in_task)
}

/// Blocks whose enqueue ops a rule scans: the op's own block plus every
/// block already reachable from it by a direct edge.
fn enq_scan_blocks(graph: &HbGraph, block: BlockId) -> Vec<BlockId> {
    let succ = graph.block_successors(block);
    let mut v = Vec::with_capacity(succ.len() + 1);
    v.push(block);
    v.extend_from_slice(succ);
    v
}

/// Seed: fork precedes the child's first op, the child's last op precedes
/// join, and for threads running an event loop, blocks outside the loop
/// are program-ordered against the rest of the thread.
fn seed_fork_join_loop(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (&tid, thread) in &store.threads {
        match (thread.fork_op, thread.threadinit_op) {
            (Some(fork), Some(init)) => add_edge(graph, store, fork, init, "fork", &mut added)?,
            (Some(_), None) => warn!(thread = tid, "forked thread never initialized"),
            _ => {}
        }
        match (thread.threadexit_op, thread.join_op) {
            (Some(exit), Some(join)) => add_edge(graph, store, exit, join, "join", &mut added)?,
            (None, Some(_)) => warn!(thread = tid, "joined thread never exited"),
            _ => {}
        }

        let (Some(enter), Some(exit_block)) = (thread.enterloop_block, thread.exitloop_block)
        else {
            debug!(thread = tid, "no event loop, skipping loop program order");
            continue;
        };

        // Blocks up to and including the loop entry precede every later
        // block of the thread.
        for b1 in thread_blocks(store, thread.first_block) {
            if b1 > enter {
                break;
            }
            for b2 in thread_blocks(store, store.block(b1).next_in_thread) {
                add_edge(
                    graph,
                    store,
                    store.block(b1).last_op,
                    store.block(b2).first_op,
                    "loop-po",
                    &mut added,
                )?;
            }
            if b1 == enter {
                break;
            }
        }
        // Every block after loop entry precedes each block at or after the
        // loop exit. Blocks inside the loop stay mutually unordered.
        for b1 in thread_blocks(store, Some(exit_block)) {
            for b2 in thread_blocks(store, store.block(enter).next_in_thread) {
                if b2 == b1 {
                    break;
                }
                add_edge(
                    graph,
                    store,
                    store.block(b2).last_op,
                    store.block(b1).first_op,
                    "loop-po",
                    &mut added,
                )?;
            }
        }
    }
    Ok(outcome(added))
}

/// Seed: enqueue precedes dequeue, and a task's blocks are totally ordered
/// along its block chain.
fn seed_task_order(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (name, task) in &store.tasks {
        match (task.enq_op, task.deq_op) {
            (Some(enq), Some(deq)) => add_edge(graph, store, enq, deq, "enqueue", &mut added)?,
            (Some(_), None) => {
                // Pending at trace end; its blocks never ran.
                debug!(task = %name, "task enqueued but never dequeued");
                continue;
            }
            _ => {}
        }
        let chain: Vec<BlockId> = task_blocks(store, task.first_block).collect();
        for (i, &b1) in chain.iter().enumerate() {
            for &b2 in &chain[i + 1..] {
                add_edge(
                    graph,
                    store,
                    store.block(b1).last_op,
                    store.block(b2).first_op,
                    "task-po",
                    &mut added,
                )?;
            }
        }
    }
    Ok(outcome(added))
}

/// Seed: pause/resume/reset correlation per shared variable. A pause
/// precedes each reset of its variable (or, same-thread, the resetting
/// task's dequeue); a reset precedes the resume (or, same-thread, the
/// resetting task's end).
fn seed_pause_resume_reset(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (var, nl) in &store.nesting_loops {
        let Some(pause) = nl.pause_op else {
            warn!(var = %var, "nesting loop without a pause");
            continue;
        };
        for &reset in &nl.reset_ops {
            let reset_task = store.op(reset).task.clone();
            if store.op(pause).thread != store.op(reset).thread {
                add_edge(graph, store, pause, reset, "pause-mt", &mut added)?;
            } else {
                let Some(task) = reset_task.as_deref() else {
                    warn!(op = reset, var = %var, "reset outside any task");
                    continue;
                };
                let Some(deq) = store.require_task(task)?.deq_op else {
                    warn!(task, "resetting task has no dequeue");
                    continue;
                };
                add_edge(graph, store, pause, deq, "pause-st", &mut added)?;
            }

            let Some(resume) = nl.resume_op else {
                warn!(var = %var, "nesting loop never resumed");
                continue;
            };
            if store.op(reset).thread != store.op(resume).thread {
                add_edge(graph, store, reset, resume, "resume-mt", &mut added)?;
            } else {
                let Some(task) = reset_task.as_deref() else {
                    continue;
                };
                let Some(end) = store.require_task(task)?.end_op else {
                    warn!(task, "resetting task has no end");
                    continue;
                };
                add_edge(graph, store, reset, end, "resume-st", &mut added)?;
            }
        }
    }
    Ok(outcome(added))
}

/// Closure: FIFO dispatch and non-preemption for atomic tasks.
///
/// If atomic task A's enqueue is ordered before another enqueue with the
/// same target thread and priority, A's end precedes the other task's
/// dequeue. And since A runs to completion on its thread, any enqueue
/// targeting that thread that is ordered after one of A's ops cannot be
/// dispatched before A ends.
fn fifo_atomic_nopre(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (name, task) in &store.tasks {
        if !task.atomic {
            continue;
        }
        let Some(deq) = task.deq_op else {
            continue;
        };
        let Some(end) = task.end_op else {
            warn!(task = %name, "task dequeued but never ended");
            continue;
        };

        if let Some(enq) = task.enq_op {
            let info = store.require_enq(enq)?;
            for b in enq_scan_blocks(graph, store.op(enq).block) {
                for &other in &store.block(b).enq_ops {
                    if other == enq {
                        continue;
                    }
                    let other_info = store.require_enq(other)?;
                    if other_info.task == *name
                        || other_info.target_thread != info.target_thread
                        || other_info.priority != info.priority
                    {
                        continue;
                    }
                    if !graph.ordered_before(store, enq, other)? {
                        continue;
                    }
                    let Some(other_deq) = store.require_task(&other_info.task)?.deq_op else {
                        debug!(task = %other_info.task, "competing task never dequeued");
                        continue;
                    };
                    add_edge(graph, store, end, other_deq, "fifo-atomic", &mut added)?;
                }
            }
        }

        let mut cur = Some(deq);
        while let Some(op_i) = cur {
            for b in enq_scan_blocks(graph, store.op(op_i).block) {
                for &other in &store.block(b).enq_ops {
                    if other == op_i {
                        continue;
                    }
                    let other_info = store.require_enq(other)?;
                    if other_info.task == *name
                        || other_info.target_thread != store.op(op_i).thread
                    {
                        continue;
                    }
                    if !graph.ordered_before(store, op_i, other)? {
                        continue;
                    }
                    let Some(other_deq) = store.require_task(&other_info.task)?.deq_op else {
                        continue;
                    };
                    add_edge(graph, store, end, other_deq, "no-preemption", &mut added)?;
                }
            }
            if op_i == end {
                break;
            }
            cur = store.op(op_i).next_in_task;
        }
    }
    Ok(outcome(added))
}

/// Closure: FIFO dispatch for non-atomic (pausing) tasks.
///
/// Only the segments before the first pause and after the last resume run
/// uninterrupted, so the FIFO conclusions attach to the first pause and to
/// the end respectively; each intermediate resume orders the following
/// pause against dequeues of later enqueues. The reset correlation further
/// pins tasks enqueued between a pausing task and its resetter: they must
/// end before the resume.
fn fifo_nested(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (name, task) in &store.tasks {
        if task.atomic {
            continue;
        }
        if task.enq_op.is_some() && task.deq_op.is_none() {
            continue;
        }
        let Some(end) = task.end_op else {
            warn!(task = %name, "pausing task never ended");
            continue;
        };

        if let (Some(enq), Some(first_pause)) = (task.enq_op, task.first_pause_op) {
            let target = store.op(first_pause).thread;
            for b in enq_scan_blocks(graph, store.op(enq).block) {
                for &other in &store.block(b).enq_ops {
                    if other == enq {
                        continue;
                    }
                    let info = store.require_enq(other)?;
                    if info.task == *name || info.target_thread != target {
                        continue;
                    }
                    if !graph.ordered_before(store, enq, other)? {
                        continue;
                    }
                    let Some(other_deq) = store.require_task(&info.task)?.deq_op else {
                        continue;
                    };
                    add_edge(graph, store, first_pause, other_deq, "fifo-nested-first", &mut added)?;
                }
            }
        }

        if let Some(last_resume) = task.last_resume_op {
            let target = store.op(end).thread;
            for b in enq_scan_blocks(graph, store.op(last_resume).block) {
                for &other in &store.block(b).enq_ops {
                    let info = store.require_enq(other)?;
                    if info.task == *name || info.target_thread != target {
                        continue;
                    }
                    if !graph.ordered_before(store, last_resume, other)? {
                        continue;
                    }
                    let Some(other_deq) = store.require_task(&info.task)?.deq_op else {
                        continue;
                    };
                    add_edge(graph, store, end, other_deq, "fifo-nested-last", &mut added)?;
                }
            }
        } else {
            debug!(task = %name, "paused task never resumed");
        }

        for (i, triple) in task.pause_resume_sequence.iter().enumerate() {
            let Some(resume) = triple.resume else {
                continue;
            };

            if let Some(next_pause) =
                task.pause_resume_sequence.get(i + 1).and_then(|t| t.pause)
            {
                let target = store.op(resume).thread;
                for b in enq_scan_blocks(graph, store.op(resume).block) {
                    for &other in &store.block(b).enq_ops {
                        let info = store.require_enq(other)?;
                        if info.task == *name || info.target_thread != target {
                            continue;
                        }
                        if !graph.ordered_before(store, resume, other)? {
                            continue;
                        }
                        let Some(other_deq) = store.require_task(&info.task)?.deq_op else {
                            continue;
                        };
                        add_edge(graph, store, next_pause, other_deq, "fifo-nested-gen", &mut added)?;
                    }
                }
            }

            // Tasks enqueued between this task's enqueue and the enqueue of
            // the task that resets the awaited variable run before the
            // resume can happen.
            let Some(enq_k) = task.enq_op else {
                continue;
            };
            let Some(var) = store.prr_var_of_op.get(&resume) else {
                warn!(op = resume, "resume with no recorded variable");
                continue;
            };
            let Some(nl) = store.nesting_loops.get(var) else {
                continue;
            };
            let info_k = store.require_enq(enq_k)?;
            for &reset in &nl.reset_ops {
                let Some(reset_task) = store.op(reset).task.as_deref() else {
                    continue;
                };
                let Some(enq_n) = store.require_task(reset_task)?.enq_op else {
                    continue;
                };
                if enq_n == enq_k {
                    return Err(DetectorError::MalformedTrace(format!(
                        "task {name} both resets and resumes variable {var}"
                    )));
                }
                let info_n = store.require_enq(enq_n)?;
                if info_k.target_thread != info_n.target_thread {
                    continue;
                }
                for b in enq_scan_blocks(graph, store.op(enq_k).block) {
                    for &enq_l in &store.block(b).enq_ops {
                        if enq_l == enq_k || enq_l == enq_n {
                            continue;
                        }
                        let info_l = store.require_enq(enq_l)?;
                        if info_l.target_thread != info_k.target_thread {
                            continue;
                        }
                        if !graph.ordered_before(store, enq_k, enq_l)?
                            || !graph.ordered_before(store, enq_l, enq_n)?
                        {
                            continue;
                        }
                        let Some(mid_end) = store.require_task(&info_l.task)?.end_op else {
                            continue;
                        };
                        add_edge(graph, store, mid_end, resume, "enqreset-between", &mut added)?;
                    }
                }
            }
        }
    }
    Ok(outcome(added))
}

/// Closure: when an atomic child task resets the variable its parent is
/// paused on, on the parent's own thread, enqueues ordered after the reset
/// dispatch only once the parent has finished its final segment.
fn enqreset_resume(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for (var, nl) in &store.nesting_loops {
        let Some(resume) = nl.resume_op else {
            continue;
        };
        for &reset in &nl.reset_ops {
            if store.op(reset).thread != store.op(resume).thread {
                continue;
            }
            let Some(reset_task_name) = store.op(reset).task.as_deref() else {
                warn!(op = reset, var = %var, "reset outside any task");
                continue;
            };
            let Some(resume_task_name) = store.op(resume).task.as_deref() else {
                continue;
            };
            let reset_task = store.require_task(reset_task_name)?;
            if !reset_task.atomic {
                continue;
            }
            let resume_task = store.require_task(resume_task_name)?;
            if resume_task.last_resume_op != Some(resume) {
                continue;
            }
            if reset_task.parent_task.as_deref() != Some(resume_task_name) {
                continue;
            }
            let Some(end_m) = resume_task.end_op else {
                continue;
            };
            let next_pause = resume_task
                .pause_resume_sequence
                .iter()
                .position(|t| t.resume == Some(resume))
                .and_then(|i| resume_task.pause_resume_sequence.get(i + 1))
                .and_then(|t| t.pause);
            for b in enq_scan_blocks(graph, store.op(reset).block) {
                for &other in &store.block(b).enq_ops {
                    let info = store.require_enq(other)?;
                    if info.task == *reset_task_name
                        || info.task == *resume_task_name
                        || info.target_thread != store.op(reset).thread
                    {
                        continue;
                    }
                    if !graph.ordered_before(store, reset, other)? {
                        continue;
                    }
                    let Some(other_deq) = store.require_task(&info.task)?.deq_op else {
                        continue;
                    };
                    add_edge(graph, store, end_m, other_deq, "enqreset-end", &mut added)?;
                    if let Some(p) = next_pause {
                        add_edge(graph, store, p, other_deq, "enqreset-pause", &mut added)?;
                    }
                }
            }
        }
    }
    Ok(outcome(added))
}

/// Closure: block-level transitivity. For block chains I -> K -> J (all
/// distinct, either all one thread or endpoints on different threads),
/// compose edges through K into a direct edge, canonicalizing parallel
/// edges into one destination block down to the earliest destination op.
fn transitive(store: &TraceStore, graph: &mut HbGraph) -> Result<RuleOutcome> {
    let mut added = false;
    for block_i in 1..=store.block_count() {
        let succ_i = graph.block_successors(block_i).to_vec();
        for block_k in succ_i {
            if block_k == block_i {
                continue;
            }
            let succ_k = graph.block_successors(block_k).to_vec();
            for block_j in succ_k {
                if block_j == block_i || block_j == block_k {
                    continue;
                }
                let t_i = store.block(block_i).thread;
                let t_k = store.block(block_k).thread;
                let t_j = store.block(block_j).thread;
                let same_thread = t_i == t_k && t_k == t_j;
                if !same_thread && t_i == t_j {
                    continue;
                }
                let last_i = store.block(block_i).last_op;
                let first_j = store.block(block_j).first_op;
                if graph.op_edge_exists(last_i, first_j)? {
                    continue;
                }
                let kind = if same_thread {
                    EdgeKind::SameThread
                } else {
                    EdgeKind::CrossThread
                };

                let mut cur_i = Some(last_i);
                'src: while let Some(op_i) = cur_i {
                    if let Some(min_k) = canonical_edge_into(graph, store, op_i, block_k)? {
                        let mut best_j: Option<OpId> = None;
                        let mut cur_k = Some(min_k);
                        while let Some(op_k) = cur_k {
                            if let Some(min_j) =
                                canonical_edge_into(graph, store, op_k, block_j)?
                            {
                                if best_j.map_or(true, |b| min_j < b) {
                                    best_j = Some(min_j);
                                }
                            }
                            cur_k = store.op(op_k).next_in_block;
                        }
                        if let Some(op_j) = best_j {
                            // An edge to an earlier op of the destination
                            // block already subsumes this one; re-adding a
                            // pruned parallel edge would never converge.
                            let covered = graph
                                .edges_into_block(op_i, block_j)?
                                .first()
                                .is_some_and(|&d| d <= op_j);
                            if !covered
                                && graph.add_op_edge(op_i, op_j, kind)? == EdgeAdd::Added
                            {
                                added = true;
                                debug!(rule = "transitive", src = op_i, dst = op_j, "edge added");
                            }
                            if op_i == last_i && op_j == first_j {
                                break 'src;
                            }
                        }
                    }
                    cur_i = store.op(op_i).prev_in_block;
                }
            }
        }
    }
    Ok(outcome(added))
}

/// Collapse all edges from `src` into `block` down to the earliest
/// destination op and return it.
fn canonical_edge_into(
    graph: &mut HbGraph,
    store: &TraceStore,
    src: OpId,
    block: BlockId,
) -> Result<Option<OpId>> {
    let dsts = graph.edges_into_block(src, block)?;
    let Some(&min) = dsts.first() else {
        return Ok(None);
    };
    if dsts.len() > 1 {
        let kind = EdgeKind::between(store, src, min);
        for &d in &dsts {
            graph.remove_op_edge(src, d)?;
        }
        graph.add_op_edge(src, min, kind)?;
    }
    Ok(Some(min))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::trace::{OpPayload, ThreadId};

    fn analyze(ops: &[(ThreadId, OpPayload)]) -> (TraceStore, HbGraph) {
        let mut s = TraceStore::new();
        for (t, p) in ops {
            s.record_op(*t, p.clone());
        }
        s.finalize();
        let mut g = HbGraph::build(&s, &DetectorConfig::default()).unwrap();
        run_inference(&s, &mut g).unwrap();
        (s, g)
    }

    #[test]
    fn test_fork_and_join_edges() {
        let (_, g) = analyze(&[
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Fork { child: 1 }),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::ThreadExit),
            (0, OpPayload::Join { child: 1 }),
            (0, OpPayload::ThreadExit),
        ]);
        assert!(g.op_edge_exists(2, 3).unwrap());
        assert!(g.op_edge_exists(4, 5).unwrap());
        // both edges cross the thread boundary
        assert_eq!(g.edge_kind(2, 3).unwrap(), Some(EdgeKind::CrossThread));
        assert_eq!(g.edge_kind(4, 5).unwrap(), Some(EdgeKind::CrossThread));
    }

    #[test]
    fn test_loop_orders_pre_and_post_blocks() {
        let (s, g) = analyze(&[
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Write { addr: 0x10 }),
            (0, OpPayload::EnterLoop),
            (0, OpPayload::Deq { task: "0xa".into() }),
            (0, OpPayload::Write { addr: 0x20 }),
            (0, OpPayload::End { task: "0xa".into() }),
            (0, OpPayload::ExitLoop),
            (0, OpPayload::Read { addr: 0x10 }),
            (0, OpPayload::ThreadExit),
        ]);
        // write before the loop precedes the read after it
        assert!(g.ordered_before(&s, 2, 8).unwrap());
        // the task body precedes the post-loop block
        assert!(g.ordered_before(&s, 5, 8).unwrap());
        assert!(!g.ordered_before(&s, 8, 2).unwrap());
    }

    #[test]
    fn test_fifo_orders_same_thread_same_priority_tasks() {
        let (s, g) = analyze(&[
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Enq { task: "0xa".into(), target: 1, priority: 0 }),
            (0, OpPayload::Enq { task: "0xb".into(), target: 1, priority: 0 }),
            (0, OpPayload::ThreadExit),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::EnterLoop),
            (1, OpPayload::Deq { task: "0xa".into() }),
            (1, OpPayload::Write { addr: 0x10 }),
            (1, OpPayload::End { task: "0xa".into() }),
            (1, OpPayload::Deq { task: "0xb".into() }),
            (1, OpPayload::Read { addr: 0x10 }),
            (1, OpPayload::End { task: "0xb".into() }),
            (1, OpPayload::ExitLoop),
            (1, OpPayload::ThreadExit),
        ]);
        // enqueue -> dequeue for both tasks
        assert!(g.op_edge_exists(2, 7).unwrap());
        assert!(g.op_edge_exists(3, 10).unwrap());
        // 0xa was enqueued first, so its end precedes 0xb's dequeue
        assert!(g.op_edge_exists(9, 10).unwrap());
        // and the task bodies are ordered through it
        assert!(g.ordered_before(&s, 8, 11).unwrap());
        // enqueue edges cross threads, the FIFO edge stays on the consumer
        assert_eq!(g.edge_kind(2, 7).unwrap(), Some(EdgeKind::CrossThread));
        assert_eq!(g.edge_kind(9, 10).unwrap(), Some(EdgeKind::SameThread));
    }

    #[test]
    fn test_different_priority_not_fifo_ordered() {
        let (s, g) = analyze(&[
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Enq { task: "0xa".into(), target: 1, priority: 0 }),
            (0, OpPayload::Enq { task: "0xb".into(), target: 1, priority: 7 }),
            (0, OpPayload::ThreadExit),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::EnterLoop),
            (1, OpPayload::Deq { task: "0xa".into() }),
            (1, OpPayload::Write { addr: 0x10 }),
            (1, OpPayload::End { task: "0xa".into() }),
            (1, OpPayload::Deq { task: "0xb".into() }),
            (1, OpPayload::Read { addr: 0x10 }),
            (1, OpPayload::End { task: "0xb".into() }),
            (1, OpPayload::ExitLoop),
            (1, OpPayload::ThreadExit),
        ]);
        assert!(!g.op_edge_exists(9, 10).unwrap());
        let _ = s;
    }

    #[test]
    fn test_pause_reset_resume_cross_thread() {
        let (s, g) = analyze(&[
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Deq { task: "0xa".into() }),
            (0, OpPayload::Pause { var: "0xv".into() }),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::Reset { var: "0xv".into() }),
            (0, OpPayload::Resume { var: "0xv".into() }),
            (0, OpPayload::End { task: "0xa".into() }),
            (0, OpPayload::ThreadExit),
            (1, OpPayload::ThreadExit),
        ]);
        // pause -> reset and reset -> resume across threads
        assert!(g.op_edge_exists(3, 5).unwrap());
        assert!(g.op_edge_exists(5, 6).unwrap());
        assert!(g.ordered_before(&s, 3, 7).unwrap());
    }

    #[test]
    fn test_inference_is_idempotent() {
        let mut s = TraceStore::new();
        for (t, p) in [
            (0, OpPayload::ThreadInit),
            (0, OpPayload::Enq { task: "0xa".into(), target: 1, priority: 0 }),
            (0, OpPayload::Enq { task: "0xb".into(), target: 1, priority: 0 }),
            (0, OpPayload::Fork { child: 1 }),
            (1, OpPayload::ThreadInit),
            (1, OpPayload::EnterLoop),
            (1, OpPayload::Deq { task: "0xa".into() }),
            (1, OpPayload::End { task: "0xa".into() }),
            (1, OpPayload::Deq { task: "0xb".into() }),
            (1, OpPayload::End { task: "0xb".into() }),
            (1, OpPayload::ExitLoop),
            (1, OpPayload::ThreadExit),
            (0, OpPayload::Join { child: 1 }),
            (0, OpPayload::ThreadExit),
        ] {
            s.record_op(t, p);
        }
        s.finalize();
        let mut g = HbGraph::build(&s, &DetectorConfig::default()).unwrap();
        run_inference(&s, &mut g).unwrap();
        let edges = g.op_edge_count();
        run_inference(&s, &mut g).unwrap();
        assert_eq!(g.op_edge_count(), edges);
    }
}
