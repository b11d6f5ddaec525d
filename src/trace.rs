//! Trace record store: the fully parsed, in-memory model of one execution
//! trace.
//!
//! The store owns four arenas (operations, blocks, tasks, threads) plus the
//! auxiliary maps the inference rules scan: nesting-loop pause/resume/reset
//! correlation, enqueue details, and the memory-operation sets with their
//! interval-derived alloc/free association. Records are built incrementally
//! by [`record_op`](TraceStore::record_op) while the parser walks the trace,
//! then frozen by [`finalize`](TraceStore::finalize); after that the store is
//! read-only for the rest of the run.
//!
//! Ids are small dense integers assigned in trace order, starting at 1.
//! Task ids are opaque strings (hex handles in the trace).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::error::{DetectorError, Result};

/// 1-based dense operation id (trace line order).
pub type OpId = usize;
/// 1-based dense block id (creation order).
pub type BlockId = usize;
/// Thread id as recorded in the trace.
pub type ThreadId = usize;

/// The kind of a trace operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    ThreadInit,
    ThreadExit,
    EnterLoop,
    ExitLoop,
    Enq,
    Deq,
    Pause,
    Resume,
    Reset,
    End,
    Fork,
    Join,
    Alloc,
    Free,
    Read,
    Write,
    /// Lock extension: recorded but drives no inference rule.
    Acquire,
    /// Lock extension: recorded but drives no inference rule.
    Release,
    /// Shared-counter extension: recorded but drives no inference rule.
    Inc,
    /// Shared-counter extension: recorded but drives no inference rule.
    Dec,
}

impl OpKind {
    /// Memory operations are the only ops eligible for node compression;
    /// every other kind is a synchronization-relevant op and always gets
    /// its own graph node.
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            OpKind::Alloc | OpKind::Free | OpKind::Read | OpKind::Write
        )
    }
}

/// One trace event. Positional links are filled progressively as adjacent
/// ops are seen; the record is immutable once the trace is fully parsed.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OpId,
    pub thread: ThreadId,
    /// Task executing when this op occurred; `None` means not inside any task.
    pub task: Option<String>,
    pub kind: OpKind,
    pub block: BlockId,
    pub next_in_thread: Option<OpId>,
    pub prev_in_thread: Option<OpId>,
    pub next_in_task: Option<OpId>,
    pub next_in_block: Option<OpId>,
    pub prev_in_block: Option<OpId>,
}

/// A maximal run of operations within one thread that is not split by a
/// loop, dequeue, or pause/resume boundary. Every op belongs to exactly
/// one block.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub thread: ThreadId,
    pub task: Option<String>,
    pub first_op: OpId,
    pub last_op: OpId,
    pub prev_in_thread: Option<BlockId>,
    pub next_in_thread: Option<BlockId>,
    pub next_in_task: Option<BlockId>,
    /// Enqueue ops occurring in this block.
    pub enq_ops: BTreeSet<OpId>,
}

/// A pause/resume/reset triple in a task's nesting-loop history.
#[derive(Debug, Clone, Default)]
pub struct PauseResumeTriple {
    pub pause: Option<OpId>,
    pub resume: Option<OpId>,
    pub reset: Option<OpId>,
}

/// A logical unit of work, executed non-preemptively except for explicit
/// pause/resume.
#[derive(Debug, Clone)]
pub struct Task {
    pub enq_op: Option<OpId>,
    pub deq_op: Option<OpId>,
    pub end_op: Option<OpId>,
    pub first_pause_op: Option<OpId>,
    pub last_resume_op: Option<OpId>,
    /// Task that was paused on this thread when this task was dequeued.
    pub parent_task: Option<String>,
    /// True until the task pauses; atomic tasks run without re-entrancy
    /// and drive the FIFO rules and the false-positive heuristic.
    pub atomic: bool,
    pub priority: Option<u64>,
    pub pause_resume_sequence: Vec<PauseResumeTriple>,
    pub first_block: Option<BlockId>,
    pub last_block: Option<BlockId>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            enq_op: None,
            deq_op: None,
            end_op: None,
            first_pause_op: None,
            last_resume_op: None,
            parent_task: None,
            // A task is atomic until its first pause.
            atomic: true,
            priority: None,
            pause_resume_sequence: Vec::new(),
            first_block: None,
            last_block: None,
        }
    }
}

/// A physical execution context.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub first_op: Option<OpId>,
    pub threadinit_op: Option<OpId>,
    pub threadexit_op: Option<OpId>,
    /// Fork op (in the parent thread) that created this thread.
    pub fork_op: Option<OpId>,
    /// Join op (in the joining thread) that waited for this thread.
    pub join_op: Option<OpId>,
    pub enterloop_block: Option<BlockId>,
    pub exitloop_block: Option<BlockId>,
    pub first_block: Option<BlockId>,
    pub last_block: Option<BlockId>,
}

/// Pause/resume/reset correlation for one shared variable.
#[derive(Debug, Clone, Default)]
pub struct NestingLoop {
    /// First pause observed on this variable.
    pub pause_op: Option<OpId>,
    /// Most recent resume observed on this variable.
    pub resume_op: Option<OpId>,
    pub reset_ops: BTreeSet<OpId>,
}

/// Details of one enqueue operation.
#[derive(Debug, Clone)]
pub struct EnqInfo {
    pub task: String,
    pub target_thread: ThreadId,
    pub priority: u64,
}

/// Address range of an alloc/free op.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub addr: u64,
    pub size: u64,
}

impl MemRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr.saturating_add(self.size.max(1))
    }
}

/// Address touched by a read/write op.
#[derive(Debug, Clone, Copy)]
pub struct MemAccess {
    pub addr: u64,
}

/// Reads, writes and frees that fall inside one allocation's range.
#[derive(Debug, Clone, Default)]
pub struct AllocMembers {
    pub reads: BTreeSet<OpId>,
    pub writes: BTreeSet<OpId>,
    pub frees: BTreeSet<OpId>,
}

/// The alloc a free releases, and the reads/writes inside the freed range.
#[derive(Debug, Clone, Default)]
pub struct FreeMembers {
    pub alloc: Option<OpId>,
    pub reads: BTreeSet<OpId>,
    pub writes: BTreeSet<OpId>,
}

/// Payload of one parsed trace line, as handed over by the parser.
#[derive(Debug, Clone)]
pub enum OpPayload {
    ThreadInit,
    ThreadExit,
    Fork { child: ThreadId },
    Join { child: ThreadId },
    EnterLoop,
    ExitLoop,
    Enq { task: String, target: ThreadId, priority: u64 },
    Deq { task: String },
    End { task: String },
    Pause { var: String },
    Resume { var: String },
    Reset { var: String },
    Alloc { addr: u64, size: u64 },
    Free { addr: u64, size: u64 },
    Read { addr: u64 },
    Write { addr: u64 },
    Acquire { lock: String },
    Release { lock: String },
    Inc { var: String },
    Dec { var: String },
}

impl OpPayload {
    fn kind(&self) -> OpKind {
        match self {
            OpPayload::ThreadInit => OpKind::ThreadInit,
            OpPayload::ThreadExit => OpKind::ThreadExit,
            OpPayload::Fork { .. } => OpKind::Fork,
            OpPayload::Join { .. } => OpKind::Join,
            OpPayload::EnterLoop => OpKind::EnterLoop,
            OpPayload::ExitLoop => OpKind::ExitLoop,
            OpPayload::Enq { .. } => OpKind::Enq,
            OpPayload::Deq { .. } => OpKind::Deq,
            OpPayload::End { .. } => OpKind::End,
            OpPayload::Pause { .. } => OpKind::Pause,
            OpPayload::Resume { .. } => OpKind::Resume,
            OpPayload::Reset { .. } => OpKind::Reset,
            OpPayload::Alloc { .. } => OpKind::Alloc,
            OpPayload::Free { .. } => OpKind::Free,
            OpPayload::Read { .. } => OpKind::Read,
            OpPayload::Write { .. } => OpKind::Write,
            OpPayload::Acquire { .. } => OpKind::Acquire,
            OpPayload::Release { .. } => OpKind::Release,
            OpPayload::Inc { .. } => OpKind::Inc,
            OpPayload::Dec { .. } => OpKind::Dec,
        }
    }
}

/// Per-thread construction state, discarded by [`TraceStore::finalize`].
#[derive(Debug, Default)]
struct ThreadBuild {
    current_block: Option<BlockId>,
    /// Tasks currently executing on this thread, innermost last.
    task_stack: Vec<String>,
    /// Tasks paused on this thread, most recent last.
    paused_stack: Vec<String>,
    last_op: Option<OpId>,
}

/// The fully parsed trace.
///
/// Not thread-safe; intended for single-owner, single-thread use, one
/// instance per trace run.
#[derive(Debug, Default)]
pub struct TraceStore {
    ops: Vec<Operation>,
    blocks: Vec<Block>,
    pub tasks: BTreeMap<String, Task>,
    pub threads: BTreeMap<ThreadId, Thread>,
    pub nesting_loops: BTreeMap<String, NestingLoop>,
    /// Shared-variable token of each pause/resume/reset op.
    pub prr_var_of_op: HashMap<OpId, String>,
    pub enq_details: BTreeMap<OpId, EnqInfo>,
    pub alloc_set: BTreeMap<OpId, MemRegion>,
    pub free_set: BTreeMap<OpId, MemRegion>,
    pub read_set: BTreeMap<OpId, MemAccess>,
    pub write_set: BTreeMap<OpId, MemAccess>,
    pub alloc_members: BTreeMap<OpId, AllocMembers>,
    pub free_members: BTreeMap<OpId, FreeMembers>,

    build: HashMap<ThreadId, ThreadBuild>,
    last_op_in_task: HashMap<String, OpId>,
    finalized: bool,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Look up an operation. Ids handed out by the store are dense, so
    /// callers holding one may index directly.
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id - 1]
    }

    pub fn try_op(&self, id: OpId) -> Option<&Operation> {
        id.checked_sub(1).and_then(|i| self.ops.get(i))
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id - 1]
    }

    pub fn try_block(&self, id: BlockId) -> Option<&Block> {
        id.checked_sub(1).and_then(|i| self.blocks.get(i))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Fetch a task record the rules require to exist.
    pub fn require_task(&self, name: &str) -> Result<&Task> {
        self.tasks.get(name).ok_or_else(|| DetectorError::MissingRecord {
            kind: "task",
            key: name.to_string(),
        })
    }

    /// Fetch the enqueue details the rules require to exist.
    pub fn require_enq(&self, op: OpId) -> Result<&EnqInfo> {
        self.enq_details.get(&op).ok_or(DetectorError::MissingRecord {
            kind: "enq",
            key: op.to_string(),
        })
    }

    /// Record one trace operation. Returns the assigned op id.
    pub fn record_op(&mut self, thread: ThreadId, payload: OpPayload) -> OpId {
        debug_assert!(!self.finalized);
        let id = self.ops.len() + 1;
        let kind = payload.kind();

        if !self.threads.contains_key(&thread) {
            if kind != OpKind::ThreadInit {
                // Production traces are commonly truncated at the start:
                // tolerate a thread appearing mid-stream.
                warn!(thread, op = id, "trace begins mid-thread, synthesizing thread start");
            }
            self.threads.insert(thread, Thread::default());
            self.build.insert(thread, ThreadBuild::default());
        }
        self.build.entry(thread).or_default();

        // Task-stack effects that must precede block selection.
        match &payload {
            OpPayload::Deq { task } => {
                let state = self.build.get_mut(&thread).expect("thread state");
                let parent = state.paused_stack.last().cloned();
                state.task_stack.push(task.clone());
                let rec = self.tasks.entry(task.clone()).or_default();
                rec.deq_op = Some(id);
                if rec.parent_task.is_none() {
                    rec.parent_task = parent;
                }
            }
            OpPayload::Resume { .. } => {
                let state = self.build.get_mut(&thread).expect("thread state");
                match state.paused_stack.pop() {
                    Some(t) => state.task_stack.push(t),
                    None => warn!(thread, op = id, "resume with no paused task"),
                }
            }
            _ => {}
        }

        let current_task = self
            .build
            .get(&thread)
            .and_then(|s| s.task_stack.last().cloned());

        // Block boundaries: deq, resume and exitloop start a fresh block;
        // enterloop, pause, end and threadexit close the block behind them.
        if matches!(kind, OpKind::Deq | OpKind::Resume | OpKind::ExitLoop) {
            self.close_block(thread);
        }
        let block_id = self.current_or_new_block(thread, current_task.clone(), id);
        let prev_in_block = {
            let b = &mut self.blocks[block_id - 1];
            if b.first_op == id {
                None
            } else {
                let prev = b.last_op;
                b.last_op = id;
                Some(prev)
            }
        };
        let prev_in_thread = self.build.get(&thread).and_then(|s| s.last_op);

        self.ops.push(Operation {
            id,
            thread,
            task: current_task.clone(),
            kind,
            block: block_id,
            next_in_thread: None,
            prev_in_thread,
            next_in_task: None,
            next_in_block: None,
            prev_in_block,
        });
        self.link_op(thread, id, prev_in_thread, prev_in_block, current_task.as_deref());

        // Record-specific details.
        match payload {
            OpPayload::ThreadInit => {
                self.threads.get_mut(&thread).expect("thread").threadinit_op = Some(id);
            }
            OpPayload::ThreadExit => {
                self.threads.get_mut(&thread).expect("thread").threadexit_op = Some(id);
            }
            OpPayload::Fork { child } => {
                self.threads.entry(child).or_default().fork_op = Some(id);
            }
            OpPayload::Join { child } => {
                self.threads.entry(child).or_default().join_op = Some(id);
            }
            OpPayload::EnterLoop => {
                self.threads.get_mut(&thread).expect("thread").enterloop_block = Some(block_id);
            }
            OpPayload::ExitLoop => {
                self.threads.get_mut(&thread).expect("thread").exitloop_block = Some(block_id);
            }
            OpPayload::Enq { task, target, priority } => {
                self.enq_details.insert(
                    id,
                    EnqInfo { task: task.clone(), target_thread: target, priority },
                );
                self.blocks[block_id - 1].enq_ops.insert(id);
                let rec = self.tasks.entry(task.clone()).or_default();
                if rec.enq_op.is_some() {
                    warn!(op = id, task = %task, "task enqueued more than once, keeping first enq");
                } else {
                    rec.enq_op = Some(id);
                    rec.priority = Some(priority);
                }
            }
            OpPayload::Deq { .. } => {
                // handled above
            }
            OpPayload::End { task } => {
                let rec = self.tasks.entry(task.clone()).or_default();
                rec.end_op = Some(id);
                let state = self.build.get_mut(&thread).expect("thread state");
                match state.task_stack.last() {
                    Some(top) if *top == task => {
                        state.task_stack.pop();
                    }
                    _ => {
                        warn!(op = id, task = %task, "end does not match innermost task");
                        state.task_stack.retain(|t| *t != task);
                    }
                }
            }
            OpPayload::Pause { var } => {
                if let Some(task) = current_task.clone() {
                    let rec = self.tasks.entry(task.clone()).or_default();
                    rec.atomic = false;
                    if rec.first_pause_op.is_none() {
                        rec.first_pause_op = Some(id);
                    }
                    rec.pause_resume_sequence.push(PauseResumeTriple {
                        pause: Some(id),
                        resume: None,
                        reset: None,
                    });
                    let state = self.build.get_mut(&thread).expect("thread state");
                    state.paused_stack.push(task);
                    state.task_stack.pop();
                } else {
                    warn!(op = id, "pause outside any task");
                }
                let entry = self.nesting_loops.entry(var.clone()).or_default();
                if entry.pause_op.is_none() {
                    entry.pause_op = Some(id);
                }
                self.prr_var_of_op.insert(id, var);
            }
            OpPayload::Resume { var } => {
                if let Some(task) = current_task.clone() {
                    let rec = self.tasks.entry(task).or_default();
                    rec.last_resume_op = Some(id);
                    if let Some(t) = rec
                        .pause_resume_sequence
                        .iter_mut()
                        .rev()
                        .find(|t| t.resume.is_none())
                    {
                        t.resume = Some(id);
                    }
                }
                self.nesting_loops.entry(var.clone()).or_default().resume_op = Some(id);
                self.prr_var_of_op.insert(id, var);
            }
            OpPayload::Reset { var } => {
                let entry = self.nesting_loops.entry(var.clone()).or_default();
                entry.reset_ops.insert(id);
                // Attach the reset to the open pause/resume triple of the
                // task that is waiting on this variable, if any.
                if let Some(pause_op) = entry.pause_op {
                    if let Some(paused_task) = self.ops[pause_op - 1].task.clone() {
                        if let Some(rec) = self.tasks.get_mut(&paused_task) {
                            if let Some(t) = rec
                                .pause_resume_sequence
                                .iter_mut()
                                .rev()
                                .find(|t| t.resume.is_none() && t.reset.is_none())
                            {
                                t.reset = Some(id);
                            }
                        }
                    }
                }
                self.prr_var_of_op.insert(id, var);
            }
            OpPayload::Alloc { addr, size } => {
                self.alloc_set.insert(id, MemRegion { addr, size });
            }
            OpPayload::Free { addr, size } => {
                self.free_set.insert(id, MemRegion { addr, size });
            }
            OpPayload::Read { addr } => {
                self.read_set.insert(id, MemAccess { addr });
            }
            OpPayload::Write { addr } => {
                self.write_set.insert(id, MemAccess { addr });
            }
            OpPayload::Acquire { .. }
            | OpPayload::Release { .. }
            | OpPayload::Inc { .. }
            | OpPayload::Dec { .. } => {
                // Lock and counter extensions: recorded in the op arena only.
            }
        }

        // Closing boundaries.
        if matches!(
            kind,
            OpKind::EnterLoop | OpKind::Pause | OpKind::End | OpKind::ThreadExit
        ) {
            self.close_block(thread);
        }

        id
    }

    fn link_op(
        &mut self,
        thread: ThreadId,
        op: OpId,
        prev_in_thread: Option<OpId>,
        prev_in_block: Option<OpId>,
        task: Option<&str>,
    ) {
        if let Some(p) = prev_in_thread {
            self.ops[p - 1].next_in_thread = Some(op);
        }
        self.build.get_mut(&thread).expect("thread state").last_op = Some(op);
        let thread_rec = self.threads.get_mut(&thread).expect("thread");
        if thread_rec.first_op.is_none() {
            thread_rec.first_op = Some(op);
        }
        if let Some(p) = prev_in_block {
            self.ops[p - 1].next_in_block = Some(op);
        }
        if let Some(t) = task {
            if let Some(&prev) = self.last_op_in_task.get(t) {
                self.ops[prev - 1].next_in_task = Some(op);
            }
            self.last_op_in_task.insert(t.to_string(), op);
        }
    }

    fn current_or_new_block(
        &mut self,
        thread: ThreadId,
        task: Option<String>,
        first_op: OpId,
    ) -> BlockId {
        if let Some(b) = self.build.get(&thread).and_then(|s| s.current_block) {
            // Task context changed without an explicit boundary op; start a
            // fresh block so every block has a single task.
            if self.blocks[b - 1].task == task {
                return b;
            }
            self.close_block(thread);
        }
        let id = self.blocks.len() + 1;
        let thread_rec = self.threads.get_mut(&thread).expect("thread");
        let prev = thread_rec.last_block;
        if thread_rec.first_block.is_none() {
            thread_rec.first_block = Some(id);
        }
        thread_rec.last_block = Some(id);
        if let Some(p) = prev {
            self.blocks[p - 1].next_in_thread = Some(id);
        }
        if let Some(t) = task.as_deref() {
            let rec = self.tasks.entry(t.to_string()).or_default();
            if rec.first_block.is_none() {
                rec.first_block = Some(id);
            }
            if let Some(p) = rec.last_block {
                self.blocks[p - 1].next_in_task = Some(id);
            }
            rec.last_block = Some(id);
        }
        self.blocks.push(Block {
            id,
            thread,
            task,
            first_op,
            last_op: first_op,
            prev_in_thread: prev,
            next_in_thread: None,
            next_in_task: None,
            enq_ops: BTreeSet::new(),
        });
        self.build.get_mut(&thread).expect("thread state").current_block = Some(id);
        id
    }

    fn close_block(&mut self, thread: ThreadId) {
        if let Some(state) = self.build.get_mut(&thread) {
            state.current_block = None;
        }
    }

    /// Freeze the store: close open blocks and derive the memory-op
    /// association maps by interval arithmetic over the decoded addresses.
    pub fn finalize(&mut self) {
        let threads: Vec<ThreadId> = self.build.keys().copied().collect();
        for t in threads {
            self.close_block(t);
        }

        for (&alloc_id, region) in &self.alloc_set {
            let mut members = AllocMembers::default();
            for (&r, acc) in &self.read_set {
                if region.contains(acc.addr) {
                    members.reads.insert(r);
                }
            }
            for (&w, acc) in &self.write_set {
                if region.contains(acc.addr) {
                    members.writes.insert(w);
                }
            }
            for (&f, fr) in &self.free_set {
                if region.contains(fr.addr) {
                    members.frees.insert(f);
                }
            }
            self.alloc_members.insert(alloc_id, members);
        }

        for (&free_id, fregion) in &self.free_set {
            let mut members = FreeMembers::default();
            // Latest alloc before the free whose range covers the freed
            // address; if the trace starts mid-stream there may be none.
            members.alloc = self
                .alloc_set
                .iter()
                .filter(|(&a, region)| a < free_id && region.contains(fregion.addr))
                .map(|(&a, _)| a)
                .max();
            for (&r, acc) in &self.read_set {
                if fregion.contains(acc.addr) {
                    members.reads.insert(r);
                }
            }
            for (&w, acc) in &self.write_set {
                if fregion.contains(acc.addr) {
                    members.writes.insert(w);
                }
            }
            self.free_members.insert(free_id, members);
        }

        self.build.clear();
        self.last_op_in_task.clear();
        self.finalized = true;
    }
}
