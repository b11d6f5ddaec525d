//! Trace file parser.
//!
//! One operation per line, `<tid>: <op>(<args>)`, case-insensitive and
//! whitespace-tolerant. The first argument repeats the thread id; numeric
//! handles (task ids, shared variables, addresses, sizes, priorities) are
//! hex with or without a `0x` prefix, thread ids are decimal. Lines that
//! do not match the grammar are logged and skipped so a truncated or
//! lightly corrupted trace still analyzes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{DetectorError, Result};
use crate::trace::{OpPayload, ThreadId, TraceStore};

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+)\s*:\s*([a-z]+)\s*\(([^)]*)\)\s*$").expect("trace line regex")
    })
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

fn parse_dec(s: &str) -> Option<usize> {
    s.trim().parse().ok()
}

/// Normalized form of a task or shared-variable handle.
fn parse_handle(s: &str) -> Option<String> {
    let value = parse_hex(s)?;
    Some(format!("{value:#x}"))
}

/// Decode one line into the thread id and the operation payload.
fn parse_line(line: &str) -> Option<(ThreadId, OpPayload)> {
    let caps = line_re().captures(line)?;
    let thread: ThreadId = parse_dec(&caps[1])?;
    let op = caps[2].to_ascii_lowercase();
    let args: Vec<&str> = if caps[3].trim().is_empty() {
        Vec::new()
    } else {
        caps[3].split(',').collect()
    };

    // The first argument repeats the thread id; the prefix wins but a
    // mismatch is worth flagging.
    if let Some(arg_tid) = args.first().and_then(|a| parse_dec(a)) {
        if arg_tid != thread {
            warn!(line = %line.trim(), "thread id prefix and argument disagree");
        }
    }

    let payload = match (op.as_str(), args.len()) {
        ("threadinit", 1) => OpPayload::ThreadInit,
        ("threadexit", 1) => OpPayload::ThreadExit,
        ("fork", 2) => OpPayload::Fork { child: parse_dec(args[1])? },
        ("join", 2) => OpPayload::Join { child: parse_dec(args[1])? },
        ("enterloop", 1) => OpPayload::EnterLoop,
        ("exitloop", 1) => OpPayload::ExitLoop,
        ("enq", 4) => OpPayload::Enq {
            task: parse_handle(args[1])?,
            target: parse_dec(args[2])?,
            priority: parse_hex(args[3])?,
        },
        ("deq", 2) => OpPayload::Deq { task: parse_handle(args[1])? },
        ("end", 2) => OpPayload::End { task: parse_handle(args[1])? },
        ("pause", 2) => OpPayload::Pause { var: parse_handle(args[1])? },
        ("resume", 2) => OpPayload::Resume { var: parse_handle(args[1])? },
        ("reset", 2) => OpPayload::Reset { var: parse_handle(args[1])? },
        ("alloc", 3) => OpPayload::Alloc {
            addr: parse_hex(args[1])?,
            size: parse_hex(args[2])?,
        },
        ("free", 3) => OpPayload::Free {
            addr: parse_hex(args[1])?,
            size: parse_hex(args[2])?,
        },
        ("read", 2) => OpPayload::Read { addr: parse_hex(args[1])? },
        ("write", 2) => OpPayload::Write { addr: parse_hex(args[1])? },
        ("acquire", 2) => OpPayload::Acquire { lock: parse_handle(args[1])? },
        ("release", 2) => OpPayload::Release { lock: parse_handle(args[1])? },
        ("inc", 2) => OpPayload::Inc { var: parse_handle(args[1])? },
        ("dec", 2) => OpPayload::Dec { var: parse_handle(args[1])? },
        _ => return None,
    };
    Some((thread, payload))
}

/// Parse a whole trace from a reader into a finalized store.
pub fn parse_reader<R: BufRead>(reader: R) -> Result<TraceStore> {
    let mut store = TraceStore::new();
    let mut skipped = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some((thread, payload)) => {
                store.record_op(thread, payload);
            }
            None => {
                warn!(line = lineno + 1, text = %line.trim(), "unrecognized trace line, skipping");
                skipped += 1;
            }
        }
    }
    if store.op_count() == 0 {
        return Err(DetectorError::MalformedTrace(
            "no parseable operations in the trace".into(),
        ));
    }
    store.finalize();
    info!(
        ops = store.op_count(),
        blocks = store.block_count(),
        tasks = store.tasks.len(),
        threads = store.threads.len(),
        skipped,
        "trace parsed"
    );
    Ok(store)
}

/// Parse a trace file into a finalized store.
pub fn parse_file(path: &Path) -> Result<TraceStore> {
    let file = File::open(path)?;
    parse_reader(BufReader::new(file))
}
