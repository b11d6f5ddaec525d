//! taskgrind: offline use-after-free and data-race detection for traces
//! of task-based, event-loop programs.
//!
//! The pipeline: [`parser`] reads a trace file into the [`trace`] record
//! store; [`graph`] compresses the operations into happens-before graph
//! nodes; [`rules`] infers ordering edges from the task and threading
//! semantics until a fixpoint; [`detector`] sweeps the memory-operation
//! sets for frees and accesses the graph leaves unordered; [`report`]
//! renders the findings.

pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod graph;
pub mod parser;
pub mod report;
pub mod rules;
pub mod trace;

pub use config::DetectorConfig;
pub use detector::analyze;
pub use error::{DetectorError, Result};
pub use graph::HbGraph;
pub use report::{AnalysisReport, Finding, RaceKind};
pub use trace::TraceStore;
