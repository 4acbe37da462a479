#![allow(missing_docs)]
//! Core of the quiesce production-rule engine.
//!
//! Rules are matched incrementally against working memory by a RETE network,
//! their preferences are settled by the decision procedure into operator
//! selections or impasses, and a kernel drives any number of agents through
//! the Input, Propose, Decide, Apply and Output phases.

#[macro_use]
mod arena;

/// Agent state and the per-agent phase machine
pub mod agent;
/// TOML configuration with environment overrides
pub mod config;
/// Preference semantics and selection policies
pub mod decide;
/// Engine error types
pub mod error;
/// Rule firings and their bookkeeping
pub mod instantiation;
/// Input-link and output-link adapters
pub mod io;
/// Runtime parameter table
pub mod params;
/// Preference kinds and support
pub mod preference;
/// Condition/action rule representation
pub mod production;
/// Incremental match network
pub mod rete;
/// Phases, run units and the multi-agent kernel
pub mod scheduler;
/// Trace feed and sinks
pub mod trace;
/// Working memory and identifier reclamation
pub mod wm;

pub use agent::{Agent, AgentReport, AgentStats, Goal, IoLinks, StepReport};
pub use config::{AgentConfig, KernelConfig, RunConfig, SelectionConfig};
pub use decide::{ImpasseKind, Resolution, SelectionPolicy};
pub use error::{EngineError, EngineResult, ErrorSeverity};
pub use io::{InputLink, IoAdapter, OutputFact, OutputView};
pub use params::{Param, ParamTable, ParamValue, TraceLevel};
pub use preference::{Preference, PreferenceKind, Support};
pub use production::{Action, Condition, Operand, Pattern, Production, ProductionKind, Relation, RhsValue, Test};
pub use rete::{NetworkImage, ProductionId, Rete};
pub use scheduler::{Kernel, Phase, RunOutcome, RunState, StepUnit};
pub use trace::{DecisionOutcome, RecordingSink, TraceEvent, TraceSink};
pub use wm::{WmStats, WorkingMemory};

pub use quiesce_types::{Constant, IdHandle, Symbol, SymbolTable, Timetag};
