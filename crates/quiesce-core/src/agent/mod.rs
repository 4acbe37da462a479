//! One agent: every piece of per-agent state and the phase machine over it
//!
//! ```text
//! Input -> Propose* -> Decide -> Apply* -> Output -> Input ...
//!            * elaborations to quiescence
//! ```
//!
//! [`Agent::step`] advances by one step: a whole Input, Decide or Output
//! phase, or a single elaboration of Propose/Apply. Fact changes reach the
//! match network only at the end of a step, never in the middle of firing.

mod decision;
mod elaborate;
mod goals;
mod learn;

pub use goals::{Goal, IoLinks};

use crate::config::AgentConfig;
use crate::decide::{FirstCandidate, SelectionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::instantiation::{FiringStats, InstantiationStore};
use crate::io::{InputLink, IoAdapter, OutputView};
use crate::params::{Param, ParamTable, ParamValue};
use crate::production::Production;
use crate::rete::{NetworkImage, NetworkStats, ProductionId, Rete};
use crate::scheduler::{Phase, RunState};
use crate::trace::{TraceEvent, TraceFeed, TraceSink};
use crate::wm::{WmStats, WorkingMemory, WmeChange};
use ahash::AHashSet;
use goals::{ArchSymbols, GoalStack};
use quiesce_types::{IdHandle, SymbolTable, Timetag, TimetagSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    /// Completed Input..Output cycles
    pub cycles: u64,
    pub decisions: u64,
    pub phases: u64,
    pub elaborations: u64,
    pub output_cycles: u64,
    /// Consecutive completed cycles without output
    pub nil_output_streak: u64,
    pub subgoals: u64,
    pub chunks: u64,
    pub justifications: u64,
    /// Time spent per phase in microseconds; only kept with `timers` on
    pub phase_micros: [u64; Phase::COUNT],
}

/// What one call to [`Agent::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub phase: Phase,
    pub elaborated: bool,
    pub phase_ended: bool,
    pub cycle_completed: bool,
    pub produced_output: bool,
    pub halted: bool,
}

impl StepReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            elaborated: false,
            phase_ended: false,
            cycle_completed: false,
            produced_output: false,
            halted: false,
        }
    }
}

/// Snapshot for dumps and dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub name: String,
    pub state: RunState,
    pub phase: Phase,
    pub goal_depth: usize,
    pub stats: AgentStats,
    pub firings: FiringStats,
    pub memory: WmStats,
    pub network: NetworkStats,
}

pub struct Agent {
    name: String,
    symbols: Arc<SymbolTable>,
    params: ParamTable,
    rete: Rete,
    wm: WorkingMemory,
    insts: InstantiationStore,
    goals: GoalStack,
    arch: ArchSymbols,
    links: IoLinks,
    policy: Box<dyn SelectionPolicy>,
    io: Option<Box<dyn IoAdapter>>,
    trace: TraceFeed,
    state: RunState,
    phase: Phase,
    phase_open: bool,
    elaborations_in_phase: u64,
    halt_reason: Option<String>,
    last_output: AHashSet<Timetag>,
    stats: AgentStats,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("goals", &self.goals.len())
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl Agent {
    pub fn new(
        name: &str,
        symbols: Arc<SymbolTable>,
        timetags: Arc<TimetagSource>,
        params: ParamTable,
    ) -> EngineResult<Self> {
        let mut wm = WorkingMemory::new(symbols.clone(), timetags);
        wm.set_max_goal_depth(params.max_goal_depth());
        let mut rete = Rete::new(symbols.clone());
        rete.set_max_nodes(params.max_nodes());
        let arch = ArchSymbols::intern(&symbols);
        let placeholder = IdHandle::new(0);

        let mut agent = Self {
            name: name.to_string(),
            symbols,
            params,
            rete,
            wm,
            insts: InstantiationStore::default(),
            goals: GoalStack::default(),
            arch,
            links: IoLinks { io: placeholder, input: placeholder, output: placeholder },
            policy: Box::new(FirstCandidate),
            io: None,
            trace: TraceFeed::default(),
            state: RunState::Stopped,
            phase: Phase::Input,
            phase_open: false,
            elaborations_in_phase: 0,
            halt_reason: None,
            last_output: AHashSet::new(),
            stats: AgentStats::default(),
        };
        agent.links = agent.init_top_goal()?;
        agent.apply_changes()?;
        agent.wm.reconcile()?;
        info!(agent = %agent.name, "agent created");
        Ok(agent)
    }

    pub fn from_config(
        config: &AgentConfig,
        symbols: Arc<SymbolTable>,
        timetags: Arc<TimetagSource>,
    ) -> EngineResult<Self> {
        let mut agent = Self::new(&config.name, symbols, timetags, config.params()?)?;
        agent.policy = config.selection_policy();
        Ok(agent)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.state == RunState::Halted
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn firing_stats(&self) -> FiringStats {
        self.insts.stats()
    }

    pub fn params(&self) -> &ParamTable {
        &self.params
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.wm
    }

    pub fn network(&self) -> &Rete {
        &self.rete
    }

    pub fn goals(&self) -> &[Goal] {
        self.goals.goals()
    }

    pub fn top_goal(&self) -> IdHandle {
        self.goals.goals()[0].id
    }

    pub fn bottom_goal(&self) -> IdHandle {
        self.goals.bottom().map_or_else(|| self.top_goal(), |g| g.id)
    }

    pub fn io_links(&self) -> IoLinks {
        self.links
    }

    pub fn report(&self) -> AgentReport {
        AgentReport {
            name: self.name.clone(),
            state: self.state,
            phase: self.phase,
            goal_depth: self.goals.len(),
            stats: self.stats.clone(),
            firings: self.insts.stats(),
            memory: self.wm.stats(),
            network: self.rete.stats(),
        }
    }

    // ------------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------------

    pub fn set_param(&mut self, param: Param, value: ParamValue) -> EngineResult<()> {
        self.params.set(param, value)?;
        match param {
            Param::MaxGoalDepth => self.wm.set_max_goal_depth(self.params.max_goal_depth()),
            Param::MaxNodes => self.rete.set_max_nodes(self.params.max_nodes()),
            _ => {}
        }
        Ok(())
    }

    pub fn set_selection_policy(&mut self, policy: Box<dyn SelectionPolicy>) {
        self.policy = policy;
    }

    pub fn set_io(&mut self, adapter: Box<dyn IoAdapter>) {
        self.io = Some(adapter);
    }

    pub fn add_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace.add_sink(sink);
    }

    #[instrument(skip(self, production), fields(agent = %self.name, rule = %production.name))]
    pub fn add_production(&mut self, production: Production) -> EngineResult<ProductionId> {
        let (id, _) = self.rete.add_production(production, None)?;
        Ok(id)
    }

    /// Excise a rule by name; its fired matches retract at the next elaboration
    pub fn remove_production(&mut self, name: &str) -> EngineResult<Production> {
        let id = self
            .rete
            .find_production(name)
            .ok_or_else(|| EngineError::UnknownRule { name: name.to_string() })?;
        self.rete.remove_production(id)
    }

    pub fn save_network(&self) -> EngineResult<NetworkImage> {
        self.rete.save_image()
    }

    pub fn load_network(&mut self, image: NetworkImage) -> EngineResult<()> {
        self.rete.load_image(image)
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    pub(crate) fn begin_run(&mut self) {
        if matches!(self.state, RunState::Stopped) {
            self.state = RunState::Running(self.phase);
        }
    }

    pub(crate) fn end_run(&mut self) {
        if matches!(self.state, RunState::Running(_)) {
            self.state = RunState::Stopped;
        }
    }

    /// Whether the next step starts a fresh phase
    pub fn at_phase_boundary(&self) -> bool {
        !self.phase_open
    }

    /// Advance by one step. A fatal error halts this agent only.
    pub fn step(&mut self) -> StepReport {
        let phase = self.phase;
        let mut report = StepReport::new(phase);
        if self.is_halted() {
            report.halted = true;
            return report;
        }
        if !self.phase_open {
            self.phase_open = true;
            self.elaborations_in_phase = 0;
            self.emit(TraceEvent::PhaseStarted { agent: self.name.clone(), phase });
        }

        let started = self.params.flag(Param::Timers).then(Instant::now);
        let outcome = match phase {
            Phase::Input => self.run_input().map(|()| true),
            Phase::Propose | Phase::Apply => self.run_elaboration(&mut report),
            Phase::Decide => self.run_decide().map(|()| true),
            Phase::Output => self.run_output(&mut report).map(|()| true),
        };
        if let Some(started) = started {
            let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.stats.phase_micros[phase.index()] += micros;
        }

        match outcome {
            Ok(true) => self.finish_phase(&mut report),
            Ok(false) => {}
            Err(err) => {
                self.halt(format!("{} ({})", err, err.category()));
                report.halted = true;
            }
        }
        report
    }

    fn finish_phase(&mut self, report: &mut StepReport) {
        let phase = self.phase;
        report.phase_ended = true;
        self.phase_open = false;
        self.stats.phases += 1;
        self.emit(TraceEvent::PhaseEnded { agent: self.name.clone(), phase });
        if phase == Phase::Output {
            self.stats.cycles += 1;
            report.cycle_completed = true;
        }
        self.phase = phase.next();
        match self.state {
            RunState::HaltRequested => {
                self.halt("halt action".to_string());
                report.halted = true;
            }
            RunState::Running(_) => self.state = RunState::Running(self.phase),
            _ => {}
        }
    }

    fn halt(&mut self, reason: String) {
        error!(agent = %self.name, %reason, "agent halted");
        self.state = RunState::Halted;
        self.phase_open = false;
        self.emit(TraceEvent::AgentHalted { agent: self.name.clone(), reason: reason.clone() });
        self.halt_reason = Some(reason);
    }

    fn emit(&mut self, event: TraceEvent) {
        self.trace.emit(self.params.trace_level(), event);
    }

    fn warn(&mut self, message: String) {
        self.emit(TraceEvent::Warning { agent: self.name.clone(), message });
    }

    /// Push buffered fact changes into the match network
    fn apply_changes(&mut self) -> EngineResult<()> {
        let tracing_wmes = self.params.trace_level() >= crate::params::TraceLevel::Wmes;
        for change in self.wm.take_changes() {
            match change {
                WmeChange::Add(wme) => {
                    self.rete.add_wme(wme);
                    if tracing_wmes {
                        let fact = format!(
                            "{} ^{} {}{}",
                            self.wm.display(wme.fields[0]),
                            self.wm.display(wme.fields[1]),
                            self.wm.display(wme.fields[2]),
                            if wme.acceptable { " +" } else { "" }
                        );
                        self.emit(TraceEvent::WmeAdded { agent: self.name.clone(), timetag: wme.timetag, fact });
                    }
                }
                WmeChange::Remove(timetag) => {
                    self.rete.remove_wme(timetag)?;
                    if tracing_wmes {
                        self.emit(TraceEvent::WmeRemoved { agent: self.name.clone(), timetag });
                    }
                }
            }
        }
        Ok(())
    }

    fn run_input(&mut self) -> EngineResult<()> {
        if let Some(mut adapter) = self.io.take() {
            let mut link = InputLink::new(&mut self.wm, self.links.input, self.stats.cycles);
            let result = adapter.input(&mut link);
            self.io = Some(adapter);
            result?;
        }
        self.apply_changes()
    }

    fn run_output(&mut self, report: &mut StepReport) -> EngineResult<()> {
        let reachable = self.wm.reachable_from(&[self.links.output]);
        let current: AHashSet<Timetag> =
            self.wm.wmes().filter(|w| reachable.contains(&w.id)).map(|w| w.timetag).collect();
        let mut added: Vec<Timetag> = current.difference(&self.last_output).copied().collect();
        let mut removed: Vec<Timetag> = self.last_output.difference(&current).copied().collect();
        added.sort();
        removed.sort();
        let produced = !added.is_empty() || !removed.is_empty();

        if let Some(mut adapter) = self.io.take() {
            adapter.output(&OutputView::new(&self.wm, self.links.output, added, removed));
            self.io = Some(adapter);
        }
        self.last_output = current;
        if produced {
            self.stats.output_cycles += 1;
            self.stats.nil_output_streak = 0;
        } else {
            self.stats.nil_output_streak += 1;
        }
        report.produced_output = produced;
        self.apply_changes()
    }
}

#[cfg(test)]
mod tests;
