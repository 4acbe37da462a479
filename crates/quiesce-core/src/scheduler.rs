//! Phase machine vocabulary and the multi-agent kernel
//!
//! The kernel owns every agent of a process, the shared symbol table and
//! the shared timetag counter. [`Kernel::run`] drives the scheduled agents
//! round-robin on the calling thread; nothing runs in parallel.

use crate::agent::{Agent, AgentReport, StepReport};
use crate::config::{KernelConfig, RunConfig};
use crate::error::{EngineError, EngineResult};
use crate::params::ParamTable;
use crate::rete::NetworkImage;
use quiesce_types::{SymbolTable, TimetagSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Input,
    Propose,
    Decide,
    Apply,
    Output,
}

impl Phase {
    pub const COUNT: usize = 5;
    pub const ALL: [Phase; Phase::COUNT] = [Phase::Input, Phase::Propose, Phase::Decide, Phase::Apply, Phase::Output];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn next(self) -> Phase {
        match self {
            Phase::Input => Phase::Propose,
            Phase::Propose => Phase::Decide,
            Phase::Decide => Phase::Apply,
            Phase::Apply => Phase::Output,
            Phase::Output => Phase::Input,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Phase::Input => "input",
            Phase::Propose => "propose",
            Phase::Decide => "decide",
            Phase::Apply => "apply",
            Phase::Output => "output",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    Running(Phase),
    /// A rule asked to halt; takes effect when the current phase ends
    HaltRequested,
    Halted,
}

/// Granularity of a run, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepUnit {
    Phase,
    Elaboration,
    /// A whole decision cycle, counted when its output phase ends. A run
    /// started mid-cycle first finishes the cycle in progress.
    Decision,
    /// A decision cycle whose output phase changed the output link
    Output,
    Forever,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Completed,
    Halted,
    Interrupted,
    /// Every agent went `max-nil-output-cycles` cycles without output
    NoOutput,
}

impl StepReport {
    /// Whether this step finished one `unit`
    pub fn completes(&self, unit: StepUnit) -> bool {
        match unit {
            StepUnit::Phase => self.phase_ended,
            StepUnit::Elaboration => true,
            StepUnit::Decision => self.cycle_completed,
            StepUnit::Output => self.cycle_completed && self.produced_output,
            StepUnit::Forever => false,
        }
    }
}

// ============================================================================
// KERNEL
// ============================================================================

pub struct Kernel {
    symbols: Arc<SymbolTable>,
    timetags: Arc<TimetagSource>,
    agents: Vec<Agent>,
    /// Scheduling wishes, applied when the next run starts
    scheduled: Vec<bool>,
    interrupt: Arc<AtomicBool>,
    last_run_halted: bool,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            symbols: Arc::new(SymbolTable::new()),
            timetags: Arc::new(TimetagSource::new()),
            agents: Vec::new(),
            scheduled: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            last_run_halted: false,
        }
    }

    /// Build every configured agent and load its saved network, if any
    pub fn from_config(config: &KernelConfig) -> EngineResult<Self> {
        let mut kernel = Self::new();
        for agent_config in &config.agents {
            let mut agent = Agent::from_config(agent_config, kernel.symbols.clone(), kernel.timetags.clone())?;
            if let Some(path) = &agent_config.network_image {
                agent.load_network(NetworkImage::read_from(path)?)?;
                info!(agent = %agent.name(), path = %path.display(), "network image loaded");
            }
            kernel.insert_agent(agent)?;
        }
        Ok(kernel)
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn create_agent(&mut self, name: &str, params: ParamTable) -> EngineResult<&mut Agent> {
        let agent = Agent::new(name, self.symbols.clone(), self.timetags.clone(), params)?;
        self.insert_agent(agent)
    }

    fn insert_agent(&mut self, agent: Agent) -> EngineResult<&mut Agent> {
        if self.agents.iter().any(|a| a.name() == agent.name()) {
            return Err(EngineError::configuration(format!("agent '{}' already exists", agent.name())));
        }
        self.agents.push(agent);
        self.scheduled.push(true);
        let index = self.agents.len() - 1;
        Ok(&mut self.agents[index])
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name() == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.name() == name)
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn reports(&self) -> Vec<AgentReport> {
        self.agents.iter().map(Agent::report).collect()
    }

    /// Include or exclude an agent from the next run
    pub fn schedule(&mut self, name: &str, scheduled: bool) -> EngineResult<()> {
        let index = self
            .agents
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| EngineError::UnknownAgent { name: name.to_string() })?;
        self.scheduled[index] = scheduled;
        Ok(())
    }

    pub fn schedule_all(&mut self, scheduled: bool) {
        self.scheduled.iter_mut().for_each(|s| *s = scheduled);
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.agents.iter().zip(&self.scheduled).any(|(a, s)| *s && a.name() == name)
    }

    /// Flag another thread can raise to stop the run at the next phase boundary
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn any_agent_halted(&self) -> bool {
        self.last_run_halted || self.agents.iter().any(Agent::is_halted)
    }

    pub fn run_config(&mut self, config: &RunConfig) -> RunOutcome {
        self.run(config.step_unit, config.count, config.interleave_unit, config.synchronize)
    }

    /// Run every scheduled agent until each has completed `count` units of
    /// `step`, taking turns of at most one `interleave` unit each
    #[instrument(skip(self), fields(agents = self.agents.len()))]
    pub fn run(&mut self, step: StepUnit, count: u64, interleave: StepUnit, synchronize: bool) -> RunOutcome {
        let interleave = interleave.min(step);
        self.interrupt.store(false, Ordering::SeqCst);
        self.last_run_halted = false;

        let active: Vec<usize> = (0..self.agents.len())
            .filter(|&i| self.scheduled[i] && !self.agents[i].is_halted())
            .collect();
        if active.is_empty() || (count == 0 && step != StepUnit::Forever) {
            return RunOutcome::Completed;
        }
        for &i in &active {
            self.agents[i].begin_run();
        }
        if synchronize {
            for &i in &active {
                Self::synchronize(&mut self.agents[i]);
            }
        }

        let mut done = vec![0u64; self.agents.len()];
        let mut finished = vec![false; self.agents.len()];
        let mut halted = false;
        let mut outcome = None;

        'rounds: while active.iter().any(|&i| !finished[i]) {
            for &i in &active {
                if finished[i] {
                    continue;
                }
                loop {
                    let agent = &mut self.agents[i];
                    if agent.is_halted() {
                        finished[i] = true;
                        break;
                    }
                    if agent.at_phase_boundary() && self.interrupt.load(Ordering::SeqCst) {
                        outcome = Some(RunOutcome::Interrupted);
                        break 'rounds;
                    }
                    let report = agent.step();
                    if report.completes(step) {
                        done[i] += 1;
                    }
                    if report.halted {
                        warn!(agent = %agent.name(), reason = agent.halt_reason().unwrap_or(""), "agent halted during run");
                        halted = true;
                        finished[i] = true;
                        break;
                    }
                    if step != StepUnit::Forever && done[i] >= count {
                        finished[i] = true;
                        break;
                    }
                    if step == StepUnit::Forever && report.cycle_completed && self.all_quiet(&active) {
                        outcome = Some(RunOutcome::NoOutput);
                        break 'rounds;
                    }
                    if report.completes(interleave) {
                        break;
                    }
                }
            }
        }

        for &i in &active {
            self.agents[i].end_run();
        }
        self.last_run_halted = halted;
        let outcome = outcome.unwrap_or(if halted { RunOutcome::Halted } else { RunOutcome::Completed });
        let outcome = match outcome {
            RunOutcome::NoOutput | RunOutcome::Completed if halted => RunOutcome::Halted,
            other => other,
        };
        debug!(?outcome, "run finished");
        outcome
    }

    /// Step an agent to the start of its next Input phase
    fn synchronize(agent: &mut Agent) {
        while !agent.is_halted() && !(agent.phase() == Phase::Input && agent.at_phase_boundary()) {
            agent.step();
        }
    }

    /// Every live agent has gone its nil-output limit without output
    fn all_quiet(&self, active: &[usize]) -> bool {
        let mut live = active.iter().map(|&i| &self.agents[i]).filter(|a| !a.is_halted()).peekable();
        live.peek().is_some()
            && live.all(|a| a.stats().nil_output_streak >= a.params().max_nil_output_cycles())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("agents", &self.agents.iter().map(Agent::name).collect::<Vec<_>>())
            .field("scheduled", &self.scheduled)
            .finish()
    }
}
