//! Trace feed for telemetry and debugging tools
//!
//! Every event is mirrored to `tracing` and handed to the registered sinks,
//! provided the agent's `trace-level` parameter admits it.

use crate::decide::ImpasseKind;
use crate::params::TraceLevel;
use crate::preference::PreferenceKind;
use crate::scheduler::Phase;
use quiesce_types::Timetag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Selected { operator: String },
    Impasse { kind: ImpasseKind, items: usize },
    /// The selected operator lost its support and nothing replaced it
    Deselected { operator: String },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    PhaseStarted { agent: String, phase: Phase },
    PhaseEnded { agent: String, phase: Phase },
    Fired { agent: String, rule: String, level: usize, preferences: Vec<PreferenceKind> },
    Retracted { agent: String, rule: String, preferences: Vec<PreferenceKind> },
    Decision { agent: String, cycle: u64, goal: String, outcome: DecisionOutcome },
    SubgoalCreated { agent: String, goal: String, level: usize, impasse: ImpasseKind },
    GoalRemoved { agent: String, goal: String, level: usize },
    WmeAdded { agent: String, timetag: Timetag, fact: String },
    WmeRemoved { agent: String, timetag: Timetag },
    AgentHalted { agent: String, reason: String },
    Warning { agent: String, message: String },
}

impl TraceEvent {
    /// Least detailed trace level that still reports this event
    pub fn level(&self) -> TraceLevel {
        match self {
            TraceEvent::AgentHalted { .. } | TraceEvent::Warning { .. } => TraceLevel::Off,
            TraceEvent::PhaseStarted { .. } | TraceEvent::PhaseEnded { .. } => TraceLevel::Phases,
            TraceEvent::Decision { .. }
            | TraceEvent::SubgoalCreated { .. }
            | TraceEvent::GoalRemoved { .. } => TraceLevel::Decisions,
            TraceEvent::Fired { .. } | TraceEvent::Retracted { .. } => TraceLevel::Firings,
            TraceEvent::WmeAdded { .. } | TraceEvent::WmeRemoved { .. } => TraceLevel::Wmes,
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            TraceEvent::PhaseStarted { agent, .. }
            | TraceEvent::PhaseEnded { agent, .. }
            | TraceEvent::Fired { agent, .. }
            | TraceEvent::Retracted { agent, .. }
            | TraceEvent::Decision { agent, .. }
            | TraceEvent::SubgoalCreated { agent, .. }
            | TraceEvent::GoalRemoved { agent, .. }
            | TraceEvent::WmeAdded { agent, .. }
            | TraceEvent::WmeRemoved { agent, .. }
            | TraceEvent::AgentHalted { agent, .. }
            | TraceEvent::Warning { agent, .. } => agent,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::PhaseStarted { phase, .. } => write!(f, "--- {phase} phase ---"),
            TraceEvent::PhaseEnded { phase, .. } => write!(f, "--- end of {phase} phase ---"),
            TraceEvent::Fired { rule, preferences, .. } => {
                write!(f, "Firing {rule}")?;
                for kind in preferences {
                    write!(f, " {}", kind.mark())?;
                }
                Ok(())
            }
            TraceEvent::Retracted { rule, .. } => write!(f, "Retracting {rule}"),
            TraceEvent::Decision { cycle, goal, outcome, .. } => match outcome {
                DecisionOutcome::Selected { operator } => write!(f, "{cycle}: {goal} O: {operator}"),
                DecisionOutcome::Impasse { kind, items } => {
                    write!(f, "{cycle}: {goal} ==> {} impasse ({items} items)", kind.name())
                }
                DecisionOutcome::Deselected { operator } => write!(f, "{cycle}: {goal} O: {operator} retracted"),
                DecisionOutcome::Unchanged => write!(f, "{cycle}: {goal} unchanged"),
            },
            TraceEvent::SubgoalCreated { goal, level, impasse, .. } => {
                write!(f, "==> {goal} ({} impasse, level {level})", impasse.name())
            }
            TraceEvent::GoalRemoved { goal, level, .. } => write!(f, "<== {goal} (level {level})"),
            TraceEvent::WmeAdded { timetag, fact, .. } => write!(f, "=>WM: ({timetag}: {fact})"),
            TraceEvent::WmeRemoved { timetag, .. } => write!(f, "<=WM: ({timetag})"),
            TraceEvent::AgentHalted { reason, .. } => write!(f, "halted: {reason}"),
            TraceEvent::Warning { message, .. } => write!(f, "warning: {message}"),
        }
    }
}

/// Receiver of trace events
pub trait TraceSink: Send {
    fn on_event(&mut self, event: &TraceEvent);
}

/// Sink that keeps every event, shareable with the code inspecting it
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl TraceSink for RecordingSink {
    fn on_event(&mut self, event: &TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[derive(Default)]
pub(crate) struct TraceFeed {
    sinks: Vec<Box<dyn TraceSink>>,
}

impl fmt::Debug for TraceFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceFeed").field("sinks", &self.sinks.len()).finish()
    }
}

impl TraceFeed {
    pub(crate) fn add_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sinks.push(sink);
    }

    pub(crate) fn emit(&mut self, level: TraceLevel, event: TraceEvent) {
        if event.level() > level {
            return;
        }
        let agent = event.agent();
        match &event {
            TraceEvent::AgentHalted { .. } => warn!(agent, event = %event, "agent halted"),
            TraceEvent::Warning { .. } => warn!(agent, event = %event, "engine warning"),
            TraceEvent::Decision { .. } | TraceEvent::SubgoalCreated { .. } | TraceEvent::GoalRemoved { .. } => {
                info!(agent, event = %event, "decision")
            }
            TraceEvent::PhaseStarted { .. } | TraceEvent::PhaseEnded { .. } => debug!(agent, event = %event, "phase"),
            _ => trace!(agent, event = %event, "match"),
        }
        for sink in &mut self.sinks {
            sink.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let recorder = RecordingSink::new();
        let mut feed = TraceFeed::default();
        feed.add_sink(Box::new(recorder.clone()));

        let phase = TraceEvent::PhaseStarted { agent: "a".into(), phase: Phase::Input };
        let wme = TraceEvent::WmeRemoved { agent: "a".into(), timetag: Timetag(4) };
        feed.emit(TraceLevel::Phases, phase.clone());
        feed.emit(TraceLevel::Phases, wme.clone());
        feed.emit(TraceLevel::Off, TraceEvent::Warning { agent: "a".into(), message: "w".into() });
        feed.emit(TraceLevel::Wmes, wme.clone());

        let events = recorder.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], phase);
        assert!(matches!(events[1], TraceEvent::Warning { .. }));
        assert_eq!(events[2], wme);
    }

    #[test]
    fn test_firing_display_lists_preference_marks() {
        let event = TraceEvent::Fired {
            agent: "a".into(),
            rule: "propose*move".into(),
            level: 1,
            preferences: vec![PreferenceKind::Acceptable, PreferenceKind::Better],
        };
        assert_eq!(event.to_string(), "Firing propose*move + >");
    }

    #[test]
    fn test_events_survive_json() {
        let event = TraceEvent::Decision {
            agent: "a".into(),
            cycle: 3,
            goal: "S1".into(),
            outcome: DecisionOutcome::Impasse { kind: ImpasseKind::Tie, items: 2 },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Decision\""));
        assert_eq!(serde_json::from_str::<TraceEvent>(&json).unwrap(), event);
    }
}
