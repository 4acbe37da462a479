use super::*;
use crate::decide::ImpasseKind;
use crate::io::OutputFact;
use crate::preference::PreferenceKind;
use crate::production::{Action, Condition, Pattern, ProductionKind, RhsValue, Test};
use crate::trace::{DecisionOutcome, RecordingSink};
use quiesce_types::{Constant, Symbol};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// FIXTURES
// ============================================================================

fn agent_with(params: ParamTable) -> Agent {
    Agent::new("test", Arc::new(SymbolTable::new()), Arc::new(TimetagSource::new()), params).unwrap()
}

fn agent() -> Agent {
    agent_with(ParamTable::new())
}

fn run_cycles(agent: &mut Agent, cycles: u64) {
    let target = agent.stats().cycles + cycles;
    while agent.stats().cycles < target && !agent.is_halted() {
        agent.step();
    }
}

fn run_to(agent: &mut Agent, phase: Phase) {
    while !agent.is_halted() && !(agent.phase() == phase && agent.at_phase_boundary()) {
        agent.step();
    }
}

fn values(agent: &Agent, id: IdHandle, attr: &str) -> Vec<String> {
    let Some(attr) = agent.symbols().find(&Constant::from(attr)) else {
        return Vec::new();
    };
    let wm = agent.working_memory();
    wm.values_of(id, Symbol::Const(attr)).into_iter().map(|v| wm.display(v)).collect()
}

fn state(id: &str, attr: &str, value: Test) -> Condition {
    Condition::Positive(Pattern::new(Test::goal(id), Test::constant(attr), value))
}

fn pos(id: &str, attr: &str, value: Test) -> Condition {
    Condition::Positive(Pattern::triple(id, attr, value))
}

fn acceptable(id: &str, attr: &str, value: Test) -> Condition {
    Condition::Positive(Pattern::triple(id, attr, value).acceptable())
}

fn make(id: &str, attr: &str, value: RhsValue) -> Action {
    Action::make(id, attr, value, PreferenceKind::Acceptable)
}

/// Proposes `go` on the top state until `^done yes` appears; applying it writes `^done yes`
fn go_rules() -> Vec<Production> {
    vec![
        Production::new(
            "propose*go",
            vec![
                state("s", "superstate", Test::constant("nil")),
                Condition::Negative(Pattern::triple("s", "done", Test::constant("yes"))),
            ],
            vec![make("s", "operator", RhsValue::var("o")), make("o", "name", RhsValue::constant("go"))],
        ),
        Production::new(
            "apply*go",
            vec![state("s", "operator", Test::var("o")), pos("o", "name", Test::constant("go"))],
            vec![make("s", "done", RhsValue::constant("yes"))],
        ),
    ]
}

/// Input adapter that keeps `(input-link ^attr yes)` present while its flag is raised
struct Toggle {
    attr: &'static str,
    on: Arc<AtomicBool>,
}

impl IoAdapter for Toggle {
    fn input(&mut self, link: &mut InputLink<'_>) -> EngineResult<()> {
        let root = link.root();
        let present = link.values(root, self.attr);
        if self.on.load(Ordering::SeqCst) {
            if present.is_empty() {
                link.add(root, self.attr, "yes")?;
            }
        } else {
            for (timetag, _) in present {
                link.remove(timetag)?;
            }
        }
        Ok(())
    }

    fn output(&mut self, _view: &OutputView<'_>) {}
}

/// Output adapter that records what it was shown
#[derive(Clone, Default)]
struct Recorder {
    added: Arc<Mutex<Vec<OutputFact>>>,
}

impl IoAdapter for Recorder {
    fn input(&mut self, _link: &mut InputLink<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn output(&mut self, view: &OutputView<'_>) {
        self.added.lock().unwrap().extend(view.added());
    }
}

// ============================================================================
// GOALS AND DECISIONS
// ============================================================================

#[test]
fn test_new_agent_has_top_state_and_io_links() {
    let agent = agent();
    assert_eq!(agent.goals().len(), 1);
    let top = agent.top_goal();
    assert_eq!(agent.working_memory().name_of(top), "S1");
    assert_eq!(values(&agent, top, "superstate"), vec!["nil"]);
    assert_eq!(values(&agent, top, "type"), vec!["state"]);

    let links = agent.io_links();
    assert_eq!(values(&agent, links.io, "input-link").len(), 1);
    assert_eq!(agent.working_memory().level_of(links.output), Some(1));
}

#[test]
fn test_operator_selected_then_applied() {
    let mut agent = agent();
    for rule in go_rules() {
        agent.add_production(rule).unwrap();
    }
    let top = agent.top_goal();

    run_to(&mut agent, Phase::Apply);
    let selected = agent.goals()[0].selected().expect("operator selected");
    let operator = selected.as_ident().unwrap();
    assert_eq!(values(&agent, operator, "name"), vec!["go"]);
    assert_eq!(agent.stats().decisions, 1);

    run_cycles(&mut agent, 1);
    assert_eq!(values(&agent, top, "done"), vec!["yes"]);
}

#[test]
fn test_persistent_result_survives_its_proposal() {
    let mut agent = agent();
    for rule in go_rules() {
        agent.add_production(rule).unwrap();
    }
    let top = agent.top_goal();

    run_cycles(&mut agent, 2);
    // The proposal retracted, so the second decision withdrew the operator
    assert_eq!(agent.goals()[0].selected(), None);
    assert_eq!(values(&agent, top, "done"), vec!["yes"]);
    assert!(agent.firing_stats().retracted >= 1);

    run_cycles(&mut agent, 1);
    assert_eq!(agent.goals().len(), 2);
    assert_eq!(agent.goals()[1].impasse, Some(ImpasseKind::StateNoChange));
    assert_eq!(values(&agent, top, "done"), vec!["yes"]);
}

#[test]
fn test_operator_that_changes_nothing_impasses() {
    let mut agent = agent();
    agent
        .add_production(Production::new(
            "propose*wait",
            vec![state("s", "superstate", Test::constant("nil"))],
            vec![make("s", "operator", RhsValue::var("o")), make("o", "name", RhsValue::constant("wait"))],
        ))
        .unwrap();

    run_cycles(&mut agent, 2);
    let goals = agent.goals();
    assert_eq!(goals.len(), 2);
    assert_eq!(goals[1].impasse, Some(ImpasseKind::OperatorNoChange));
    assert_eq!(goals[1].level, 2);
    assert_eq!(goals[1].items, vec![goals[0].selected().unwrap()]);
}

#[test]
fn test_empty_agent_stacks_state_no_change() {
    let mut agent = agent();
    run_cycles(&mut agent, 2);
    let goals = agent.goals();
    assert_eq!(goals.len(), 3);
    assert!(goals[1..].iter().all(|g| g.impasse == Some(ImpasseKind::StateNoChange)));
    assert_eq!(goals[2].level, 3);
    let sub = goals[1].id;
    assert_eq!(values(&agent, sub, "quiescence"), vec!["t"]);
    assert_eq!(values(&agent, sub, "impasse"), vec!["no-change"]);
    assert_eq!(values(&agent, sub, "attribute"), vec!["state"]);
}

#[test]
fn test_goal_depth_limit_halts_only_the_agent() {
    let mut params = ParamTable::new();
    params.set(Param::MaxGoalDepth, ParamValue::Int(2)).unwrap();
    let mut agent = agent_with(params);
    run_cycles(&mut agent, 3);
    assert!(agent.is_halted());
    assert!(agent.halt_reason().unwrap().contains("resource_exhaustion"));
    assert_eq!(agent.goals().len(), 2);
}

#[test]
fn test_conflict_impasse_and_recovery() {
    let mut agent = agent();
    let on = Arc::new(AtomicBool::new(true));
    agent.set_io(Box::new(Toggle { attr: "conflict", on: on.clone() }));
    agent
        .add_production(Production::new(
            "propose*both",
            vec![state("s", "superstate", Test::constant("nil"))],
            vec![
                make("s", "operator", RhsValue::var("a")),
                make("a", "name", RhsValue::constant("a")),
                make("s", "operator", RhsValue::var("b")),
                make("b", "name", RhsValue::constant("b")),
                Action::make_binary("s", "operator", RhsValue::var("a"), PreferenceKind::Better, RhsValue::var("b")),
            ],
        ))
        .unwrap();
    agent
        .add_production(Production::new(
            "prefer*b",
            vec![
                state("s", "io", Test::var("io")),
                pos("io", "input-link", Test::var("in")),
                pos("in", "conflict", Test::constant("yes")),
                acceptable("s", "operator", Test::var("a")),
                pos("a", "name", Test::constant("a")),
                acceptable("s", "operator", Test::var("b")),
                pos("b", "name", Test::constant("b")),
            ],
            vec![Action::make_binary(
                "s",
                "operator",
                RhsValue::var("b"),
                PreferenceKind::Better,
                RhsValue::var("a"),
            )],
        ))
        .unwrap();

    run_cycles(&mut agent, 1);
    assert_eq!(agent.goals().len(), 2);
    assert_eq!(agent.stats().subgoals, 1);
    let subgoal = agent.goals()[1].clone();
    assert_eq!(subgoal.impasse, Some(ImpasseKind::Conflict));
    assert_eq!(subgoal.level, 2);
    assert_eq!(subgoal.items.len(), 2);
    assert_eq!(agent.goals()[0].selected(), None);

    on.store(false, Ordering::SeqCst);
    run_to(&mut agent, Phase::Apply);
    assert_eq!(agent.goals().len(), 1);
    let chosen = agent.goals()[0].selected().unwrap().as_ident().unwrap();
    assert_eq!(values(&agent, chosen, "name"), vec!["a"]);

    run_to(&mut agent, Phase::Input);
    assert!(!agent.working_memory().is_live(subgoal.id));
}

#[test]
fn test_decisions_reach_trace_sinks() {
    let mut params = ParamTable::new();
    params.set(Param::TraceLevel, ParamValue::Int(2)).unwrap();
    let mut agent = agent_with(params);
    for rule in go_rules() {
        agent.add_production(rule).unwrap();
    }
    let sink = RecordingSink::new();
    agent.add_trace_sink(Box::new(sink.clone()));

    run_cycles(&mut agent, 1);
    let decisions: Vec<DecisionOutcome> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TraceEvent::Decision { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(decisions.len(), 1);
    assert!(matches!(&decisions[0], DecisionOutcome::Selected { operator } if operator.starts_with('O')));
    // Firings sit below the configured level
    assert!(!sink.events().iter().any(|e| matches!(e, TraceEvent::Fired { .. })));
}

// ============================================================================
// SUPPORT, I/O AND HALTING
// ============================================================================

#[test]
fn test_elaboration_follows_input() {
    let mut agent = agent();
    let on = Arc::new(AtomicBool::new(true));
    agent.set_io(Box::new(Toggle { attr: "light", on: on.clone() }));
    agent
        .add_production(Production::new(
            "elaborate*lit",
            vec![
                state("s", "io", Test::var("io")),
                pos("io", "input-link", Test::var("in")),
                pos("in", "light", Test::constant("yes")),
            ],
            vec![make("s", "lit", RhsValue::constant("yes"))],
        ))
        .unwrap();
    let top = agent.top_goal();

    run_to(&mut agent, Phase::Decide);
    assert_eq!(values(&agent, top, "lit"), vec!["yes"]);

    on.store(false, Ordering::SeqCst);
    run_cycles(&mut agent, 1);
    run_to(&mut agent, Phase::Decide);
    assert!(values(&agent, top, "lit").is_empty());
    let stats = agent.firing_stats();
    assert_eq!(stats.fired, 1);
    assert_eq!(stats.retracted, 1);
    assert_eq!(stats.live, 0);
}

#[test]
fn test_output_link_changes_are_reported() {
    let mut agent = agent();
    let recorder = Recorder::default();
    agent.set_io(Box::new(recorder.clone()));
    agent
        .add_production(Production::new(
            "output*move",
            vec![state("s", "io", Test::var("io")), pos("io", "output-link", Test::var("out"))],
            vec![make("out", "move", RhsValue::constant("up"))],
        ))
        .unwrap();

    run_cycles(&mut agent, 1);
    let added = recorder.added.lock().unwrap().clone();
    assert_eq!(added.len(), 1);
    assert_eq!((added[0].attr.as_str(), added[0].value.as_str()), ("move", "up"));
    assert_eq!(agent.stats().output_cycles, 1);
    assert_eq!(agent.stats().nil_output_streak, 0);

    run_cycles(&mut agent, 2);
    assert_eq!(agent.stats().output_cycles, 1);
    assert_eq!(agent.stats().nil_output_streak, 2);
}

#[test]
fn test_halt_action_stops_at_phase_end() {
    let mut agent = agent();
    agent
        .add_production(Production::new("stop", vec![state("s", "superstate", Test::constant("nil"))], vec![
            Action::Halt,
        ]))
        .unwrap();

    run_cycles(&mut agent, 1);
    assert!(agent.is_halted());
    assert_eq!(agent.phase(), Phase::Decide);
    assert_eq!(agent.halt_reason(), Some("halt action"));
    assert!(agent.step().halted);
}

#[test]
fn test_elaboration_limit_cuts_phase_short() {
    let mut params = ParamTable::new();
    params.set(Param::MaxElaborations, ParamValue::Int(1)).unwrap();
    let mut agent = agent_with(params);
    agent
        .add_production(Production::new(
            "first",
            vec![state("s", "superstate", Test::constant("nil"))],
            vec![make("s", "step", RhsValue::constant(1i64))],
        ))
        .unwrap();
    agent
        .add_production(Production::new(
            "second",
            vec![state("s", "step", Test::constant(1i64))],
            vec![make("s", "step", RhsValue::constant(2i64))],
        ))
        .unwrap();

    agent.step(); // input
    let report = agent.step();
    assert!(report.elaborated);
    assert!(report.phase_ended);
    assert_eq!(agent.phase(), Phase::Decide);
    assert_eq!(agent.network().pending_assertions().len(), 1);
}

// ============================================================================
// LEARNING
// ============================================================================

/// A no-change subgoal answers a question for the top state; the answer
/// then lets the top state propose an operator, which removes the subgoal
fn answering_rules() -> Vec<Production> {
    vec![
        Production::new(
            "answer",
            vec![
                state("s", "impasse", Test::constant("no-change")),
                pos("s", "superstate", Test::var("ss")),
                pos("ss", "type", Test::constant("state")),
            ],
            vec![make("ss", "answer", RhsValue::constant(42i64))],
        ),
        Production::new(
            "propose*use-answer",
            vec![state("s", "superstate", Test::constant("nil")), pos("s", "answer", Test::constant(42i64))],
            vec![make("s", "operator", RhsValue::var("o"))],
        ),
    ]
}

#[test]
fn test_result_outlives_subgoal_through_justification() {
    let mut agent = agent();
    for rule in answering_rules() {
        agent.add_production(rule).unwrap();
    }
    let top = agent.top_goal();

    run_cycles(&mut agent, 1);
    assert_eq!(agent.goals().len(), 2);
    assert_eq!(agent.stats().justifications, 1);
    let id = agent.network().find_production("justification-1").expect("justification added");
    assert_eq!(agent.network().production(id).unwrap().production.kind, ProductionKind::Justification);

    run_to(&mut agent, Phase::Apply);
    assert_eq!(agent.goals().len(), 1);
    assert!(agent.goals()[0].selected().is_some());
    assert_eq!(values(&agent, top, "answer"), vec!["42"]);
    assert!(agent.save_network().is_err());
}

#[test]
fn test_learning_builds_reloadable_chunk() {
    let mut params = ParamTable::new();
    params.set(Param::Learning, ParamValue::Bool(true)).unwrap();
    let mut agent = agent_with(params);
    for rule in answering_rules() {
        agent.add_production(rule).unwrap();
    }
    let top = agent.top_goal();

    run_cycles(&mut agent, 2);
    assert_eq!(agent.stats().chunks, 1);
    assert_eq!(values(&agent, top, "answer"), vec!["42"]);

    let image = agent.save_network().unwrap();
    assert!(image.rule_names().any(|name| name == "chunk-1"));

    let mut fresh = agent_with(ParamTable::new());
    fresh.load_network(image).unwrap();
    assert_eq!(fresh.network().production_count(), 3);
}
