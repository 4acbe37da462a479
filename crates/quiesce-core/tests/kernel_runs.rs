//! Multi-agent runs through the public kernel API

use quiesce_core::{
    Action, Condition, DecisionOutcome, EngineError, EngineResult, InputLink, IoAdapter, Kernel, KernelConfig, OutputView, Param,
    ParamTable, ParamValue, Pattern, PreferenceKind, Production, RecordingSink, RhsValue, RunOutcome, StepUnit, Test,
    TraceEvent,
};

fn decisions_params() -> ParamTable {
    let mut params = ParamTable::new();
    params.set(Param::TraceLevel, ParamValue::Int(2)).unwrap();
    params
}

fn state(id: &str, attr: &str, value: Test) -> Condition {
    Condition::Positive(Pattern::new(Test::goal(id), Test::constant(attr), value))
}

fn pos(id: &str, attr: &str, value: Test) -> Condition {
    Condition::Positive(Pattern::triple(id, attr, value))
}

fn decisions(sink: &RecordingSink) -> Vec<(String, DecisionOutcome)> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            TraceEvent::Decision { agent, outcome, .. } => Some((agent, outcome)),
            _ => None,
        })
        .collect()
}

/// Replaces `(input-link ^tick N)` with the current cycle number every input phase
struct Ticker;

impl IoAdapter for Ticker {
    fn input(&mut self, link: &mut InputLink<'_>) -> EngineResult<()> {
        let root = link.root();
        for (timetag, _) in link.values(root, "tick") {
            link.remove(timetag)?;
        }
        let cycle = link.cycle() as i64;
        link.add(root, "tick", cycle)?;
        Ok(())
    }

    fn output(&mut self, _view: &OutputView<'_>) {}
}

/// Three mutually indifferent operators, proposed afresh on every tick
fn propose_on_tick() -> Production {
    let mut actions = Vec::new();
    for var in ["a", "b", "c"] {
        actions.push(Action::make("s", "operator", RhsValue::var(var), PreferenceKind::Acceptable));
        actions.push(Action::make("s", "operator", RhsValue::var(var), PreferenceKind::UnaryIndifferent));
        actions.push(Action::make(var, "name", RhsValue::constant(var), PreferenceKind::Acceptable));
    }
    Production::new(
        "propose*on-tick",
        vec![
            state("s", "io", Test::var("io")),
            pos("io", "input-link", Test::var("in")),
            pos("in", "tick", Test::var("t")),
        ],
        actions,
    )
}

fn halt_rule() -> Production {
    Production::new("stop", vec![state("s", "superstate", Test::constant("nil"))], vec![Action::Halt])
}

#[test]
fn test_agents_alternate_by_phase() {
    let mut kernel = Kernel::new();
    let sink = RecordingSink::new();
    for name in ["left", "right"] {
        let agent = kernel.create_agent(name, decisions_params()).unwrap();
        agent.add_trace_sink(Box::new(sink.clone()));
    }

    let outcome = kernel.run(StepUnit::Decision, 3, StepUnit::Phase, false);
    assert_eq!(outcome, RunOutcome::Completed);

    let order: Vec<String> = decisions(&sink).into_iter().map(|(agent, _)| agent).collect();
    assert_eq!(order, vec!["left", "right", "left", "right", "left", "right"]);
    for agent in kernel.agents() {
        assert_eq!(agent.stats().decisions, 3);
        assert_eq!(agent.stats().cycles, 3);
    }
}

#[test]
fn test_halted_agent_leaves_others_running() {
    let mut kernel = Kernel::new();
    kernel.create_agent("quitter", ParamTable::new()).unwrap().add_production(halt_rule()).unwrap();
    kernel.create_agent("worker", ParamTable::new()).unwrap();

    let outcome = kernel.run(StepUnit::Decision, 3, StepUnit::Phase, false);
    assert_eq!(outcome, RunOutcome::Halted);
    assert!(kernel.any_agent_halted());
    assert!(kernel.agent("quitter").unwrap().is_halted());
    assert_eq!(kernel.agent("worker").unwrap().stats().decisions, 3);

    // A halted agent sits out later runs
    let outcome = kernel.run(StepUnit::Decision, 1, StepUnit::Phase, false);
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(kernel.agent("worker").unwrap().stats().decisions, 4);
}

#[test]
fn test_goal_stack_overflow_halts_only_its_agent() {
    let mut kernel = Kernel::new();
    let sink = RecordingSink::new();
    let mut shallow = ParamTable::new();
    shallow.set(Param::MaxGoalDepth, ParamValue::Int(2)).unwrap();
    kernel.create_agent("shallow", shallow).unwrap().add_trace_sink(Box::new(sink.clone()));
    kernel.create_agent("deep", ParamTable::new()).unwrap();

    // Each empty cycle stacks another state no-change subgoal
    let outcome = kernel.run(StepUnit::Decision, 4, StepUnit::Phase, false);
    assert_eq!(outcome, RunOutcome::Halted);

    let shallow = kernel.agent("shallow").unwrap();
    assert!(shallow.is_halted());
    let reason = shallow.halt_reason().unwrap();
    assert!(reason.contains("goal-stack depth exceeded limit 2"), "{reason}");
    assert!(reason.contains("resource_exhaustion"), "{reason}");
    assert_eq!(shallow.goals().len(), 2);
    assert_eq!(shallow.stats().decisions, 1);
    assert!(sink.events().iter().any(|event| matches!(event, TraceEvent::AgentHalted { agent, .. } if agent == "shallow")));

    let deep = kernel.agent("deep").unwrap();
    assert!(!deep.is_halted());
    assert_eq!(deep.stats().decisions, 4);
    assert_eq!(deep.goals().len(), 5);
}

#[test]
fn test_justification_blocks_network_save() {
    let mut kernel = Kernel::new();
    let agent = kernel.create_agent("solver", ParamTable::new()).unwrap();
    agent
        .add_production(Production::new(
            "answer",
            vec![
                state("s", "impasse", Test::constant("no-change")),
                pos("s", "superstate", Test::var("ss")),
                pos("ss", "type", Test::constant("state")),
            ],
            vec![Action::make("ss", "answer", RhsValue::constant(42i64), PreferenceKind::Acceptable)],
        ))
        .unwrap();
    assert!(agent.save_network().is_ok());

    assert_eq!(kernel.run(StepUnit::Decision, 1, StepUnit::Phase, false), RunOutcome::Completed);
    let agent = kernel.agent_mut("solver").unwrap();
    assert_eq!(agent.stats().justifications, 1);
    match agent.save_network() {
        Err(EngineError::Persistence { message }) => assert!(message.contains("justification-1"), "{message}"),
        other => panic!("expected a persistence error, got {other:?}"),
    }

    agent.remove_production("justification-1").unwrap();
    assert!(agent.save_network().is_ok());
}

#[test]
fn test_seeded_random_selection_is_repeatable() {
    let config = KernelConfig::from_toml_str(
        r#"
        [[agent]]
        name = "chooser"
        trace-level = 2
        selection = "random"
        seed = 7
        "#,
    )
    .unwrap();

    let trace_of = |config: &KernelConfig| {
        let mut kernel = Kernel::from_config(config).unwrap();
        let sink = RecordingSink::new();
        let agent = kernel.agent_mut("chooser").unwrap();
        agent.set_io(Box::new(Ticker));
        agent.add_production(propose_on_tick()).unwrap();
        agent.add_trace_sink(Box::new(sink.clone()));
        assert_eq!(kernel.run(StepUnit::Decision, 12, StepUnit::Decision, false), RunOutcome::Completed);
        decisions(&sink)
    };

    let first = trace_of(&config);
    let second = trace_of(&config);
    assert_eq!(first.len(), 12);
    assert!(first.iter().all(|(_, outcome)| matches!(outcome, DecisionOutcome::Selected { .. })));
    assert_eq!(first, second);
}

#[test]
fn test_retired_operators_are_reclaimed() {
    let mut kernel = Kernel::new();
    let agent = kernel.create_agent("ticker", ParamTable::new()).unwrap();
    agent.set_io(Box::new(Ticker));
    agent.add_production(propose_on_tick()).unwrap();

    kernel.run(StepUnit::Decision, 3, StepUnit::Decision, false);
    let settled = kernel.agent("ticker").unwrap().working_memory().identifier_count();
    kernel.run(StepUnit::Decision, 5, StepUnit::Decision, false);
    let agent = kernel.agent("ticker").unwrap();
    assert_eq!(agent.working_memory().identifier_count(), settled);
    assert_eq!(agent.firing_stats().live, 1);
    assert_eq!(agent.goals().len(), 1);
}

#[test]
fn test_saved_network_loads_from_config() {
    let mut source = Kernel::new();
    let agent = source.create_agent("author", ParamTable::new()).unwrap();
    agent
        .add_production(Production::new(
            "propose*go",
            vec![
                state("s", "superstate", Test::constant("nil")),
                Condition::Negative(Pattern::triple("s", "done", Test::constant("yes"))),
            ],
            vec![
                Action::make("s", "operator", RhsValue::var("o"), PreferenceKind::Acceptable),
                Action::make("o", "name", RhsValue::constant("go"), PreferenceKind::Acceptable),
            ],
        ))
        .unwrap();
    agent
        .add_production(Production::new(
            "apply*go",
            vec![state("s", "operator", Test::var("o")), pos("o", "name", Test::constant("go"))],
            vec![Action::make("s", "done", RhsValue::constant("yes"), PreferenceKind::Acceptable)],
        ))
        .unwrap();

    let path = std::env::temp_dir().join(format!("quiesce-image-{}.bin", std::process::id()));
    agent.save_network().unwrap().write_to(&path).unwrap();

    let config = KernelConfig::from_toml_str(&format!(
        "[[agent]]\nname = \"reader\"\nnetwork-image = '{}'\n",
        path.display()
    ))
    .unwrap();
    let mut kernel = Kernel::from_config(&config).unwrap();
    std::fs::remove_file(&path).unwrap();

    let reader = kernel.agent("reader").unwrap();
    assert_eq!(reader.network().production_count(), 2);
    assert_eq!(kernel.run(StepUnit::Decision, 1, StepUnit::Phase, false), RunOutcome::Completed);

    let reader = kernel.agent("reader").unwrap();
    let top = reader.top_goal();
    let done = reader.symbols().find(&"done".into()).unwrap();
    let values = reader.working_memory().values_of(top, quiesce_core::Symbol::Const(done));
    assert_eq!(values.len(), 1);
}

#[test]
fn test_duplicate_agent_names_are_rejected() {
    let err = KernelConfig::from_toml_str("[[agent]]\nname = \"twin\"\n[[agent]]\nname = \"twin\"\n").unwrap_err();
    assert_eq!(err.category(), "configuration");

    let mut kernel = Kernel::new();
    kernel.create_agent("solo", ParamTable::new()).unwrap();
    assert!(kernel.create_agent("solo", ParamTable::new()).is_err());
    assert!(kernel.schedule("ghost", false).is_err());
}
