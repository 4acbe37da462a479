use super::*;
use crate::error::Resource;
use crate::production::{Action, Condition, Operand, Pattern, RhsValue, Test};

struct Net {
    rete: Rete,
    symbols: Arc<SymbolTable>,
    next: u64,
}

impl Net {
    fn new() -> Self {
        let symbols = Arc::new(SymbolTable::new());
        Self { rete: Rete::new(symbols.clone()), symbols, next: 1 }
    }

    fn sym(&self, text: &str) -> Symbol {
        self.symbols.intern_symbol(text)
    }

    fn add(&mut self, id: u32, attr: &str, value: Symbol) -> Timetag {
        self.add_flagged(id, attr, value, false)
    }

    fn add_flagged(&mut self, id: u32, attr: &str, value: Symbol, goal: bool) -> Timetag {
        let timetag = Timetag(self.next);
        self.next += 1;
        let fields = [Symbol::Ident(IdHandle::new(id)), self.sym(attr), value];
        self.rete.add_wme(NetWme { timetag, fields, acceptable: false, id_is_goal: goal, id_is_impasse: false });
        timetag
    }

    fn rule(&mut self, name: &str, conditions: Vec<Condition>) -> ProductionId {
        let production = Production::new(
            name,
            conditions,
            vec![Action::make("s", "seen", RhsValue::constant("yes"), PreferenceKind::Acceptable)],
        );
        self.rete.add_production(production, None).unwrap().0
    }
}

fn ident(n: u32) -> Symbol {
    Symbol::Ident(IdHandle::new(n))
}

fn on_red_block() -> Vec<Condition> {
    vec![
        Condition::Positive(Pattern::triple("s", "on", Test::var("b"))),
        Condition::Positive(Pattern::triple("b", "color", Test::constant("red"))),
    ]
}

#[test]
fn test_join_completes_and_withdraws_unfired_match() {
    let mut net = Net::new();
    let id = net.rule("red-on", on_red_block());

    let on = net.add(1, "on", ident(2));
    assert!(net.rete.pending_assertions().is_empty());
    let red = net.sym("red");
    let color = net.add(2, "color", red);

    let pending = net.rete.pending_assertions().to_vec();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].production, id);
    assert_eq!(net.rete.token_wmes(pending[0].token), vec![Some(on), Some(color)]);

    net.rete.remove_wme(color).unwrap();
    assert!(net.rete.pending_assertions().is_empty());
    assert!(net.rete.pending_retractions().is_empty());
}

#[test]
fn test_fired_match_retracts_with_its_instantiation() {
    let mut net = Net::new();
    net.rule("red-on", on_red_block());
    let red = net.sym("red");
    net.add(1, "on", ident(2));
    let color = net.add(2, "color", red);

    let assertion = net.rete.take_assertions()[0];
    let inst = InstId(7);
    net.rete.bind_instantiation(assertion.token, inst);
    net.rete.remove_wme(color).unwrap();

    let retractions = net.rete.take_retractions();
    assert_eq!(retractions.len(), 1);
    assert_eq!(retractions[0].instantiation, inst);
}

#[test]
fn test_rule_added_late_sees_existing_facts() {
    let mut net = Net::new();
    let red = net.sym("red");
    net.add(1, "on", ident(2));
    net.add(1, "on", ident(3));
    net.add(2, "color", red);
    net.add(3, "color", red);

    let id = net.rule("red-on", on_red_block());
    assert_eq!(net.rete.matches_of(id).len(), 2);
    assert_eq!(net.rete.pending_assertions().len(), 2);
}

#[test]
fn test_negation_blocks_and_unblocks() {
    let mut net = Net::new();
    net.rule(
        "uncolored",
        vec![
            Condition::Positive(Pattern::triple("s", "block", Test::var("b"))),
            Condition::Negative(Pattern::triple("b", "color", Test::Blank)),
        ],
    );
    net.add(1, "block", ident(2));
    let pending = net.rete.pending_assertions().to_vec();
    assert_eq!(pending.len(), 1);
    assert_eq!(net.rete.token_wmes(pending[0].token).len(), 2);
    assert_eq!(net.rete.token_wmes(pending[0].token)[1], None);

    let blue = net.sym("blue");
    let color = net.add(2, "color", blue);
    assert!(net.rete.pending_assertions().is_empty());

    net.rete.remove_wme(color).unwrap();
    assert_eq!(net.rete.pending_assertions().len(), 1);
}

#[test]
fn test_conjunctive_negation() {
    let mut net = Net::new();
    net.rule(
        "no-red-child",
        vec![
            Condition::Positive(Pattern::triple("s", "block", Test::var("b"))),
            Condition::Conjunctive(vec![
                Condition::Positive(Pattern::triple("b", "child", Test::var("c"))),
                Condition::Positive(Pattern::triple("c", "color", Test::constant("red"))),
            ]),
        ],
    );
    net.add(1, "block", ident(2));
    assert_eq!(net.rete.pending_assertions().len(), 1);

    // A child alone does not block; a red child does
    net.add(2, "child", ident(3));
    assert_eq!(net.rete.pending_assertions().len(), 1);
    let red = net.sym("red");
    let color = net.add(3, "color", red);
    assert!(net.rete.pending_assertions().is_empty());

    net.rete.remove_wme(color).unwrap();
    assert_eq!(net.rete.pending_assertions().len(), 1);
}

#[test]
fn test_relational_test_on_numbers() {
    let mut net = Net::new();
    net.rule(
        "small",
        vec![
            Condition::Positive(Pattern::triple("s", "limit", Test::var("max"))),
            Condition::Positive(Pattern::triple(
                "s",
                "size",
                Test::Relation(Relation::Less, Operand::Var("max".to_string())),
            )),
        ],
    );
    let ten = net.symbols.intern_symbol(10i64);
    let three = net.symbols.intern_symbol(3i64);
    let twelve = net.symbols.intern_symbol(12.5f64);
    net.add(1, "limit", ten);
    net.add(1, "size", three);
    net.add(1, "size", twelve);
    assert_eq!(net.rete.pending_assertions().len(), 1);
}

#[test]
fn test_goal_test_requires_goal_identifier() {
    let mut net = Net::new();
    net.rule("on-goal", vec![Condition::Positive(Pattern::new(Test::goal("s"), Test::constant("name"), Test::Blank))]);
    let name = net.sym("blocks");
    net.add(1, "name", name);
    assert!(net.rete.pending_assertions().is_empty());
    net.add_flagged(2, "name", name, true);
    assert_eq!(net.rete.pending_assertions().len(), 1);
}

#[test]
fn test_shared_prefix_reuses_nodes() {
    let mut net = Net::new();
    let before = net.rete.stats().nodes;
    net.rule("first", on_red_block());
    let first_cost = net.rete.stats().nodes - before;

    let mut conditions = on_red_block();
    conditions[1] = Condition::Positive(Pattern::triple("b", "color", Test::constant("blue")));
    let before = net.rete.stats().nodes;
    net.rule("second", conditions);
    let second_cost = net.rete.stats().nodes - before;
    assert!(second_cost < first_cost);
}

#[test]
fn test_duplicate_rule_changes_nothing() {
    let mut net = Net::new();
    net.rule("first", on_red_block());
    let stats = net.rete.stats();

    let copy = Production::new(
        "copy",
        on_red_block(),
        vec![Action::make("s", "seen", RhsValue::constant("yes"), PreferenceKind::Acceptable)],
    );
    let err = net.rete.add_production(copy, None).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateRule { ref existing, .. } if existing == "first"));
    assert_eq!(net.rete.stats(), stats);
    assert!(net.rete.find_production("copy").is_none());
}

#[test]
fn test_malformed_rule_creates_no_nodes() {
    let mut net = Net::new();
    let stats = net.rete.stats();
    let bad = Production::new(
        "bad",
        vec![Condition::Negative(Pattern::triple("s", "on", Test::Blank))],
        vec![Action::Halt],
    );
    assert!(matches!(net.rete.add_production(bad, None), Err(EngineError::Structural { .. })));
    assert_eq!(net.rete.stats(), stats);
}

#[test]
fn test_node_budget_is_enforced() {
    let mut net = Net::new();
    net.rete.set_max_nodes(2);
    let production = Production::new(
        "too-big",
        on_red_block(),
        vec![Action::Halt],
    );
    let err = net.rete.add_production(production, None).unwrap_err();
    assert_eq!(err, EngineError::ResourceExhaustion { resource: Resource::NetworkNodes, limit: 2 });
    assert_eq!(net.rete.production_count(), 0);
}

#[test]
fn test_excise_turns_fired_matches_into_retractions() {
    let mut net = Net::new();
    let id = net.rule("red-on", on_red_block());
    let red = net.sym("red");
    net.add(1, "on", ident(2));
    net.add(2, "color", red);
    let assertion = net.rete.take_assertions()[0];
    net.rete.bind_instantiation(assertion.token, InstId(3));

    let nodes_before_rule = Net::new().rete.stats().nodes;
    net.rete.remove_production(id).unwrap();
    assert_eq!(net.rete.take_retractions().len(), 1);
    assert_eq!(net.rete.stats().nodes, nodes_before_rule);
    assert_eq!(net.rete.production_count(), 0);
}

#[test]
fn test_refraction_adopts_the_named_match() {
    let mut net = Net::new();
    let red = net.sym("red");
    let on = net.add(1, "on", ident(2));
    let color = net.add(2, "color", red);
    net.add(1, "on", ident(3));
    net.add(3, "color", red);

    let production = Production::new(
        "learned",
        on_red_block(),
        vec![Action::make("s", "seen", RhsValue::constant("yes"), PreferenceKind::Acceptable)],
    );
    let refraction = Refraction { wmes: vec![Some(on), Some(color)], instantiation: InstId(9) };
    let (_, outcome) = net.rete.add_production(production, Some(refraction)).unwrap();
    assert_eq!(outcome, AddOutcome::RefractedMatched);
    // Only the other block is queued
    assert_eq!(net.rete.pending_assertions().len(), 1);
}

#[test]
fn test_image_round_trip_rebuilds_matches() {
    let mut net = Net::new();
    net.rule("red-on", on_red_block());
    let image = net.rete.save_image().unwrap();
    let bytes = image.to_bytes().unwrap();

    let mut other = Net::new();
    let red = other.sym("red");
    other.add(1, "on", ident(2));
    other.add(2, "color", red);
    other.rete.load_image(NetworkImage::from_bytes(&bytes).unwrap()).unwrap();

    assert_eq!(other.rete.production_count(), 1);
    assert_eq!(other.rete.pending_assertions().len(), 1);
    let reloaded = other.rete.save_image().unwrap();
    assert_eq!(reloaded.rule_names().collect::<Vec<_>>(), vec!["red-on"]);
    assert_eq!(reloaded.node_count(), image.node_count());
}

#[test]
fn test_justifications_block_saving() {
    let mut net = Net::new();
    let mut production = Production::new(
        "justification-1",
        vec![Condition::Positive(Pattern::new(
            Test::Equal(Operand::Ident(IdHandle::new(1))),
            Test::constant("on"),
            Test::Blank,
        ))],
        vec![Action::Halt],
    );
    production.kind = crate::production::ProductionKind::Justification;
    net.rete.add_production(production, None).unwrap();
    assert!(matches!(net.rete.save_image(), Err(EngineError::Persistence { .. })));
}
