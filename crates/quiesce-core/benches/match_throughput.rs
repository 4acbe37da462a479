use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use quiesce_core::rete::NetWme;
use quiesce_core::{
    Action, Agent, Condition, IdHandle, ParamTable, Pattern, PreferenceKind, Production, Rete, RhsValue, Symbol,
    SymbolTable, Test, Timetag,
};
use quiesce_types::TimetagSource;
use std::sync::Arc;

fn chain_rule(id: usize) -> Production {
    Production::new(
        &format!("chain-{id}"),
        vec![
            Condition::Positive(Pattern::triple("a", "next", Test::var("b"))),
            Condition::Positive(Pattern::triple("b", "next", Test::var("c"))),
            Condition::Positive(Pattern::triple("c", "mark", Test::constant(id as i64))),
        ],
        vec![Action::make("a", "reached", RhsValue::var("c"), PreferenceKind::Acceptable)],
    )
}

fn bench_fact_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("fact_churn");
    for rules in [1usize, 10, 100] {
        let symbols = Arc::new(SymbolTable::new());
        let mut rete = Rete::new(symbols.clone());
        for i in 0..rules {
            rete.add_production(chain_rule(i), None).unwrap();
        }
        let next = symbols.intern_symbol("next");
        let mark = symbols.intern_symbol("mark");

        group.bench_with_input(BenchmarkId::from_parameter(rules), &rules, |b, &rules| {
            let mut timetag = 0u64;
            b.iter(|| {
                let mut added = Vec::with_capacity(300);
                for n in 0..100u32 {
                    for (attr, value) in [
                        (next, Symbol::Ident(IdHandle::new(n + 1))),
                        (mark, symbols.intern_symbol((n as usize % rules) as i64)),
                    ] {
                        timetag += 1;
                        let wme = NetWme {
                            timetag: Timetag(timetag),
                            fields: [Symbol::Ident(IdHandle::new(n)), attr, value],
                            acceptable: false,
                            id_is_goal: false,
                            id_is_impasse: false,
                        };
                        rete.add_wme(wme);
                        added.push(Timetag(timetag));
                    }
                }
                black_box(rete.pending_assertions().len());
                for timetag in added {
                    rete.remove_wme(timetag).unwrap();
                }
                rete.take_assertions();
                rete.take_retractions();
            });
        });
    }
    group.finish();
}

fn bench_rule_addition(c: &mut Criterion) {
    c.bench_function("add_and_excise_100_rules", |b| {
        b.iter(|| {
            let mut rete = Rete::new(Arc::new(SymbolTable::new()));
            let ids: Vec<_> = (0..100).map(|i| rete.add_production(chain_rule(i), None).unwrap().0).collect();
            for id in ids {
                black_box(rete.remove_production(id).unwrap());
            }
        });
    });
}

fn bench_decision_cycles(c: &mut Criterion) {
    c.bench_function("empty_agent_20_cycles", |b| {
        b.iter(|| {
            let mut agent =
                Agent::new("bench", Arc::new(SymbolTable::new()), Arc::new(TimetagSource::new()), ParamTable::new())
                    .unwrap();
            while agent.stats().cycles < 20 && !agent.is_halted() {
                black_box(agent.step());
            }
        });
    });
}

criterion_group!(benches, bench_fact_churn, bench_rule_addition, bench_decision_cycles);
criterion_main!(benches);
