//! Derived rules for subgoal results
//!
//! A firing inside a subgoal that makes a preference for a higher goal has
//! produced a result. The facts it depended on are traced back to the ones
//! that belong to higher goals; those become the conditions of a new rule
//! whose instantiation takes over the result, so the result outlives the
//! subgoal.

use super::Agent;
use crate::error::{EngineError, EngineResult};
use crate::instantiation::{InstId, Instantiation, MatchedFact};
use crate::params::Param;
use crate::preference::{PrefId, Preference};
use crate::production::{Action, Condition, Operand, Pattern, Production, ProductionKind, RhsValue, Test};
use crate::rete::{AddOutcome, ProductionId, Refraction};
use ahash::{AHashMap, AHashSet};
use quiesce_types::{IdHandle, Symbol};
use tracing::{debug, info};

/// Turns identifiers into variables for chunks, or keeps them for justifications
struct Variablizer {
    variablize: bool,
    names: AHashMap<IdHandle, String>,
    used: AHashMap<char, u32>,
}

impl Variablizer {
    fn new(variablize: bool) -> Self {
        Self { variablize, names: AHashMap::new(), used: AHashMap::new() }
    }

    fn var_for(&mut self, id: IdHandle, letter: char) -> String {
        if let Some(name) = self.names.get(&id) {
            return name.clone();
        }
        let counter = self.used.entry(letter).or_insert(0);
        *counter += 1;
        let name = format!("{}{}", letter.to_ascii_lowercase(), counter);
        self.names.insert(id, name.clone());
        name
    }
}

impl Agent {
    /// Look for results among the preferences `inst` just made
    pub(super) fn detect_results(&mut self, inst: InstId, level: usize) -> EngineResult<()> {
        let Some(record) = self.insts.get(inst) else { return Ok(()) };
        let made = record.prefs.clone();

        let mut results: Vec<PrefId> = Vec::new();
        let mut linked: Vec<IdHandle> = Vec::new();
        for &pid in &made {
            let Some(pref) = self.wm.preference(pid) else { continue };
            if self.wm.level_of(pref.id).is_some_and(|l| l < level) {
                results.push(pid);
                linked.extend(pref.value.as_ident());
            }
        }
        if results.is_empty() {
            return Ok(());
        }

        // Structure hung off a result by the same firing travels with it
        let mut seen: AHashSet<IdHandle> = AHashSet::new();
        while let Some(id) = linked.pop() {
            if !seen.insert(id) || self.wm.level_of(id).is_some_and(|l| l < level) {
                continue;
            }
            for &pid in &made {
                let Some(pref) = self.wm.preference(pid) else { continue };
                if pref.id == id && !results.contains(&pid) {
                    results.push(pid);
                    linked.extend(pref.value.as_ident());
                }
            }
        }

        self.learn(inst, level, results)
    }

    /// Facts from higher goals that `inst` depended on, oldest first
    fn backtrace(&self, inst: InstId, level: usize) -> Vec<MatchedFact> {
        let mut grounds: Vec<MatchedFact> = Vec::new();
        let mut seen_facts = AHashSet::new();
        let mut visited = AHashSet::new();
        let mut pending = vec![inst];
        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(record) = self.insts.get(current) else { continue };
            for fact in &record.matched {
                match fact.level {
                    Some(l) if l < level => {
                        if seen_facts.insert(fact.timetag) {
                            grounds.push(*fact);
                        }
                    }
                    _ => pending.extend(fact.support),
                }
            }
        }
        grounds.sort_by_key(|fact| fact.timetag);
        grounds
    }

    fn learn(&mut self, inst: InstId, level: usize, results: Vec<PrefId>) -> EngineResult<()> {
        let grounds = self.backtrace(inst, level);
        let rule = self.insts.get(inst).map(|r| r.rule.clone()).unwrap_or_default();
        if grounds.is_empty() {
            self.warn(format!("result of {rule} depends on nothing outside its subgoal; no rule derived"));
            return Ok(());
        }
        let result_prefs: Vec<Preference> =
            results.iter().filter_map(|&pid| self.wm.preference(pid).cloned()).collect();
        let Some(support) = result_prefs.first().map(|p| p.support) else { return Ok(()) };

        let chunking = self.params.flag(Param::Learning);
        let kind = if chunking { ProductionKind::Chunk } else { ProductionKind::Justification };
        let name = self.derived_rule_name(kind);
        let mut variablizer = Variablizer::new(chunking);
        let conditions = grounds.iter().map(|fact| self.ground_condition(fact, &mut variablizer)).collect();
        let actions = result_prefs.iter().map(|pref| self.result_action(pref, &mut variablizer)).collect();
        let production = Production { name: name.clone(), kind, support: Some(support), conditions, actions };

        let derived_level = grounds.iter().filter_map(|fact| fact.level).max().unwrap_or(1);
        for fact in &grounds {
            for symbol in fact.symbols() {
                self.wm.symbol_add_ref(symbol);
            }
        }
        let derived = self.insts.insert(Instantiation {
            production: ProductionId(u32::MAX),
            rule: name.clone(),
            kind,
            wmes: grounds.iter().map(|fact| Some(fact.timetag)).collect(),
            matched: grounds.clone(),
            level: derived_level,
            prefs: Vec::new(),
            retracted: false,
        });

        let refraction = Refraction { wmes: grounds.iter().map(|fact| Some(fact.timetag)).collect(), instantiation: derived };
        match self.rete.add_production(production, Some(refraction)) {
            Ok((id, AddOutcome::RefractedMatched)) => {
                for &pid in &results {
                    self.wm.reassign_preference(pid, derived, derived_level)?;
                }
                if let Some(source) = self.insts.get_mut(inst) {
                    source.prefs.retain(|pid| !results.contains(pid));
                }
                if let Some(record) = self.insts.get_mut(derived) {
                    record.production = id;
                    record.prefs = results;
                }
                match kind {
                    ProductionKind::Chunk => self.stats.chunks += 1,
                    _ => self.stats.justifications += 1,
                }
                info!(agent = %self.name, rule = %name, source = %rule, conditions = grounds.len(), "derived rule built");
                Ok(())
            }
            Ok((id, _)) => {
                self.warn(format!("{name} does not match the firing it was derived from; dropped"));
                self.rete.remove_production(id)?;
                self.discard_derived(derived)
            }
            Err(EngineError::DuplicateRule { existing, .. }) => {
                debug!(agent = %self.name, rule = %name, %existing, "derived rule duplicates an existing one");
                self.discard_derived(derived)
            }
            Err(err) => {
                self.discard_derived(derived)?;
                Err(err)
            }
        }
    }

    fn discard_derived(&mut self, derived: InstId) -> EngineResult<()> {
        match self.insts.remove(derived) {
            Some(record) => self.release_instantiation(record),
            None => Ok(()),
        }
    }

    fn derived_rule_name(&self, kind: ProductionKind) -> String {
        let (prefix, mut n) = match kind {
            ProductionKind::Chunk => ("chunk", self.stats.chunks + 1),
            _ => ("justification", self.stats.justifications + 1),
        };
        loop {
            let name = format!("{prefix}-{n}");
            if self.rete.find_production(&name).is_none() {
                return name;
            }
            n += 1;
        }
    }

    fn ground_condition(&self, fact: &MatchedFact, vars: &mut Variablizer) -> Condition {
        let is_goal = self.wm.identifier(fact.id).is_some_and(|ident| ident.is_goal);
        let id = match self.identifier_operand(fact.id, vars) {
            Operand::Var(name) if is_goal => Test::goal(&name),
            operand => Test::Equal(operand),
        };
        let pattern = Pattern {
            id,
            attr: Test::Equal(self.symbol_operand(fact.attr, vars)),
            value: Test::Equal(self.symbol_operand(fact.value, vars)),
            acceptable: fact.acceptable,
        };
        Condition::Positive(pattern)
    }

    fn result_action(&self, pref: &Preference, vars: &mut Variablizer) -> Action {
        Action::Make {
            id: self.rhs_value(Symbol::Ident(pref.id), vars),
            attr: self.rhs_value(pref.attr, vars),
            value: self.rhs_value(pref.value, vars),
            preference: pref.kind,
            referent: pref.referent.map(|r| self.rhs_value(r, vars)),
        }
    }

    fn identifier_operand(&self, id: IdHandle, vars: &mut Variablizer) -> Operand {
        if !vars.variablize {
            return Operand::Ident(id);
        }
        let letter = self.wm.identifier(id).map_or('I', |ident| ident.letter);
        Operand::Var(vars.var_for(id, letter))
    }

    fn symbol_operand(&self, symbol: Symbol, vars: &mut Variablizer) -> Operand {
        match symbol {
            Symbol::Ident(id) => self.identifier_operand(id, vars),
            Symbol::Const(c) => match self.symbols.value(c) {
                Some(value) => Operand::Const(value),
                None => Operand::Const(self.wm.display(symbol).into()),
            },
        }
    }

    fn rhs_value(&self, symbol: Symbol, vars: &mut Variablizer) -> RhsValue {
        match self.symbol_operand(symbol, vars) {
            Operand::Var(name) => RhsValue::Var(name),
            Operand::Ident(id) => RhsValue::Ident(id),
            Operand::Const(value) => RhsValue::Const(value),
        }
    }
}
