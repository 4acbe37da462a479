//! Elaboration: retract what stopped matching, fire what newly matches

use super::{Agent, StepReport};
use crate::error::EngineResult;
use crate::instantiation::{InstId, Instantiation, MatchedFact};
use crate::preference::{PrefId, Preference, PreferenceKind, Support};
use crate::production::{Action, ProductionKind, RhsValue};
use crate::rete::{Assertion, Location};
use crate::scheduler::{Phase, RunState};
use crate::trace::TraceEvent;
use ahash::AHashMap;
use quiesce_types::{IdHandle, Symbol, Timetag};
use tracing::debug;

/// What a rule's right-hand side needs, copied out of the network before firing
struct FiringPlan {
    rule: String,
    kind: ProductionKind,
    actions: Vec<(Action, Support)>,
    bindings: AHashMap<String, Location>,
}

impl Agent {
    /// One elaboration of Propose or Apply. Returns whether the phase is over.
    pub(super) fn run_elaboration(&mut self, report: &mut StepReport) -> EngineResult<bool> {
        if self.is_quiescent() {
            return Ok(true);
        }
        self.elaborate()?;
        report.elaborated = true;
        self.stats.elaborations += 1;
        self.elaborations_in_phase += 1;

        if self.is_quiescent() {
            return Ok(true);
        }
        if self.elaborations_in_phase >= self.params.max_elaborations() {
            let message = format!(
                "{} phase stopped after {} elaborations without quiescence",
                self.phase, self.elaborations_in_phase
            );
            self.warn(message);
            return Ok(true);
        }
        Ok(false)
    }

    /// Rules that would make persistent preferences wait for the apply phase
    fn fires_now(&self, assertion: &Assertion) -> bool {
        if self.phase != Phase::Propose {
            return true;
        }
        self.rete.production(assertion.production).is_none_or(|record| {
            let production = &record.production;
            production.actions.iter().all(|action| production.support_for(action) == Support::I)
        })
    }

    pub(super) fn is_quiescent(&self) -> bool {
        self.rete.pending_retractions().is_empty()
            && !self.rete.pending_assertions().iter().any(|a| self.fires_now(a))
    }

    fn elaborate(&mut self) -> EngineResult<()> {
        for retraction in self.rete.take_retractions() {
            self.retract(retraction.instantiation)?;
        }

        let (now, later): (Vec<Assertion>, Vec<Assertion>) =
            self.rete.take_assertions().into_iter().partition(|a| self.fires_now(a));
        self.rete.requeue_assertions(later);
        for assertion in now {
            self.fire(assertion)?;
        }

        self.wm.update_changed_slots()?;
        self.apply_changes()?;
        self.collect_garbage()
    }

    // ------------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------------

    fn fire(&mut self, assertion: Assertion) -> EngineResult<()> {
        let Some(record) = self.rete.production(assertion.production) else {
            return Ok(());
        };
        let plan = FiringPlan {
            rule: record.production.name.clone(),
            kind: record.production.kind,
            actions: record
                .production
                .actions
                .iter()
                .map(|action| (action.clone(), record.production.support_for(action)))
                .collect(),
            bindings: record.bindings.clone(),
        };
        let wmes = self.rete.token_wmes(assertion.token);

        let mut matched = Vec::new();
        for timetag in wmes.iter().flatten() {
            let Some(wme) = self.wm.wme(*timetag).copied() else { continue };
            let support = self.wm.supporting_preference(*timetag).and_then(|p| p.instantiation);
            matched.push(MatchedFact {
                timetag: *timetag,
                id: wme.id,
                attr: wme.attr,
                value: wme.value,
                acceptable: wme.acceptable,
                level: self.wm.level_of(wme.id),
                support,
            });
        }
        for fact in &matched {
            for symbol in fact.symbols() {
                self.wm.symbol_add_ref(symbol);
            }
        }
        let level = matched.iter().filter_map(|f| f.level).max().unwrap_or(1);

        let inst = self.insts.insert(Instantiation {
            production: assertion.production,
            rule: plan.rule.clone(),
            kind: plan.kind,
            wmes: wmes.clone(),
            matched,
            level,
            prefs: Vec::new(),
            retracted: false,
        });
        self.rete.bind_instantiation(assertion.token, inst);

        let mut fresh: AHashMap<String, IdHandle> = AHashMap::new();
        let mut interned: Vec<Symbol> = Vec::new();
        let mut kinds = Vec::new();
        let mut made = Vec::new();
        for (action, support) in &plan.actions {
            match action {
                Action::Halt => {
                    self.state = RunState::HaltRequested;
                }
                Action::Make { id, attr, value, preference, referent } => {
                    let mut resolve = |agent: &mut Agent, rhs: &RhsValue| {
                        agent.rhs_symbol(rhs, &wmes, &plan.bindings, &mut fresh, &mut interned, level)
                    };
                    let id_symbol = resolve(self, id);
                    let attr = resolve(self, attr);
                    let value = resolve(self, value);
                    let referent = referent.as_ref().map(|r| resolve(self, r));
                    let Some(id) = id_symbol.as_ident() else {
                        self.warn(format!("{} tried to make a preference on a constant", plan.rule));
                        continue;
                    };
                    let pid = self.wm.add_preference(Preference {
                        kind: *preference,
                        id,
                        attr,
                        value,
                        referent,
                        support: *support,
                        instantiation: Some(inst),
                        level,
                    })?;
                    kinds.push(*preference);
                    made.push(pid);
                }
            }
        }
        for symbol in interned {
            self.wm.symbol_release(symbol)?;
        }
        if let Some(record) = self.insts.get_mut(inst) {
            record.prefs.extend(made.iter().copied());
        }

        self.emit(TraceEvent::Fired { agent: self.name.clone(), rule: plan.rule.clone(), level, preferences: kinds });
        for &pid in &made {
            self.apply_persistent_reject(pid)?;
        }
        if level > 1 {
            self.detect_results(inst, level)?;
        }
        Ok(())
    }

    /// Symbol for one right-hand-side value. Constants are interned with a
    /// reference the caller drops once the preference holds its own.
    fn rhs_symbol(
        &mut self,
        rhs: &RhsValue,
        wmes: &[Option<Timetag>],
        bindings: &AHashMap<String, Location>,
        fresh: &mut AHashMap<String, IdHandle>,
        interned: &mut Vec<Symbol>,
        level: usize,
    ) -> Symbol {
        match rhs {
            RhsValue::Const(constant) => {
                let symbol = self.symbols.intern_symbol(constant.clone());
                interned.push(symbol);
                symbol
            }
            RhsValue::Ident(id) => Symbol::Ident(*id),
            RhsValue::Var(name) => {
                let bound = bindings.get(name).and_then(|location| {
                    let timetag = wmes.get(location.level.checked_sub(1)?)?.as_ref()?;
                    let wme = self.rete.wme(*timetag)?;
                    Some(wme.field(location.field))
                });
                if let Some(symbol) = bound {
                    return symbol;
                }
                let id = *fresh.entry(name.clone()).or_insert_with(|| {
                    let letter = name.chars().find(|c| c.is_ascii_alphabetic()).unwrap_or('I');
                    self.wm.make_identifier(letter, Some(level))
                });
                Symbol::Ident(id)
            }
        }
    }

    /// A persistent reject withdraws every persistent preference for its value
    fn apply_persistent_reject(&mut self, pid: PrefId) -> EngineResult<()> {
        let Some(reject) = self.wm.preference(pid).cloned() else { return Ok(()) };
        if reject.kind != PreferenceKind::Reject || reject.support != Support::O {
            return Ok(());
        }
        let doomed: Vec<PrefId> = self
            .wm
            .slot(reject.id, reject.attr)
            .map(|slot| {
                slot.prefs
                    .iter()
                    .copied()
                    .filter(|p| {
                        self.wm
                            .preference(*p)
                            .is_some_and(|other| other.value == reject.value && other.support == Support::O)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for doomed in doomed {
            self.remove_preference(doomed)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Retraction and release
    // ------------------------------------------------------------------------

    pub(super) fn retract(&mut self, id: InstId) -> EngineResult<()> {
        let Some(inst) = self.insts.retract(id) else { return Ok(()) };
        let rule = inst.rule.clone();
        let kind = inst.kind;
        let production = inst.production;
        let prefs = inst.prefs.clone();

        let mut kinds = Vec::new();
        for pid in prefs {
            let Some(pref) = self.wm.preference(pid) else { continue };
            if pref.support == Support::I {
                kinds.push(pref.kind);
                self.remove_preference(pid)?;
            }
        }
        if self.insts.get(id).is_some_and(Instantiation::is_releasable) {
            if let Some(done) = self.insts.remove(id) {
                self.release_instantiation(done)?;
            }
        }
        self.emit(TraceEvent::Retracted { agent: self.name.clone(), rule: rule.clone(), preferences: kinds });

        if kind == ProductionKind::Justification && self.rete.production(production).is_some() {
            debug!(agent = %self.name, %rule, "excising retracted justification");
            self.rete.remove_production(production)?;
        }
        Ok(())
    }

    /// Remove a preference and release its firing once nothing else holds it
    pub(super) fn remove_preference(&mut self, pid: PrefId) -> EngineResult<()> {
        let pref = self.wm.remove_preference(pid)?;
        if let Some(inst) = pref.instantiation {
            if let Some(done) = self.insts.drop_preference(inst, pid) {
                self.release_instantiation(done)?;
            }
        }
        Ok(())
    }

    pub(super) fn release_instantiation(&mut self, inst: Instantiation) -> EngineResult<()> {
        for fact in &inst.matched {
            for symbol in fact.symbols() {
                self.wm.symbol_release(symbol)?;
            }
        }
        Ok(())
    }
}
