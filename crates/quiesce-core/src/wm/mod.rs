//! Working memory: identifiers, facts, slots and the preferences behind them
//!
//! Every fact lives in exactly one `(identifier, attribute)` slot. Facts on
//! ordinary slots are derived from that slot's preferences; facts made by the
//! architecture (goal structure) or by input are added directly. Changes are
//! buffered and reach the match network only when the agent applies them, and
//! identifier reclamation is deferred to [`WorkingMemory::reconcile`].

mod gc;

pub use gc::GcReport;

use crate::arena::Arena;
use crate::decide::surviving_values;
use crate::error::{EngineError, EngineResult, Resource, invariant_check};
use crate::instantiation::InstId;
use crate::preference::{PrefId, Preference, PreferenceKind};
use crate::production::OPERATOR_ATTR;
use crate::rete::NetWme;
use ahash::AHashMap;
use quiesce_types::{IdHandle, Symbol, SymbolTable, Timetag, TimetagSource};
use std::sync::Arc;
use tracing::trace;

/// Where a fact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmeOrigin {
    /// Goal-stack structure
    Architecture,
    /// Placed by the I/O adapter
    Input,
    /// Derived from this preference of its slot
    Preference(PrefId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wme {
    pub timetag: Timetag,
    pub id: IdHandle,
    pub attr: Symbol,
    pub value: Symbol,
    pub acceptable: bool,
    pub origin: WmeOrigin,
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub letter: char,
    pub number: u64,
    refcount: u32,
    /// Lowest goal level it can be reached from; `None` when unreachable
    pub level: Option<usize>,
    pub is_goal: bool,
    pub is_impasse: bool,
    /// Facts whose value is this identifier
    incoming: Vec<Timetag>,
    /// Facts whose identifier is this identifier
    outgoing: Vec<Timetag>,
    attrs: Vec<Symbol>,
}

impl Identifier {
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn incoming(&self) -> &[Timetag] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[Timetag] {
        &self.outgoing
    }
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub id: IdHandle,
    pub attr: Symbol,
    /// A goal's `^operator` slot, resolved by the decision procedure
    pub is_context: bool,
    pub wmes: Vec<Timetag>,
    pub prefs: Vec<PrefId>,
    changed: bool,
}

/// Buffered change for the match network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmeChange {
    Add(NetWme),
    Remove(Timetag),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WmStats {
    pub wmes: usize,
    pub identifiers: usize,
    pub preferences: usize,
    pub wmes_added: u64,
    pub wmes_removed: u64,
    pub identifiers_freed: u64,
    pub peak_wmes: usize,
}

#[derive(Debug)]
pub struct WorkingMemory {
    symbols: Arc<SymbolTable>,
    timetags: Arc<TimetagSource>,
    ids: Arena<Identifier>,
    counters: AHashMap<char, u64>,
    wmes: AHashMap<Timetag, Wme>,
    slots: AHashMap<(IdHandle, Symbol), Slot>,
    prefs: Arena<Preference>,
    changes: Vec<WmeChange>,
    linked: Vec<(IdHandle, IdHandle)>,
    unlinked: Vec<IdHandle>,
    zero_refs: Vec<IdHandle>,
    changed_slots: Vec<(IdHandle, Symbol)>,
    operator: Symbol,
    max_goal_depth: usize,
    stats: WmStats,
}

impl WorkingMemory {
    pub fn new(symbols: Arc<SymbolTable>, timetags: Arc<TimetagSource>) -> Self {
        let operator = symbols.intern_symbol(OPERATOR_ATTR);
        Self {
            symbols,
            timetags,
            ids: Arena::default(),
            counters: AHashMap::new(),
            wmes: AHashMap::new(),
            slots: AHashMap::new(),
            prefs: Arena::default(),
            changes: Vec::new(),
            linked: Vec::new(),
            unlinked: Vec::new(),
            zero_refs: Vec::new(),
            changed_slots: Vec::new(),
            operator,
            max_goal_depth: usize::MAX,
            stats: WmStats::default(),
        }
    }

    pub fn set_max_goal_depth(&mut self, depth: usize) {
        self.max_goal_depth = depth;
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn operator_attr(&self) -> Symbol {
        self.operator
    }

    pub fn stats(&self) -> WmStats {
        WmStats {
            wmes: self.wmes.len(),
            identifiers: self.ids.len(),
            preferences: self.prefs.len(),
            ..self.stats
        }
    }

    // ------------------------------------------------------------------------
    // Identifiers and references
    // ------------------------------------------------------------------------

    /// New identifier with no references; reclaimed at the next reconcile
    /// unless something refers to it by then
    pub fn make_identifier(&mut self, letter: char, level: Option<usize>) -> IdHandle {
        let letter = if letter.is_ascii_alphabetic() { letter.to_ascii_uppercase() } else { 'I' };
        let counter = self.counters.entry(letter).or_insert(0);
        *counter += 1;
        let number = *counter;
        let id = IdHandle::new(self.ids.insert(Identifier {
            letter,
            number,
            refcount: 0,
            level,
            is_goal: false,
            is_impasse: false,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            attrs: Vec::new(),
        }));
        self.zero_refs.push(id);
        id
    }

    pub fn identifier(&self, id: IdHandle) -> Option<&Identifier> {
        self.ids.get(id.index() as u32)
    }

    pub fn is_live(&self, id: IdHandle) -> bool {
        self.identifier(id).is_some()
    }

    pub fn identifier_count(&self) -> usize {
        self.ids.len()
    }

    pub fn level_of(&self, id: IdHandle) -> Option<usize> {
        self.identifier(id).and_then(|ident| ident.level)
    }

    /// Printable name such as `S1`
    pub fn name_of(&self, id: IdHandle) -> String {
        match self.identifier(id) {
            Some(ident) => format!("{}{}", ident.letter, ident.number),
            None => format!("?{}", id.index()),
        }
    }

    pub fn display(&self, symbol: Symbol) -> String {
        match symbol {
            Symbol::Ident(id) => self.name_of(id),
            Symbol::Const(c) => self.symbols.value(c).map_or_else(|| "?".to_string(), |v| v.to_string()),
        }
    }

    pub fn mark_goal(&mut self, id: IdHandle, level: usize, is_impasse: bool) -> EngineResult<()> {
        if level > self.max_goal_depth {
            return Err(EngineError::ResourceExhaustion {
                resource: Resource::GoalDepth,
                limit: self.max_goal_depth,
            });
        }
        let ident = self.ident_mut(id)?;
        ident.is_goal = true;
        ident.is_impasse = is_impasse;
        ident.level = Some(level);
        Ok(())
    }

    /// Drop goal status; the identifier is re-levelled at the next reconcile
    pub fn unmark_goal(&mut self, id: IdHandle) {
        if let Some(ident) = self.ids.get_mut(id.index() as u32) {
            ident.is_goal = false;
            ident.is_impasse = false;
            self.unlinked.push(id);
        }
    }

    pub fn add_ref(&mut self, id: IdHandle) {
        if let Some(ident) = self.ids.get_mut(id.index() as u32) {
            ident.refcount += 1;
        }
    }

    pub fn release(&mut self, id: IdHandle) -> EngineResult<()> {
        let Some(ident) = self.ids.get_mut(id.index() as u32) else {
            return invariant_check(format!("release of freed identifier #{}", id.index()));
        };
        if ident.refcount == 0 {
            return invariant_check(format!("refcount of {}{} below zero", ident.letter, ident.number));
        }
        ident.refcount -= 1;
        if ident.refcount == 0 {
            self.zero_refs.push(id);
        }
        Ok(())
    }

    pub fn symbol_add_ref(&mut self, symbol: Symbol) {
        match symbol {
            Symbol::Ident(id) => self.add_ref(id),
            Symbol::Const(c) => self.symbols.add_ref(c),
        }
    }

    pub fn symbol_release(&mut self, symbol: Symbol) -> EngineResult<()> {
        match symbol {
            Symbol::Ident(id) => self.release(id),
            Symbol::Const(c) => {
                if self.symbols.release(c) {
                    Ok(())
                } else {
                    invariant_check("release of a dead constant")
                }
            }
        }
    }

    fn ident_mut(&mut self, id: IdHandle) -> EngineResult<&mut Identifier> {
        self.ids
            .get_mut(id.index() as u32)
            .ok_or_else(|| EngineError::invariant(format!("identifier #{} is not live", id.index())))
    }

    // ------------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------------

    /// Add a fact, taking its own references on the three symbols
    pub fn add_wme(
        &mut self,
        id: IdHandle,
        attr: Symbol,
        value: Symbol,
        acceptable: bool,
        origin: WmeOrigin,
    ) -> EngineResult<Timetag> {
        let (is_goal, is_impasse) = {
            let ident = self.ident_mut(id)?;
            (ident.is_goal, ident.is_impasse)
        };
        let timetag = self.timetags.next();
        for symbol in [Symbol::Ident(id), attr, value] {
            self.symbol_add_ref(symbol);
        }

        let wme = Wme { timetag, id, attr, value, acceptable, origin };
        self.wmes.insert(timetag, wme);
        self.slot_entry(id, attr).wmes.push(timetag);
        self.ident_mut(id)?.outgoing.push(timetag);
        if let Symbol::Ident(child) = value {
            self.ident_mut(child)?.incoming.push(timetag);
            self.linked.push((id, child));
        }
        self.changes.push(WmeChange::Add(NetWme {
            timetag,
            fields: [Symbol::Ident(id), attr, value],
            acceptable,
            id_is_goal: is_goal,
            id_is_impasse: is_impasse,
        }));
        self.stats.wmes_added += 1;
        self.stats.peak_wmes = self.stats.peak_wmes.max(self.wmes.len());
        trace!(timetag = timetag.0, "wme added");
        Ok(timetag)
    }

    pub fn remove_wme(&mut self, timetag: Timetag) -> EngineResult<Wme> {
        let Some(wme) = self.wmes.remove(&timetag) else {
            return Err(EngineError::invariant(format!("fact {timetag} is not in working memory")));
        };
        if let Some(slot) = self.slots.get_mut(&(wme.id, wme.attr)) {
            slot.wmes.retain(|&t| t != timetag);
        }
        self.drop_slot_if_empty(wme.id, wme.attr);
        if let Some(ident) = self.ids.get_mut(wme.id.index() as u32) {
            ident.outgoing.retain(|&t| t != timetag);
        }
        if let Symbol::Ident(child) = wme.value {
            if let Some(ident) = self.ids.get_mut(child.index() as u32) {
                ident.incoming.retain(|&t| t != timetag);
            }
            self.unlinked.push(child);
        }
        self.changes.push(WmeChange::Remove(timetag));
        for symbol in [Symbol::Ident(wme.id), wme.attr, wme.value] {
            self.symbol_release(symbol)?;
        }
        self.stats.wmes_removed += 1;
        trace!(timetag = timetag.0, "wme removed");
        Ok(wme)
    }

    pub fn wme(&self, timetag: Timetag) -> Option<&Wme> {
        self.wmes.get(&timetag)
    }

    pub fn wme_count(&self) -> usize {
        self.wmes.len()
    }

    pub fn wmes(&self) -> impl Iterator<Item = &Wme> {
        self.wmes.values()
    }

    pub fn wmes_of(&self, id: IdHandle) -> Vec<Wme> {
        self.identifier(id)
            .map(|ident| ident.outgoing.iter().filter_map(|t| self.wmes.get(t)).copied().collect())
            .unwrap_or_default()
    }

    /// Ordinary facts `(id ^attr *)`
    pub fn values_of(&self, id: IdHandle, attr: Symbol) -> Vec<Symbol> {
        self.slots
            .get(&(id, attr))
            .map(|slot| {
                slot.wmes
                    .iter()
                    .filter_map(|t| self.wmes.get(t))
                    .filter(|w| !w.acceptable)
                    .map(|w| w.value)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drain the changes the match network has not seen yet
    pub fn take_changes(&mut self) -> Vec<WmeChange> {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    // ------------------------------------------------------------------------
    // Slots and preferences
    // ------------------------------------------------------------------------

    fn slot_entry(&mut self, id: IdHandle, attr: Symbol) -> &mut Slot {
        let is_context = attr == self.operator && self.identifier(id).is_some_and(|ident| ident.is_goal);
        if !self.slots.contains_key(&(id, attr)) {
            if let Some(ident) = self.ids.get_mut(id.index() as u32) {
                ident.attrs.push(attr);
            }
        }
        self.slots.entry((id, attr)).or_insert_with(|| Slot {
            id,
            attr,
            is_context,
            wmes: Vec::new(),
            prefs: Vec::new(),
            changed: false,
        })
    }

    fn drop_slot_if_empty(&mut self, id: IdHandle, attr: Symbol) {
        let empty = self
            .slots
            .get(&(id, attr))
            .is_some_and(|slot| slot.wmes.is_empty() && slot.prefs.is_empty() && !slot.changed);
        if empty {
            self.slots.remove(&(id, attr));
            if let Some(ident) = self.ids.get_mut(id.index() as u32) {
                ident.attrs.retain(|&a| a != attr);
            }
        }
    }

    pub fn slot(&self, id: IdHandle, attr: Symbol) -> Option<&Slot> {
        self.slots.get(&(id, attr))
    }

    pub fn slot_preferences(&self, id: IdHandle, attr: Symbol) -> Vec<&Preference> {
        self.slots
            .get(&(id, attr))
            .map(|slot| slot.prefs.iter().filter_map(|p| self.prefs.get(p.0)).collect())
            .unwrap_or_default()
    }

    pub fn preference(&self, id: PrefId) -> Option<&Preference> {
        self.prefs.get(id.0)
    }

    pub fn preferences(&self) -> impl Iterator<Item = (PrefId, &Preference)> {
        self.prefs.iter().map(|(index, pref)| (PrefId(index), pref))
    }

    /// Store a preference, taking references on its symbols
    pub fn add_preference(&mut self, pref: Preference) -> EngineResult<PrefId> {
        if !self.is_live(pref.id) {
            return Err(EngineError::invariant("preference for a freed identifier"));
        }
        for symbol in pref.symbols() {
            self.symbol_add_ref(symbol);
        }
        let (id, attr) = (pref.id, pref.attr);
        let pid = PrefId(self.prefs.insert(pref));
        let slot = self.slot_entry(id, attr);
        slot.prefs.push(pid);
        self.mark_changed(id, attr);
        Ok(pid)
    }

    pub fn remove_preference(&mut self, pid: PrefId) -> EngineResult<Preference> {
        let pref = self
            .prefs
            .remove(pid.0)
            .ok_or_else(|| EngineError::invariant(format!("preference #{} is not live", pid.0)))?;
        if let Some(slot) = self.slots.get_mut(&(pref.id, pref.attr)) {
            slot.prefs.retain(|&p| p != pid);
        }
        self.rehome_derived_facts(&pref, pid);
        self.mark_changed(pref.id, pref.attr);
        for symbol in pref.symbols() {
            self.symbol_release(symbol)?;
        }
        Ok(pref)
    }

    /// Hand a preference to another firing, as when a derived rule takes
    /// over a subgoal result
    pub fn reassign_preference(&mut self, pid: PrefId, instantiation: InstId, level: usize) -> EngineResult<()> {
        let pref = self
            .prefs
            .get_mut(pid.0)
            .ok_or_else(|| EngineError::invariant(format!("preference #{} is not live", pid.0)))?;
        pref.instantiation = Some(instantiation);
        pref.level = level;
        Ok(())
    }

    fn mark_changed(&mut self, id: IdHandle, attr: Symbol) {
        if let Some(slot) = self.slots.get_mut(&(id, attr)) {
            if !slot.changed {
                slot.changed = true;
                self.changed_slots.push((id, attr));
            }
        }
    }

    /// Context slots whose preferences changed since the last call
    pub fn changed_context_slots(&self) -> impl Iterator<Item = &(IdHandle, Symbol)> {
        self.changed_slots.iter().filter(|key| self.slots.get(key).is_some_and(|slot| slot.is_context))
    }

    /// Bring the facts of every changed slot in line with its preferences.
    ///
    /// Ordinary slots hold one fact per surviving candidate; context slots
    /// mirror their acceptable and require preferences as acceptable facts.
    pub fn update_changed_slots(&mut self) -> EngineResult<()> {
        for (id, attr) in std::mem::take(&mut self.changed_slots) {
            let Some(slot) = self.slots.get_mut(&(id, attr)) else { continue };
            slot.changed = false;
            let is_context = slot.is_context;
            let reachable = self.level_of(id).is_some();

            let prefs = self.slot_preferences(id, attr);
            let wanted: Vec<(Symbol, PrefId)> = if is_context {
                let mut mirrored: Vec<(Symbol, PrefId)> = Vec::new();
                for pid in &self.slots[&(id, attr)].prefs {
                    if let Some(pref) = self.prefs.get(pid.0) {
                        if pref.kind.is_candidate() && !mirrored.iter().any(|(v, _)| *v == pref.value) {
                            mirrored.push((pref.value, *pid));
                        }
                    }
                }
                mirrored
            } else {
                surviving_values(&prefs)
                    .into_iter()
                    .filter_map(|value| {
                        self.slots[&(id, attr)]
                            .prefs
                            .iter()
                            .find(|pid| {
                                self.prefs.get(pid.0).is_some_and(|p| p.value == value && p.kind.is_candidate())
                            })
                            .map(|pid| (value, *pid))
                    })
                    .collect()
            };
            let wanted = if reachable { wanted } else { Vec::new() };

            let current: Vec<Wme> = self.slots[&(id, attr)]
                .wmes
                .iter()
                .filter_map(|t| self.wmes.get(t))
                .copied()
                .collect();
            for wme in &current {
                let derived = matches!(wme.origin, WmeOrigin::Preference(_));
                if derived && wme.acceptable == is_context && !wanted.iter().any(|(v, _)| *v == wme.value) {
                    self.remove_wme(wme.timetag)?;
                }
            }
            for (value, pid) in wanted {
                let present = current
                    .iter()
                    .any(|w| w.value == value && w.acceptable == is_context && self.wmes.contains_key(&w.timetag));
                if !present {
                    self.add_wme(id, attr, value, is_context, WmeOrigin::Preference(pid))?;
                }
            }
            self.drop_slot_if_empty(id, attr);
        }
        Ok(())
    }

    /// Point facts derived from a removed preference at another live
    /// candidate for the same value, if the slot has one
    fn rehome_derived_facts(&mut self, removed: &Preference, pid: PrefId) {
        let Some(slot) = self.slots.get(&(removed.id, removed.attr)) else { return };
        let replacement = slot.prefs.iter().copied().find(|p| {
            self.prefs.get(p.0).is_some_and(|other| other.value == removed.value && other.kind.is_candidate())
        });
        let Some(replacement) = replacement else { return };
        for timetag in slot.wmes.clone() {
            if let Some(wme) = self.wmes.get_mut(&timetag) {
                if wme.origin == WmeOrigin::Preference(pid) {
                    wme.origin = WmeOrigin::Preference(replacement);
                }
            }
        }
    }

    /// Supporting preference of a derived fact, for backtracing
    pub fn supporting_preference(&self, timetag: Timetag) -> Option<&Preference> {
        let wme = self.wmes.get(&timetag)?;
        let WmeOrigin::Preference(pid) = wme.origin else { return None };
        let same_fact = |p: &&Preference| p.id == wme.id && p.attr == wme.attr && p.value == wme.value;
        if let Some(pref) = self.prefs.get(pid.0).filter(same_fact) {
            return Some(pref);
        }
        // Handle may have been reused; any live candidate for the same value supports it
        self.slot_preferences(wme.id, wme.attr)
            .into_iter()
            .find(|p| p.value == wme.value && p.kind.is_candidate())
    }

    /// Every preference of a kind on a slot, in arrival order
    pub fn preferences_of_kind(&self, id: IdHandle, attr: Symbol, kind: PreferenceKind) -> Vec<&Preference> {
        self.slot_preferences(id, attr).into_iter().filter(|p| p.kind == kind).collect()
    }
}

#[cfg(test)]
mod tests;
