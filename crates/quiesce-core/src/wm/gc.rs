//! Deferred reachability and reclamation of identifiers
//!
//! Links gained and lost since the last pass are batched. A pass first
//! promotes identifiers that became reachable from a better goal level, then
//! re-levels only the identifiers whose level could have depended on a lost
//! link, removes the structure of any that ended up unreachable, and finally
//! frees identifiers with no references left.

use super::WorkingMemory;
use crate::error::{EngineResult, invariant_check};
use crate::preference::{PrefId, Preference, Support};
use ahash::AHashSet;
use quiesce_types::{IdHandle, Symbol};
use std::collections::VecDeque;
use tracing::debug;

/// What one reconcile pass did
#[derive(Debug, Default)]
pub struct GcReport {
    pub promoted: usize,
    pub unreachable: usize,
    pub freed: usize,
    /// Preferences dropped because their identifier became unreachable
    pub removed_preferences: Vec<(PrefId, Preference)>,
}

impl WorkingMemory {
    /// Run the batched reachability walk and free unreferenced identifiers
    pub fn reconcile(&mut self) -> EngineResult<GcReport> {
        let mut report = GcReport { promoted: self.promote(), ..GcReport::default() };
        while !self.unlinked.is_empty() {
            self.demote(&mut report)?;
        }
        self.free_zero_refs(&mut report)?;
        if report.unreachable > 0 || report.freed > 0 {
            debug!(
                promoted = report.promoted,
                unreachable = report.unreachable,
                freed = report.freed,
                "working memory reconciled"
            );
        }
        Ok(report)
    }

    fn children_of(&self, id: IdHandle) -> Vec<IdHandle> {
        self.identifier(id)
            .map(|ident| {
                ident
                    .outgoing
                    .iter()
                    .filter_map(|t| self.wmes.get(t))
                    .filter_map(|w| w.value.as_ident())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parents_of(&self, id: IdHandle) -> Vec<IdHandle> {
        self.identifier(id)
            .map(|ident| ident.incoming.iter().filter_map(|t| self.wmes.get(t)).map(|w| w.id).collect())
            .unwrap_or_default()
    }

    fn promote(&mut self) -> usize {
        let mut promoted = 0;
        let mut queue: VecDeque<IdHandle> = VecDeque::new();
        for (parent, child) in std::mem::take(&mut self.linked) {
            if self.lower_level(parent, child) {
                promoted += 1;
                queue.push_back(child);
            }
        }
        while let Some(id) = queue.pop_front() {
            for child in self.children_of(id) {
                if self.lower_level(id, child) {
                    promoted += 1;
                    queue.push_back(child);
                }
            }
        }
        promoted
    }

    /// Give `child` the level of `parent` when that is better; goals keep theirs
    fn lower_level(&mut self, parent: IdHandle, child: IdHandle) -> bool {
        let Some(level) = self.level_of(parent) else { return false };
        match self.ids.get_mut(child.index() as u32) {
            Some(ident) if !ident.is_goal && ident.level.is_none_or(|current| current > level) => {
                ident.level = Some(level);
                true
            }
            _ => false,
        }
    }

    fn demote(&mut self, report: &mut GcReport) -> EngineResult<()> {
        // Only identifiers at the lost link's level can have depended on it
        let mut suspects: AHashSet<IdHandle> = AHashSet::new();
        let mut order: Vec<IdHandle> = Vec::new();
        for start in std::mem::take(&mut self.unlinked) {
            let Some(ident) = self.identifier(start) else { continue };
            let Some(level) = ident.level else { continue };
            if ident.is_goal || !suspects.insert(start) {
                continue;
            }
            order.push(start);
            let mut queue = VecDeque::from([start]);
            while let Some(id) = queue.pop_front() {
                for child in self.children_of(id) {
                    let Some(found) = self.identifier(child) else { continue };
                    if !found.is_goal && found.level == Some(level) && suspects.insert(child) {
                        order.push(child);
                        queue.push_back(child);
                    }
                }
            }
        }
        if suspects.is_empty() {
            return Ok(());
        }

        for id in &order {
            if let Some(ident) = self.ids.get_mut(id.index() as u32) {
                ident.level = None;
            }
        }

        // Seed from parents outside the suspect set, best level first
        let mut seeds: Vec<(usize, IdHandle)> = order
            .iter()
            .filter_map(|&id| {
                self.parents_of(id)
                    .into_iter()
                    .filter(|parent| !suspects.contains(parent))
                    .filter_map(|parent| self.level_of(parent))
                    .min()
                    .map(|level| (level, id))
            })
            .collect();
        seeds.sort();
        for (level, seed) in seeds {
            if self.level_of(seed).is_some_and(|current| current <= level) {
                continue;
            }
            if let Some(ident) = self.ids.get_mut(seed.index() as u32) {
                ident.level = Some(level);
            }
            let mut queue = VecDeque::from([seed]);
            while let Some(id) = queue.pop_front() {
                for child in self.children_of(id) {
                    if suspects.contains(&child) && self.lower_level(id, child) {
                        queue.push_back(child);
                    }
                }
            }
        }

        let unreachable: Vec<IdHandle> =
            order.into_iter().filter(|&id| self.level_of(id).is_none()).collect();
        report.unreachable += unreachable.len();
        for &id in &unreachable {
            self.strip_unreachable(id, report)?;
        }
        let gone: AHashSet<IdHandle> = unreachable.into_iter().collect();
        self.unlinked.retain(|child| !gone.contains(child));
        Ok(())
    }

    /// Remove the facts and persistent preferences hanging off an unreachable identifier
    fn strip_unreachable(&mut self, id: IdHandle, report: &mut GcReport) -> EngineResult<()> {
        let attrs = self.identifier(id).map(|ident| ident.attrs.clone()).unwrap_or_default();
        for attr in attrs {
            let persistent: Vec<PrefId> = self
                .slots
                .get(&(id, attr))
                .map(|slot| {
                    slot.prefs
                        .iter()
                        .copied()
                        .filter(|p| self.prefs.get(p.0).is_some_and(|pref| pref.support == Support::O))
                        .collect()
                })
                .unwrap_or_default();
            for pid in persistent {
                let pref = self.remove_preference(pid)?;
                report.removed_preferences.push((pid, pref));
            }
        }
        let outgoing = self.identifier(id).map(|ident| ident.outgoing.clone()).unwrap_or_default();
        for timetag in outgoing {
            if self.wmes.contains_key(&timetag) {
                self.remove_wme(timetag)?;
            }
        }
        Ok(())
    }

    fn free_zero_refs(&mut self, report: &mut GcReport) -> EngineResult<()> {
        let mut seen: AHashSet<IdHandle> = AHashSet::new();
        for id in std::mem::take(&mut self.zero_refs) {
            if !seen.insert(id) {
                continue;
            }
            let Some(ident) = self.identifier(id) else { continue };
            if ident.refcount > 0 {
                continue;
            }
            if !ident.incoming.is_empty() || !ident.outgoing.is_empty() {
                invariant_check(format!("freeing {} while facts still refer to it", self.name_of(id)))?;
                continue;
            }
            let attrs = ident.attrs.clone();
            for attr in attrs {
                self.slots.remove(&(id, attr));
            }
            self.ids.remove(id.index() as u32);
            self.stats.identifiers_freed += 1;
            report.freed += 1;
        }
        Ok(())
    }

    /// Identifiers reachable from the given goals through facts, by walking the graph
    pub fn reachable_from(&self, goals: &[IdHandle]) -> AHashSet<IdHandle> {
        let mut seen: AHashSet<IdHandle> = goals.iter().copied().filter(|&g| self.is_live(g)).collect();
        let mut queue: VecDeque<IdHandle> = seen.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            for child in self.children_of(id) {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }

    /// Identifiers still allocated but absent from every fact and preference
    pub fn unreferenced_identifiers(&self) -> Vec<IdHandle> {
        let mut mentioned: AHashSet<IdHandle> = AHashSet::new();
        for wme in self.wmes.values() {
            for symbol in [Symbol::Ident(wme.id), wme.attr, wme.value] {
                if let Symbol::Ident(id) = symbol {
                    mentioned.insert(id);
                }
            }
        }
        for (_, pref) in self.prefs.iter() {
            mentioned.extend(pref.symbols().filter_map(|s| s.as_ident()));
        }
        self.ids
            .iter()
            .map(|(index, _)| IdHandle::new(index))
            .filter(|id| !mentioned.contains(id))
            .collect()
    }
}
