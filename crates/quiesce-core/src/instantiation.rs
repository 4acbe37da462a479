//! Instantiations: one record per rule firing
//!
//! An instantiation keeps a copy of the facts it matched (so it can be
//! backtraced after they are gone) and the preferences it produced. It is
//! released once it has retracted and none of its preferences are alive.

use crate::arena::Arena;
use crate::preference::PrefId;
use crate::production::ProductionKind;
use crate::rete::ProductionId;
use quiesce_types::{IdHandle, Symbol, Timetag};

handle!(
    /// One firing of a rule
    InstId
);

/// A matched fact as it was when the rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedFact {
    pub timetag: Timetag,
    pub id: IdHandle,
    pub attr: Symbol,
    pub value: Symbol,
    pub acceptable: bool,
    /// Level of `id` when the rule fired
    pub level: Option<usize>,
    /// Firing whose preference supported the fact, if rule-made
    pub support: Option<InstId>,
}

impl MatchedFact {
    pub fn symbols(&self) -> [Symbol; 3] {
        [Symbol::Ident(self.id), self.attr, self.value]
    }
}

#[derive(Debug, Clone)]
pub struct Instantiation {
    pub production: ProductionId,
    pub rule: String,
    pub kind: ProductionKind,
    /// One entry per top-level condition; `None` for negated ones
    pub wmes: Vec<Option<Timetag>>,
    pub matched: Vec<MatchedFact>,
    /// Deepest goal level among the matched identifiers
    pub level: usize,
    pub prefs: Vec<PrefId>,
    pub retracted: bool,
}

impl Instantiation {
    pub fn is_releasable(&self) -> bool {
        self.retracted && self.prefs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FiringStats {
    pub fired: u64,
    pub retracted: u64,
    pub live: usize,
}

#[derive(Debug, Default)]
pub struct InstantiationStore {
    arena: Arena<Instantiation>,
    fired: u64,
    retracted: u64,
}

impl InstantiationStore {
    pub fn insert(&mut self, instantiation: Instantiation) -> InstId {
        self.fired += 1;
        InstId(self.arena.insert(instantiation))
    }

    pub fn get(&self, id: InstId) -> Option<&Instantiation> {
        self.arena.get(id.0)
    }

    pub fn get_mut(&mut self, id: InstId) -> Option<&mut Instantiation> {
        self.arena.get_mut(id.0)
    }

    /// Mark retracted; the caller removes i-supported preferences
    pub fn retract(&mut self, id: InstId) -> Option<&mut Instantiation> {
        let inst = self.arena.get_mut(id.0)?;
        if !inst.retracted {
            inst.retracted = true;
            self.retracted += 1;
        }
        Some(inst)
    }

    /// Forget a preference the instantiation made; returns the record if it
    /// can now be released
    pub fn drop_preference(&mut self, id: InstId, pref: PrefId) -> Option<Instantiation> {
        let inst = self.arena.get_mut(id.0)?;
        inst.prefs.retain(|&p| p != pref);
        if inst.is_releasable() { self.arena.remove(id.0) } else { None }
    }

    pub fn remove(&mut self, id: InstId) -> Option<Instantiation> {
        self.arena.remove(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &Instantiation)> {
        self.arena.iter().map(|(index, inst)| (InstId(index), inst))
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn stats(&self) -> FiringStats {
        FiringStats { fired: self.fired, retracted: self.retracted, live: self.arena.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Instantiation {
        Instantiation {
            production: ProductionId(0),
            rule: "elaborate".to_string(),
            kind: ProductionKind::User,
            wmes: vec![Some(Timetag(1))],
            matched: Vec::new(),
            level: 1,
            prefs: vec![PrefId(0), PrefId(1)],
            retracted: false,
        }
    }

    #[test]
    fn test_release_waits_for_retraction_and_preferences() {
        let mut store = InstantiationStore::default();
        let id = store.insert(record());

        assert!(store.drop_preference(id, PrefId(0)).is_none());
        store.retract(id);
        assert!(store.get(id).is_some());
        let released = store.drop_preference(id, PrefId(1)).unwrap();
        assert!(released.retracted);
        assert!(store.is_empty());
        assert_eq!(store.stats(), FiringStats { fired: 1, retracted: 1, live: 0 });
    }

    #[test]
    fn test_double_retraction_counts_once() {
        let mut store = InstantiationStore::default();
        let id = store.insert(record());
        store.retract(id);
        store.retract(id);
        assert_eq!(store.stats().retracted, 1);
    }
}
