//! I/O adapter seam
//!
//! In the input phase the adapter edits facts under the top goal's
//! `^io.input-link`; in the output phase it sees what changed under
//! `^io.output-link` during the cycle.

use crate::error::{EngineError, EngineResult};
use crate::wm::{WmeOrigin, WorkingMemory};
use quiesce_types::{Constant, IdHandle, Symbol, Timetag};

/// Host side of an agent's input and output links
pub trait IoAdapter: Send {
    fn input(&mut self, link: &mut InputLink<'_>) -> EngineResult<()>;

    fn output(&mut self, view: &OutputView<'_>);
}

/// Write access to input facts for the duration of one input phase
#[derive(Debug)]
pub struct InputLink<'a> {
    wm: &'a mut WorkingMemory,
    root: IdHandle,
    cycle: u64,
}

impl<'a> InputLink<'a> {
    pub(crate) fn new(wm: &'a mut WorkingMemory, root: IdHandle, cycle: u64) -> Self {
        Self { wm, root, cycle }
    }

    /// The `^input-link` identifier
    pub fn root(&self) -> IdHandle {
        self.root
    }

    /// Decision cycles completed so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn make_identifier(&mut self, letter: char) -> IdHandle {
        self.wm.make_identifier(letter, Some(1))
    }

    /// Add `(id ^attr value)` with a constant value. An identical input fact
    /// that is already present is returned instead of duplicated.
    pub fn add(&mut self, id: IdHandle, attr: &str, value: impl Into<Constant>) -> EngineResult<Timetag> {
        let symbols = self.wm.symbols().clone();
        let attr = symbols.intern_symbol(attr);
        let value = symbols.intern_symbol(value);
        let added = self.add_symbols(id, attr, value);
        self.wm.symbol_release(attr)?;
        self.wm.symbol_release(value)?;
        added
    }

    /// Add `(id ^attr child)` linking to another identifier
    pub fn add_link(&mut self, id: IdHandle, attr: &str, child: IdHandle) -> EngineResult<Timetag> {
        let attr = self.wm.symbols().intern_symbol(attr);
        let added = self.add_symbols(id, attr, Symbol::Ident(child));
        self.wm.symbol_release(attr)?;
        added
    }

    fn add_symbols(&mut self, id: IdHandle, attr: Symbol, value: Symbol) -> EngineResult<Timetag> {
        let existing = self.wm.wmes_of(id).into_iter().find(|w| {
            w.attr == attr && w.value == value && !w.acceptable && w.origin == WmeOrigin::Input
        });
        match existing {
            Some(wme) => Ok(wme.timetag),
            None => self.wm.add_wme(id, attr, value, false, WmeOrigin::Input),
        }
    }

    /// Remove an input fact; facts made by rules or the architecture are refused
    pub fn remove(&mut self, timetag: Timetag) -> EngineResult<()> {
        match self.wm.wme(timetag) {
            Some(wme) if wme.origin == WmeOrigin::Input => self.wm.remove_wme(timetag).map(|_| ()),
            Some(_) => Err(EngineError::invariant(format!("fact {timetag} was not placed by input"))),
            None => Err(EngineError::invariant(format!("fact {timetag} is not in working memory"))),
        }
    }

    /// Values of `(id ^attr *)`
    pub fn values(&self, id: IdHandle, attr: &str) -> Vec<(Timetag, Symbol)> {
        let Some(attr) = self.wm.symbols().find(&Constant::from(attr)) else {
            return Vec::new();
        };
        self.wm
            .wmes_of(id)
            .into_iter()
            .filter(|w| w.attr == Symbol::Const(attr) && !w.acceptable)
            .map(|w| (w.timetag, w.value))
            .collect()
    }
}

/// An output fact as the adapter sees it
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFact {
    pub timetag: Timetag,
    pub id: String,
    pub attr: String,
    pub value: String,
}

/// Read-only view of the output link at the end of a cycle
#[derive(Debug)]
pub struct OutputView<'a> {
    wm: &'a WorkingMemory,
    root: IdHandle,
    added: Vec<Timetag>,
    removed: Vec<Timetag>,
}

impl<'a> OutputView<'a> {
    pub(crate) fn new(wm: &'a WorkingMemory, root: IdHandle, added: Vec<Timetag>, removed: Vec<Timetag>) -> Self {
        Self { wm, root, added, removed }
    }

    /// The `^output-link` identifier
    pub fn root(&self) -> IdHandle {
        self.root
    }

    /// Output facts added this cycle and still present
    pub fn added(&self) -> Vec<OutputFact> {
        self.added.iter().filter_map(|&t| self.fact(t)).collect()
    }

    pub fn removed(&self) -> &[Timetag] {
        &self.removed
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn fact(&self, timetag: Timetag) -> Option<OutputFact> {
        let wme = self.wm.wme(timetag)?;
        Some(OutputFact {
            timetag,
            id: self.wm.name_of(wme.id),
            attr: self.wm.display(wme.attr),
            value: self.wm.display(wme.value),
        })
    }

    /// Every fact currently under the output link, depth first
    pub fn facts(&self) -> Vec<OutputFact> {
        let reachable = self.wm.reachable_from(&[self.root]);
        let mut facts: Vec<OutputFact> = self
            .wm
            .wmes()
            .filter(|w| reachable.contains(&w.id))
            .filter_map(|w| self.fact(w.timetag))
            .collect();
        facts.sort_by_key(|f| f.timetag);
        facts
    }
}
