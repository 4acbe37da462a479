use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

/// A constant atom: the only kind of symbol that can appear literally in a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    Str(String),
    Int(i64),
    Float(f64),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // Bit equality keeps `Eq` and `Hash` consistent (NaN == NaN, 0.0 != -0.0)
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl std::hash::Hash for Constant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Self::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Constant {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl Constant {
    /// Ordering used by relational tests.
    ///
    /// Numbers compare numerically across int/float, strings lexically, and mixed
    /// string/number pairs are incomparable.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Numeric view, used by numeric-indifferent selection
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(_) => None,
        }
    }

    /// Get the type name as a string
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
        }
    }
}

/// Handle of an interned constant in a [`SymbolTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstId(u32);

impl ConstId {
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Handle of an identifier in one agent's identifier arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdHandle(u32);

impl IdHandle {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A working-memory atom: an interned constant or an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Symbol {
    Const(ConstId),
    Ident(IdHandle),
}

impl Symbol {
    #[must_use]
    pub const fn as_ident(self) -> Option<IdHandle> {
        match self {
            Self::Ident(id) => Some(id),
            Self::Const(_) => None,
        }
    }

    #[must_use]
    pub const fn as_const(self) -> Option<ConstId> {
        match self {
            Self::Const(c) => Some(c),
            Self::Ident(_) => None,
        }
    }

    #[must_use]
    pub const fn is_ident(self) -> bool {
        matches!(self, Self::Ident(_))
    }
}

/// Globally unique, increasing stamp given to every fact when it enters working memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timetag(pub u64);

impl fmt::Display for Timetag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of timetags. Shared by every agent of a kernel so timetags stay unique process-wide.
#[derive(Debug, Default)]
pub struct TimetagSource {
    next: AtomicU64,
}

impl TimetagSource {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> Timetag {
        Timetag(self.next.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[derive(Debug)]
struct ConstEntry {
    value: Constant,
    refs: AtomicU32,
}

/// Thread-safe interning table for constants.
///
/// This is the only structure agents share across OS threads, so every count
/// goes through atomic increment/decrement. An entry disappears when its last
/// reference is released.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_value: DashMap<Constant, ConstId>,
    entries: DashMap<ConstId, ConstEntry>,
    next_id: AtomicU32,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value`, taking one reference on the returned handle
    pub fn intern(&self, value: impl Into<Constant>) -> ConstId {
        let value = value.into();
        match self.by_value.entry(value) {
            Entry::Occupied(occupied) => {
                let id = *occupied.get();
                if let Some(entry) = self.entries.get(&id) {
                    entry.refs.fetch_add(1, AtomicOrdering::AcqRel);
                }
                id
            }
            Entry::Vacant(vacant) => {
                let id = ConstId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
                self.entries.insert(
                    id,
                    ConstEntry { value: vacant.key().clone(), refs: AtomicU32::new(1) },
                );
                vacant.insert(id);
                id
            }
        }
    }

    /// Intern and return as a [`Symbol`]
    pub fn intern_symbol(&self, value: impl Into<Constant>) -> Symbol {
        Symbol::Const(self.intern(value))
    }

    /// Take an additional reference on an already-held handle
    pub fn add_ref(&self, id: ConstId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.refs.fetch_add(1, AtomicOrdering::AcqRel);
        }
    }

    /// Drop one reference. Returns `false` if the handle was not live.
    pub fn release(&self, id: ConstId) -> bool {
        let orphaned = {
            let Some(entry) = self.entries.get(&id) else {
                return false;
            };
            let previous = entry.refs.fetch_sub(1, AtomicOrdering::AcqRel);
            if previous == 0 {
                entry.refs.store(0, AtomicOrdering::Release);
                return false;
            }
            (previous == 1).then(|| entry.value.clone())
        };

        if let Some(value) = orphaned {
            // A concurrent intern may have revived the entry between the decrement and here.
            let removed = self.by_value.remove_if(&value, |_, held| {
                *held == id
                    && self
                        .entries
                        .get(held)
                        .is_none_or(|entry| entry.refs.load(AtomicOrdering::Acquire) == 0)
            });
            if removed.is_some() {
                self.entries.remove(&id);
            }
        }
        true
    }

    /// Look up a constant without taking a reference
    pub fn find(&self, value: &Constant) -> Option<ConstId> {
        self.by_value.get(value).map(|id| *id)
    }

    /// Value behind a handle
    pub fn value(&self, id: ConstId) -> Option<Constant> {
        self.entries.get(&id).map(|entry| entry.value.clone())
    }

    /// Compare two constants by value for relational tests
    pub fn compare(&self, a: ConstId, b: ConstId) -> Option<Ordering> {
        if a == b {
            return Some(Ordering::Equal);
        }
        let left = self.entries.get(&a)?;
        let right = self.entries.get(&b)?;
        left.value.compare(&right.value)
    }

    /// Current reference count of a handle (0 when not live)
    pub fn refcount(&self, id: ConstId) -> u32 {
        self.entries.get(&id).map_or(0, |entry| entry.refs.load(AtomicOrdering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_intern_shares_handles() {
        let table = SymbolTable::new();
        let a = table.intern("red");
        let b = table.intern("red");
        assert_eq!(a, b);
        assert_eq!(table.refcount(a), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_frees_last_reference() {
        let table = SymbolTable::new();
        let a = table.intern(7i64);
        table.add_ref(a);
        assert!(table.release(a));
        assert_eq!(table.value(a), Some(Constant::Int(7)));
        assert!(table.release(a));
        assert!(table.value(a).is_none());
        assert!(table.find(&Constant::Int(7)).is_none());
        assert!(!table.release(a));
    }

    #[test]
    fn test_numeric_comparison_across_kinds() {
        let table = SymbolTable::new();
        let two = table.intern(2i64);
        let half = table.intern(2.5f64);
        let word = table.intern("two");
        assert_eq!(table.compare(two, half), Some(Ordering::Less));
        assert_eq!(table.compare(half, two), Some(Ordering::Greater));
        assert_eq!(table.compare(two, word), None);
    }

    #[test]
    fn test_concurrent_intern_and_release() {
        let table = Arc::new(SymbolTable::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..500i64 {
                        let id = table.intern(i % 17);
                        table.release(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_timetags_increase() {
        let source = TimetagSource::new();
        let a = source.next();
        let b = source.next();
        assert!(b > a);
    }
}
