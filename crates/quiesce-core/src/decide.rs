//! Preference semantics: turning the preferences of one slot into a choice
//!
//! Precedence, applied in order:
//!
//! 1. require / prohibit
//! 2. reject
//! 3. better / worse (mutual dominance is a conflict)
//! 4. best, then worst
//! 5. indifference, settled by the agent's [`SelectionPolicy`]
//!
//! Ordinary slots stop after step 2 and keep every surviving candidate.

use crate::preference::{Preference, PreferenceKind};
use quiesce_types::{Symbol, SymbolTable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImpasseKind {
    /// Conflicting require/prohibit preferences
    ConstraintFailure,
    /// Candidates that dominate each other
    Conflict,
    /// Several candidates and no way to choose
    Tie,
    /// Nothing proposed and nothing changing
    StateNoChange,
    /// An operator is selected but nothing applies it
    OperatorNoChange,
}

impl ImpasseKind {
    pub const fn name(self) -> &'static str {
        match self {
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::Tie => "tie",
            ImpasseKind::StateNoChange | ImpasseKind::OperatorNoChange => "no-change",
        }
    }
}

impl fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Winner(Symbol),
    Impasse { kind: ImpasseKind, items: Vec<Symbol> },
    Empty,
}

/// A value still in contention when indifference is settled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub value: Symbol,
    /// Sum of numeric-indifferent preferences for this value, if any
    pub numeric: Option<f64>,
}

/// Picks among mutually indifferent candidates. `candidates` is never empty.
pub trait SelectionPolicy: Send + fmt::Debug {
    fn select(&mut self, candidates: &[Candidate]) -> usize;

    fn name(&self) -> &'static str;
}

/// Always the earliest proposed candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCandidate;

impl SelectionPolicy for FirstCandidate {
    fn select(&mut self, _candidates: &[Candidate]) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "first"
    }
}

/// Uniform choice from a seeded generator, reproducible per seed
#[derive(Debug, Clone)]
pub struct RandomChoice {
    rng: StdRng,
}

impl RandomChoice {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl SelectionPolicy for RandomChoice {
    fn select(&mut self, candidates: &[Candidate]) -> usize {
        self.rng.gen_range(0..candidates.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Weighted choice by numeric-indifferent values; candidates without a
/// positive value only win when nobody has one
#[derive(Debug, Clone)]
pub struct NumericWeighted {
    rng: StdRng,
}

impl NumericWeighted {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl SelectionPolicy for NumericWeighted {
    fn select(&mut self, candidates: &[Candidate]) -> usize {
        let weights: Vec<f64> =
            candidates.iter().map(|c| c.numeric.filter(|w| *w > 0.0).unwrap_or(0.0)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return self.rng.gen_range(0..candidates.len());
        }
        let mut point = self.rng.gen_range(0.0..total);
        for (index, weight) in weights.iter().enumerate() {
            if point < *weight {
                return index;
            }
            point -= weight;
        }
        weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "numeric-indifferent"
    }
}

fn push_unique(values: &mut Vec<Symbol>, value: Symbol) {
    if !values.contains(&value) {
        values.push(value);
    }
}

fn values_of<'a>(prefs: &'a [&'a Preference], kind: PreferenceKind) -> impl Iterator<Item = Symbol> + 'a {
    prefs.iter().filter(move |p| p.kind == kind).map(|p| p.value)
}

/// Steps 1 and 2. `Err` carries a constraint failure.
fn constrain(prefs: &[&Preference]) -> Result<Vec<Symbol>, Resolution> {
    let mut required = Vec::new();
    for value in values_of(prefs, PreferenceKind::Require) {
        push_unique(&mut required, value);
    }
    let prohibited: Vec<Symbol> = values_of(prefs, PreferenceKind::Prohibit).collect();

    if !required.is_empty() {
        if required.len() > 1 || prohibited.contains(&required[0]) {
            return Err(Resolution::Impasse { kind: ImpasseKind::ConstraintFailure, items: required });
        }
        return Ok(required);
    }

    let rejected: Vec<Symbol> = values_of(prefs, PreferenceKind::Reject).collect();
    let mut candidates = Vec::new();
    for value in values_of(prefs, PreferenceKind::Acceptable) {
        if !prohibited.contains(&value) && !rejected.contains(&value) {
            push_unique(&mut candidates, value);
        }
    }
    Ok(candidates)
}

/// Values an ordinary slot should hold as facts
pub fn surviving_values(prefs: &[&Preference]) -> Vec<Symbol> {
    match constrain(prefs) {
        Ok(values) => values,
        Err(_) => Vec::new(),
    }
}

/// Full precedence for a context slot
pub fn resolve(
    prefs: &[&Preference],
    policy: &mut dyn SelectionPolicy,
    symbols: &SymbolTable,
) -> Resolution {
    resolve_keeping(prefs, policy, symbols, None)
}

/// Like [`resolve`], but an indifferent choice keeps `current` while it is
/// still a candidate instead of asking the policy again
pub fn resolve_keeping(
    prefs: &[&Preference],
    policy: &mut dyn SelectionPolicy,
    symbols: &SymbolTable,
    current: Option<Symbol>,
) -> Resolution {
    let candidates = match constrain(prefs) {
        Ok(candidates) => candidates,
        Err(failure) => return failure,
    };
    if candidates.is_empty() {
        return Resolution::Empty;
    }
    if prefs.iter().any(|p| p.kind == PreferenceKind::Require) {
        return Resolution::Winner(candidates[0]);
    }

    // better / worse
    let dominates = |a: Symbol, b: Symbol| {
        prefs.iter().any(|p| match (p.kind, p.referent) {
            (PreferenceKind::Better, Some(r)) => p.value == a && r == b,
            (PreferenceKind::Worse, Some(r)) => p.value == b && r == a,
            _ => false,
        })
    };
    let mut conflicted = Vec::new();
    for (i, &a) in candidates.iter().enumerate() {
        for &b in &candidates[i + 1..] {
            if dominates(a, b) && dominates(b, a) {
                push_unique(&mut conflicted, a);
                push_unique(&mut conflicted, b);
            }
        }
    }
    if !conflicted.is_empty() {
        return Resolution::Impasse { kind: ImpasseKind::Conflict, items: conflicted };
    }
    let mut survivors: Vec<Symbol> = candidates
        .iter()
        .copied()
        .filter(|&b| !candidates.iter().any(|&a| a != b && dominates(a, b)))
        .collect();
    if survivors.is_empty() {
        // Dominance cycle longer than two
        return Resolution::Impasse { kind: ImpasseKind::Conflict, items: candidates };
    }

    // best / worst
    let best: Vec<Symbol> = values_of(prefs, PreferenceKind::Best).collect();
    if survivors.iter().any(|v| best.contains(v)) {
        survivors.retain(|v| best.contains(v));
    }
    let worst: Vec<Symbol> = values_of(prefs, PreferenceKind::Worst).collect();
    if survivors.iter().any(|v| !worst.contains(v)) {
        survivors.retain(|v| !worst.contains(v));
    }

    if survivors.len() == 1 {
        return Resolution::Winner(survivors[0]);
    }

    // indifference
    let numeric_of = |value: Symbol| -> Option<f64> {
        let mut total = None;
        for p in prefs.iter().filter(|p| p.kind == PreferenceKind::BinaryIndifferent && p.value == value) {
            if let Some(n) = p.referent.and_then(|r| numeric_constant(r, symbols)) {
                total = Some(total.unwrap_or(0.0) + n);
            }
        }
        total
    };
    let unary = |value: Symbol| {
        prefs.iter().any(|p| p.kind == PreferenceKind::UnaryIndifferent && p.value == value)
            || numeric_of(value).is_some()
    };
    let binary = |a: Symbol, b: Symbol| {
        prefs.iter().any(|p| {
            p.kind == PreferenceKind::BinaryIndifferent
                && ((p.value == a && p.referent == Some(b)) || (p.value == b && p.referent == Some(a)))
        })
    };
    let all_indifferent = survivors.iter().enumerate().all(|(i, &a)| {
        survivors[i + 1..].iter().all(|&b| (unary(a) && unary(b)) || binary(a, b))
    });
    if !all_indifferent {
        return Resolution::Impasse { kind: ImpasseKind::Tie, items: survivors };
    }

    if let Some(current) = current.filter(|c| survivors.contains(c)) {
        return Resolution::Winner(current);
    }
    let pool: Vec<Candidate> =
        survivors.iter().map(|&value| Candidate { value, numeric: numeric_of(value) }).collect();
    let chosen = policy.select(&pool).min(pool.len() - 1);
    Resolution::Winner(pool[chosen].value)
}

fn numeric_constant(symbol: Symbol, symbols: &SymbolTable) -> Option<f64> {
    symbols.value(symbol.as_const()?)?.as_f64()
}
