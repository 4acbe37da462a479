//! Preferences: the only thing rule actions produce
//!
//! A preference proposes, constrains or ranks one value of one
//! `(identifier, attribute)` slot. Working-memory facts on ordinary slots are
//! derived from the acceptable preferences that survive rejection; the
//! operator slot of each goal is resolved by the decision procedure.

use crate::instantiation::InstId;
use quiesce_types::{IdHandle, Symbol};
use serde::{Deserialize, Serialize};
use std::fmt;

handle!(
    /// Preference stored in working memory
    PrefId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PreferenceKind {
    Acceptable,
    Require,
    Reject,
    Prohibit,
    Better,
    Worse,
    Best,
    Worst,
    UnaryIndifferent,
    BinaryIndifferent,
}

impl PreferenceKind {
    pub const COUNT: usize = 10;

    pub const ALL: [PreferenceKind; PreferenceKind::COUNT] = [
        PreferenceKind::Acceptable,
        PreferenceKind::Require,
        PreferenceKind::Reject,
        PreferenceKind::Prohibit,
        PreferenceKind::Better,
        PreferenceKind::Worse,
        PreferenceKind::Best,
        PreferenceKind::Worst,
        PreferenceKind::UnaryIndifferent,
        PreferenceKind::BinaryIndifferent,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Binary kinds compare the value with a referent
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            PreferenceKind::Better | PreferenceKind::Worse | PreferenceKind::BinaryIndifferent
        )
    }

    /// Kinds that put a value into contention
    pub const fn is_candidate(self) -> bool {
        matches!(self, PreferenceKind::Acceptable | PreferenceKind::Require)
    }

    pub const fn name(self) -> &'static str {
        match self {
            PreferenceKind::Acceptable => "acceptable",
            PreferenceKind::Require => "require",
            PreferenceKind::Reject => "reject",
            PreferenceKind::Prohibit => "prohibit",
            PreferenceKind::Better => "better",
            PreferenceKind::Worse => "worse",
            PreferenceKind::Best => "best",
            PreferenceKind::Worst => "worst",
            PreferenceKind::UnaryIndifferent => "unary-indifferent",
            PreferenceKind::BinaryIndifferent => "binary-indifferent",
        }
    }

    /// Rule-language mark, as printed in traces
    pub const fn mark(self) -> &'static str {
        match self {
            PreferenceKind::Acceptable => "+",
            PreferenceKind::Require => "!",
            PreferenceKind::Reject => "-",
            PreferenceKind::Prohibit => "~",
            PreferenceKind::Better | PreferenceKind::Best => ">",
            PreferenceKind::Worse | PreferenceKind::Worst => "<",
            PreferenceKind::UnaryIndifferent | PreferenceKind::BinaryIndifferent => "=",
        }
    }
}

impl fmt::Display for PreferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How long a preference lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Support {
    /// Persists until explicitly rejected or its identifier becomes unreachable
    O,
    /// Lives exactly as long as the firing that made it still matches
    I,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preference {
    pub kind: PreferenceKind,
    pub id: IdHandle,
    pub attr: Symbol,
    pub value: Symbol,
    pub referent: Option<Symbol>,
    pub support: Support,
    /// Firing that created it; `None` for architecture-made preferences
    pub instantiation: Option<InstId>,
    /// Goal level the creating firing matched at
    pub level: usize,
}

impl Preference {
    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        [Symbol::Ident(self.id), self.attr, self.value].into_iter().chain(self.referent)
    }
}
