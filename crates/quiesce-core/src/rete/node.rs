//! Node, token and alpha-memory types of the matching network

use super::{AlphaId, InstId, NodeId, ProductionId, TokenId};
use crate::production::Relation;
use quiesce_types::{ConstId, Symbol, Timetag};
use serde::{Deserialize, Serialize};

/// One of the three positions of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Id = 0,
    Attr = 1,
    Value = 2,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Id, Field::Attr, Field::Value];
}

/// Fact as the network sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetWme {
    pub timetag: Timetag,
    pub fields: [Symbol; 3],
    pub acceptable: bool,
    /// Goal flags of the identifier, fixed for the fact's lifetime
    pub id_is_goal: bool,
    pub id_is_impasse: bool,
}

impl NetWme {
    pub fn field(&self, field: Field) -> Symbol {
        self.fields[field as usize]
    }
}

/// Constant-equality tests an alpha memory is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaKey {
    pub attr: Option<Symbol>,
    pub value: Option<Symbol>,
    pub acceptable: bool,
}

impl AlphaKey {
    /// The four keys a fact can fall under
    pub fn probes(wme: &NetWme) -> [AlphaKey; 4] {
        let attr = Some(wme.field(Field::Attr));
        let value = Some(wme.field(Field::Value));
        let acceptable = wme.acceptable;
        [
            AlphaKey { attr: None, value: None, acceptable },
            AlphaKey { attr, value: None, acceptable },
            AlphaKey { attr: None, value, acceptable },
            AlphaKey { attr, value, acceptable },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct AlphaMemory {
    pub key: AlphaKey,
    pub wmes: Vec<Timetag>,
    /// Join and negative nodes; newest first so descendants fire before ancestors
    pub successors: Vec<NodeId>,
}

/// Test performed when a fact meets a token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinTest {
    /// Compare a field of the new fact with a field bound `levels_up` tokens above
    Binding { field: Field, levels_up: usize, other: Field, relation: Option<Relation> },
    /// Compare two fields of the new fact
    Intra { field: Field, other: Field, relation: Option<Relation> },
    /// Compare a field with a symbol not captured by the alpha key
    Constant { field: Field, relation: Option<Relation>, value: Symbol },
    Disjunction { field: Field, values: Vec<ConstId> },
    Goal,
    Impasse,
}

impl JoinTest {
    pub fn constants(&self) -> Vec<ConstId> {
        match self {
            JoinTest::Constant { value: Symbol::Const(c), .. } => vec![*c],
            JoinTest::Disjunction { values, .. } => values.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Dummy top node holding the root token
    Root,
    Join { amem: AlphaId, tests: Vec<JoinTest> },
    Memory,
    Negative { amem: AlphaId, tests: Vec<JoinTest> },
    Ncc { partner: NodeId },
    NccPartner { ncc: NodeId, conjuncts: usize, new_results: Vec<TokenId> },
    Terminal { production: ProductionId },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Join { .. } => "join",
            NodeKind::Memory => "memory",
            NodeKind::Negative { .. } => "negative",
            NodeKind::Ncc { .. } => "ncc",
            NodeKind::NccPartner { .. } => "ncc-partner",
            NodeKind::Terminal { .. } => "terminal",
        }
    }

    /// Nodes that own a token list
    pub fn stores_tokens(&self) -> bool {
        !matches!(self, NodeKind::Join { .. } | NodeKind::NccPartner { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ReteNode {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub tokens: Vec<TokenId>,
}

impl ReteNode {
    pub fn new(parent: Option<NodeId>, kind: NodeKind) -> Self {
        Self { parent, children: Vec::new(), kind, tokens: Vec::new() }
    }
}

/// Partial match: one fact (or none, for negated levels) on top of its parent
#[derive(Debug, Clone)]
pub struct Token {
    pub parent: Option<TokenId>,
    pub wme: Option<Timetag>,
    pub node: NodeId,
    pub children: Vec<TokenId>,
    /// Negative nodes: facts currently blocking this token
    pub join_results: Vec<Timetag>,
    /// Ncc nodes: subnetwork results blocking this token
    pub ncc_results: Vec<TokenId>,
    /// Ncc partner results: the ncc token they block
    pub owner: Option<TokenId>,
    /// Terminal tokens: the firing built from this match
    pub instantiation: Option<InstId>,
}

impl Token {
    pub fn new(parent: Option<TokenId>, wme: Option<Timetag>, node: NodeId) -> Self {
        Self {
            parent,
            wme,
            node,
            children: Vec::new(),
            join_results: Vec::new(),
            ncc_results: Vec::new(),
            owner: None,
            instantiation: None,
        }
    }
}

/// Network bookkeeping for one fact
#[derive(Debug, Clone)]
pub struct WmeEntry {
    pub wme: NetWme,
    pub amems: Vec<AlphaId>,
    pub tokens: Vec<TokenId>,
    /// Negative-node tokens this fact blocks
    pub negative_join_results: Vec<TokenId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_probes_cover_all_combinations() {
        let table = quiesce_types::SymbolTable::new();
        let wme = NetWme {
            timetag: Timetag(1),
            fields: [
                Symbol::Ident(quiesce_types::IdHandle::new(0)),
                table.intern_symbol("color"),
                table.intern_symbol("red"),
            ],
            acceptable: false,
            id_is_goal: false,
            id_is_impasse: false,
        };
        let probes = AlphaKey::probes(&wme);
        assert!(probes.iter().all(|key| !key.acceptable));
        assert_eq!(probes.iter().filter(|key| key.attr.is_some()).count(), 2);
        assert_eq!(probes.iter().filter(|key| key.value.is_some()).count(), 2);
    }
}
