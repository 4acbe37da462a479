//! Incremental match network
//!
//! A Doorenbos-style RETE: facts are classified by hashed alpha memories,
//! partial matches live as tokens in a tree that mirrors the node tree, and
//! every change to working memory or to the rule set updates the stored
//! matches instead of recomputing them.
//!
//! ```text
//! facts -> alpha memories -> join / negative / ncc nodes -> terminal nodes
//!                              |                             |
//!                           tokens                 pending assertions/retractions
//! ```
//!
//! The network never fires anything. Completed matches and withdrawn matches
//! are queued; the agent drains both queues at the phase boundaries it chooses.

mod build;
mod node;
mod persist;
mod propagate;

pub use node::{AlphaKey, Field, JoinTest, NetWme, NodeKind};
pub use persist::NetworkImage;

use crate::error::{EngineError, EngineResult};
use crate::instantiation::InstId;
use crate::preference::{PreferenceKind, Support};
use crate::production::{Production, Relation};
use crate::arena::Arena;
use ahash::AHashMap;
use node::{AlphaMemory, ReteNode, Token, WmeEntry};
use quiesce_types::{Constant, IdHandle, Symbol, SymbolTable, Timetag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

handle!(
    /// Node of the beta network
    NodeId
);
handle!(AlphaId);
handle!(TokenId);
handle!(
    /// Rule installed in the network
    ProductionId
);

/// Where a variable is first bound: condition level (1-based) and field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub level: usize,
    pub field: Field,
}

/// Rule action with its variables replaced by binding locations, used to spot duplicates
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CanonicalValue {
    Const(Constant),
    Ident(IdHandle),
    Bound(Location),
    /// Unbound variable, numbered by first appearance
    Fresh(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CanonicalAction {
    Make {
        id: CanonicalValue,
        attr: CanonicalValue,
        value: CanonicalValue,
        preference: PreferenceKind,
        referent: Option<CanonicalValue>,
    },
    Halt,
}

#[derive(Debug, Clone)]
pub struct ProductionRecord {
    pub production: Production,
    pub terminal: NodeId,
    /// First binding of every variable of the positive top-level conditions
    pub bindings: AHashMap<String, Location>,
    pub(crate) canonical: Vec<CanonicalAction>,
    pub(crate) support: Option<Support>,
}

/// Completed match waiting to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assertion {
    pub production: ProductionId,
    pub token: TokenId,
}

/// Fired match whose conditions stopped holding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retraction {
    pub production: ProductionId,
    pub instantiation: InstId,
}

/// A firing a newly learned rule should adopt instead of refiring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refraction {
    pub wmes: Vec<Option<Timetag>>,
    pub instantiation: InstId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    NotRefracted,
    RefractedMatched,
    RefractedUnmatched,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub productions: usize,
    pub nodes: usize,
    pub join_nodes: usize,
    pub negative_nodes: usize,
    pub ncc_nodes: usize,
    pub alpha_memories: usize,
    pub tokens: usize,
    pub wmes: usize,
    pub pending_assertions: usize,
    pub pending_retractions: usize,
    pub activations: u64,
}

#[derive(Debug)]
struct RefractionState {
    request: Refraction,
    matched: bool,
}

/// The match network of one agent
#[derive(Debug)]
pub struct Rete {
    symbols: Arc<SymbolTable>,
    nodes: Arena<ReteNode>,
    alphas: Arena<AlphaMemory>,
    alpha_index: AHashMap<AlphaKey, AlphaId>,
    tokens: Arena<Token>,
    wmes: AHashMap<Timetag, WmeEntry>,
    productions: Arena<ProductionRecord>,
    by_name: AHashMap<String, ProductionId>,
    root: NodeId,
    root_token: TokenId,
    pending_assertions: Vec<Assertion>,
    pending_retractions: Vec<Retraction>,
    refraction: Option<RefractionState>,
    max_nodes: usize,
    activations: u64,
}

// ============================================================================
// NETWORK LIFECYCLE
// ============================================================================

impl Rete {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        let mut nodes = Arena::default();
        let root = NodeId(nodes.insert(ReteNode::new(None, NodeKind::Root)));
        let mut tokens = Arena::default();
        let root_token = TokenId(tokens.insert(Token::new(None, None, root)));
        nodes[root.0].tokens.push(root_token);
        Self {
            symbols,
            nodes,
            alphas: Arena::default(),
            alpha_index: AHashMap::new(),
            tokens,
            wmes: AHashMap::new(),
            productions: Arena::default(),
            by_name: AHashMap::new(),
            root,
            root_token,
            pending_assertions: Vec::new(),
            pending_retractions: Vec::new(),
            refraction: None,
            max_nodes: usize::MAX,
            activations: 0,
        }
    }

    pub fn set_max_nodes(&mut self, max_nodes: usize) {
        self.max_nodes = max_nodes;
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats {
            productions: self.productions.len(),
            nodes: self.nodes.len(),
            alpha_memories: self.alphas.len(),
            tokens: self.tokens.len(),
            wmes: self.wmes.len(),
            pending_assertions: self.pending_assertions.len(),
            pending_retractions: self.pending_retractions.len(),
            activations: self.activations,
            ..NetworkStats::default()
        };
        for (_, node) in self.nodes.iter() {
            match node.kind {
                NodeKind::Join { .. } => stats.join_nodes += 1,
                NodeKind::Negative { .. } => stats.negative_nodes += 1,
                NodeKind::Ncc { .. } => stats.ncc_nodes += 1,
                _ => {}
            }
        }
        stats
    }

    // ------------------------------------------------------------------------
    // Rule set
    // ------------------------------------------------------------------------

    /// Compile a rule into the network, sharing existing nodes where possible.
    ///
    /// With `refraction`, a completed match over exactly the given facts is
    /// bound to the given instantiation instead of being queued.
    #[instrument(skip(self, production, refraction), fields(rule = %production.name))]
    pub fn add_production(
        &mut self,
        production: Production,
        refraction: Option<Refraction>,
    ) -> EngineResult<(ProductionId, AddOutcome)> {
        production.validate()?;
        if self.by_name.contains_key(&production.name) {
            let existing = production.name.clone();
            return Err(EngineError::DuplicateRule { rule: production.name, existing });
        }
        let wants_refraction = refraction.is_some();
        self.refraction = refraction.map(|request| RefractionState { request, matched: false });
        let built = self.build_production(production);
        let refraction = self.refraction.take();
        let id = built?;

        let outcome = match refraction {
            _ if !wants_refraction => AddOutcome::NotRefracted,
            Some(RefractionState { matched: true, .. }) => AddOutcome::RefractedMatched,
            _ => AddOutcome::RefractedUnmatched,
        };
        debug!(production = id.0, ?outcome, nodes = self.nodes.len(), "rule added");
        Ok((id, outcome))
    }

    /// Excise a rule. Every current match of it becomes a pending retraction
    /// (fired) or is dropped from the assertion queue (not yet fired).
    #[instrument(skip(self))]
    pub fn remove_production(&mut self, id: ProductionId) -> EngineResult<Production> {
        let Some(record) = self.productions.get(id.0) else {
            return Err(EngineError::UnknownRule { name: format!("#{}", id.0) });
        };
        let terminal = record.terminal;
        self.delete_node_and_unused_ancestors(terminal);
        let record = self
            .productions
            .remove(id.0)
            .ok_or_else(|| EngineError::invariant("production vanished during excise"))?;
        self.by_name.remove(&record.production.name);
        debug!(rule = %record.production.name, nodes = self.nodes.len(), "rule excised");
        Ok(record.production)
    }

    pub fn find_production(&self, name: &str) -> Option<ProductionId> {
        self.by_name.get(name).copied()
    }

    pub fn production(&self, id: ProductionId) -> Option<&ProductionRecord> {
        self.productions.get(id.0)
    }

    pub fn productions(&self) -> impl Iterator<Item = (ProductionId, &ProductionRecord)> {
        self.productions.iter().map(|(index, record)| (ProductionId(index), record))
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    // ------------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------------

    /// Feed a new fact through the alpha memories and on into the beta network
    pub fn add_wme(&mut self, wme: NetWme) {
        let timetag = wme.timetag;
        self.wmes.insert(
            timetag,
            WmeEntry { wme, amems: Vec::new(), tokens: Vec::new(), negative_join_results: Vec::new() },
        );
        for key in AlphaKey::probes(&wme) {
            if let Some(&amem) = self.alpha_index.get(&key) {
                self.alpha_activate(amem, timetag);
            }
        }
    }

    /// Withdraw a fact and every partial match built on it
    pub fn remove_wme(&mut self, timetag: Timetag) -> EngineResult<()> {
        if !self.wmes.contains_key(&timetag) {
            return Err(EngineError::invariant(format!("fact {timetag} is not in the network")));
        }
        self.retract_wme(timetag);
        self.wmes.remove(&timetag);
        Ok(())
    }

    pub fn wme(&self, timetag: Timetag) -> Option<&NetWme> {
        self.wmes.get(&timetag).map(|entry| &entry.wme)
    }

    pub fn wme_count(&self) -> usize {
        self.wmes.len()
    }

    // ------------------------------------------------------------------------
    // Match queues
    // ------------------------------------------------------------------------

    pub fn take_assertions(&mut self) -> Vec<Assertion> {
        std::mem::take(&mut self.pending_assertions)
    }

    pub fn take_retractions(&mut self) -> Vec<Retraction> {
        std::mem::take(&mut self.pending_retractions)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_assertions.is_empty() || !self.pending_retractions.is_empty()
    }

    pub fn pending_assertions(&self) -> &[Assertion] {
        &self.pending_assertions
    }

    pub fn pending_retractions(&self) -> &[Retraction] {
        &self.pending_retractions
    }

    /// Put back assertions that were taken but not fired this phase
    pub fn requeue_assertions(&mut self, assertions: Vec<Assertion>) {
        let live: Vec<Assertion> =
            assertions.into_iter().filter(|a| self.tokens.get(a.token.0).is_some()).collect();
        self.pending_assertions.splice(0..0, live);
    }

    /// Record which instantiation a fired match produced
    pub fn bind_instantiation(&mut self, token: TokenId, instantiation: InstId) {
        if let Some(token) = self.tokens.get_mut(token.0) {
            token.instantiation = Some(instantiation);
        }
    }

    /// Facts of a completed match, one entry per top-level condition; `None` for negated ones
    pub fn token_wmes(&self, token: TokenId) -> Vec<Option<Timetag>> {
        let mut wmes = Vec::new();
        let mut current = Some(token);
        while let Some(id) = current {
            if id == self.root_token {
                break;
            }
            let token = &self.tokens[id.0];
            wmes.push(token.wme);
            current = token.parent;
        }
        wmes.reverse();
        wmes
    }

    /// Every completed match currently stored, fired or not
    pub fn current_matches(&self) -> Vec<(ProductionId, Vec<Option<Timetag>>)> {
        let mut matches = Vec::new();
        for (id, _) in self.productions() {
            for wmes in self.matches_of(id) {
                matches.push((id, wmes));
            }
        }
        matches
    }

    pub fn matches_of(&self, id: ProductionId) -> Vec<Vec<Option<Timetag>>> {
        let Some(record) = self.productions.get(id.0) else {
            return Vec::new();
        };
        self.nodes[record.terminal.0].tokens.iter().map(|&token| self.token_wmes(token)).collect()
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    fn compare(&self, left: Symbol, right: Symbol, relation: Option<Relation>) -> bool {
        match relation {
            None => left == right,
            Some(Relation::NotEqual) => left != right,
            Some(relation) => match (left, right) {
                (Symbol::Const(a), Symbol::Const(b)) => {
                    self.symbols.compare(a, b).is_some_and(|ordering| relation.holds(ordering))
                }
                _ => false,
            },
        }
    }

    fn ancestor_wme(&self, token: TokenId, levels_up: usize) -> Option<&NetWme> {
        let mut current = token;
        for _ in 0..levels_up {
            current = self.tokens[current.0].parent?;
        }
        let timetag = self.tokens[current.0].wme?;
        self.wmes.get(&timetag).map(|entry| &entry.wme)
    }

    fn passes(&self, tests: &[JoinTest], token: TokenId, wme: &NetWme) -> bool {
        tests.iter().all(|test| match test {
            JoinTest::Binding { field, levels_up, other, relation } => self
                .ancestor_wme(token, *levels_up)
                .is_some_and(|bound| self.compare(wme.field(*field), bound.field(*other), *relation)),
            JoinTest::Intra { field, other, relation } => {
                self.compare(wme.field(*field), wme.field(*other), *relation)
            }
            JoinTest::Constant { field, relation, value } => {
                self.compare(wme.field(*field), *value, *relation)
            }
            JoinTest::Disjunction { field, values } => {
                wme.field(*field).as_const().is_some_and(|c| values.contains(&c))
            }
            JoinTest::Goal => wme.id_is_goal,
            JoinTest::Impasse => wme.id_is_impasse,
        })
    }
}

#[cfg(test)]
mod tests;
