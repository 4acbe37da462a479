//! Rule compilation with node sharing, and excise
//!
//! Conditions compile top-down: each positive condition becomes a memory node
//! (except directly under the root) followed by a join node, each negated
//! condition a negative node, and each conjunctive negation a subnetwork
//! closed by an ncc/partner pair. Any node an existing rule already built
//! with identical tests is reused.

use super::node::{AlphaMemory, JoinTest, NodeKind, ReteNode};
use super::propagate::Activation;
use super::{
    AlphaId, AlphaKey, CanonicalAction, CanonicalValue, Field, Location, NodeId, ProductionId,
    ProductionRecord, Rete,
};
use crate::error::{EngineError, EngineResult, Resource};
use crate::production::{Action, Condition, Operand, Pattern, Production, RhsValue, Test};
use ahash::AHashMap;
use quiesce_types::Symbol;
use tracing::trace;

type Bindings = AHashMap<String, Location>;

impl Rete {
    pub(super) fn build_production(&mut self, production: Production) -> EngineResult<ProductionId> {
        let mut bindings = Bindings::new();
        let mut created = Vec::new();
        let bottom = match self.build_conditions(self.root, &production.conditions, 0, &mut bindings, &mut created)
        {
            Ok(bottom) => bottom,
            Err(err) => {
                self.rollback(&created);
                return Err(err);
            }
        };

        let canonical = canonicalize(&production, &bindings);
        if let Some(existing) = self.find_duplicate(bottom, &canonical, &production) {
            self.rollback(&created);
            return Err(EngineError::DuplicateRule { rule: production.name, existing });
        }
        if let Err(err) = self.check_node_budget() {
            self.rollback(&created);
            return Err(err);
        }

        let name = production.name.clone();
        let support = production.support;
        let id = ProductionId(self.productions.insert(ProductionRecord {
            production,
            terminal: self.root,
            bindings,
            canonical,
            support,
        }));
        let terminal = self.attach_node(bottom, NodeKind::Terminal { production: id });
        self.productions[id.0].terminal = terminal;
        self.by_name.insert(name, id);
        self.update_new_node(terminal);
        Ok(id)
    }

    fn build_conditions(
        &mut self,
        parent: NodeId,
        conditions: &[Condition],
        depth: usize,
        bindings: &mut Bindings,
        created: &mut Vec<NodeId>,
    ) -> EngineResult<NodeId> {
        let mut current = parent;
        let mut level = depth;
        for condition in conditions {
            level += 1;
            current = match condition {
                Condition::Positive(pattern) => {
                    let (key, tests, binds) = self.compile_pattern(pattern, level, bindings);
                    let base = if current == self.root {
                        current
                    } else {
                        self.share_or_create(current, NodeKind::Memory, created)?
                    };
                    let amem = self.share_or_create_alpha(key);
                    let join = self.share_or_create(base, NodeKind::Join { amem, tests }, created);
                    self.release_alpha_if_unused(amem);
                    for (var, field) in binds {
                        bindings.entry(var).or_insert(Location { level, field });
                    }
                    join?
                }
                Condition::Negative(pattern) => {
                    let (key, tests, _) = self.compile_pattern(pattern, level, bindings);
                    let amem = self.share_or_create_alpha(key);
                    let negative = self.share_or_create(current, NodeKind::Negative { amem, tests }, created);
                    self.release_alpha_if_unused(amem);
                    negative?
                }
                Condition::Conjunctive(inner) => {
                    let mut scope = bindings.clone();
                    let bottom = self.build_conditions(current, inner, level - 1, &mut scope, created)?;
                    self.share_or_create_ncc(current, bottom, inner.len(), created)?
                }
            };
        }
        Ok(current)
    }

    /// Alpha key, join tests, and the variables this pattern binds first
    fn compile_pattern(
        &self,
        pattern: &Pattern,
        level: usize,
        bindings: &Bindings,
    ) -> (AlphaKey, Vec<JoinTest>, Vec<(String, Field)>) {
        let fields = [(Field::Id, &pattern.id), (Field::Attr, &pattern.attr), (Field::Value, &pattern.value)];

        let mut local: Vec<(String, Field)> = Vec::new();
        for (field, test) in fields {
            for var in test.equality_vars() {
                if !bindings.contains_key(var) && !local.iter().any(|(bound, _)| bound == var) {
                    local.push((var.to_string(), field));
                }
            }
        }
        let local_field =
            |var: &str| local.iter().find(|(bound, _)| bound == var).map(|(_, field)| *field);

        let mut key = AlphaKey { attr: None, value: None, acceptable: pattern.acceptable };
        let mut tests = Vec::new();
        for (field, test) in fields {
            let mut keyed = field == Field::Id;
            for part in test.flatten() {
                match part {
                    Test::Blank | Test::Conjunction(_) => {}
                    Test::Goal => tests.push(JoinTest::Goal),
                    Test::Impasse => tests.push(JoinTest::Impasse),
                    Test::Equal(Operand::Var(var)) => {
                        if let Some(location) = bindings.get(var) {
                            tests.push(JoinTest::Binding {
                                field,
                                levels_up: (level - 1).saturating_sub(location.level),
                                other: location.field,
                                relation: None,
                            });
                        } else if let Some(first) = local_field(var).filter(|first| *first != field) {
                            tests.push(JoinTest::Intra { field, other: first, relation: None });
                        }
                    }
                    Test::Equal(operand) => {
                        let value = self.operand_symbol(operand);
                        if keyed {
                            tests.push(JoinTest::Constant { field, relation: None, value });
                        } else {
                            keyed = true;
                            match field {
                                Field::Attr => key.attr = Some(value),
                                _ => key.value = Some(value),
                            }
                        }
                    }
                    Test::Relation(relation, Operand::Var(var)) => {
                        if let Some(location) = bindings.get(var) {
                            tests.push(JoinTest::Binding {
                                field,
                                levels_up: (level - 1).saturating_sub(location.level),
                                other: location.field,
                                relation: Some(*relation),
                            });
                        } else if let Some(first) = local_field(var) {
                            tests.push(JoinTest::Intra { field, other: first, relation: Some(*relation) });
                        }
                    }
                    Test::Relation(relation, operand) => {
                        let value = self.operand_symbol(operand);
                        tests.push(JoinTest::Constant { field, relation: Some(*relation), value });
                    }
                    Test::Disjunction(values) => {
                        let values = values.iter().map(|value| self.symbols.intern(value.clone())).collect();
                        tests.push(JoinTest::Disjunction { field, values });
                    }
                }
            }
        }
        (key, tests, local)
    }

    /// Interns constants; the caller owns the reference taken
    fn operand_symbol(&self, operand: &Operand) -> Symbol {
        match operand {
            Operand::Const(value) => self.symbols.intern_symbol(value.clone()),
            Operand::Ident(id) => Symbol::Ident(*id),
            Operand::Var(_) => unreachable!("variables are compiled into binding tests"),
        }
    }

    // ------------------------------------------------------------------------
    // Sharing
    // ------------------------------------------------------------------------

    fn share_or_create_alpha(&mut self, key: AlphaKey) -> AlphaId {
        if let Some(&existing) = self.alpha_index.get(&key) {
            self.release_key(&key);
            return existing;
        }
        let id = AlphaId(self.alphas.insert(AlphaMemory { key, wmes: Vec::new(), successors: Vec::new() }));
        self.alpha_index.insert(key, id);

        let mut matching: Vec<_> = self
            .wmes
            .values()
            .filter(|entry| AlphaKey::probes(&entry.wme).contains(&key))
            .map(|entry| entry.wme.timetag)
            .collect();
        matching.sort();
        for timetag in &matching {
            if let Some(entry) = self.wmes.get_mut(timetag) {
                entry.amems.push(id);
            }
        }
        self.alphas[id.0].wmes = matching;
        trace!(alpha = id.0, "alpha memory created");
        id
    }

    fn share_or_create(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        created: &mut Vec<NodeId>,
    ) -> EngineResult<NodeId> {
        let shared = self.nodes[parent.0].children.iter().copied().find(|&child| {
            match (&self.nodes[child.0].kind, &kind) {
                (NodeKind::Memory, NodeKind::Memory) => true,
                (NodeKind::Join { amem: a, tests: x }, NodeKind::Join { amem: b, tests: y })
                | (NodeKind::Negative { amem: a, tests: x }, NodeKind::Negative { amem: b, tests: y }) => {
                    a == b && x == y
                }
                _ => false,
            }
        });
        if let Some(node) = shared {
            self.release_kind(&kind);
            return Ok(node);
        }
        if let Err(err) = self.check_node_budget() {
            self.release_kind(&kind);
            return Err(err);
        }
        let stores_tokens = kind.stores_tokens();
        let node = self.attach_node(parent, kind);
        created.push(node);
        if stores_tokens {
            self.update_new_node(node);
        }
        Ok(node)
    }

    fn share_or_create_ncc(
        &mut self,
        parent: NodeId,
        bottom: NodeId,
        conjuncts: usize,
        created: &mut Vec<NodeId>,
    ) -> EngineResult<NodeId> {
        let shared = self.nodes[parent.0].children.iter().copied().find(|&child| {
            matches!(self.nodes[child.0].kind, NodeKind::Ncc { partner }
                if self.nodes.get(partner.0).and_then(|p| p.parent) == Some(bottom))
        });
        if let Some(node) = shared {
            return Ok(node);
        }
        if self.nodes.len() + 2 > self.max_nodes {
            return Err(EngineError::ResourceExhaustion { resource: Resource::NetworkNodes, limit: self.max_nodes });
        }

        // The partner needs the ncc id and the ncc needs the partner id
        let partner = self.attach_node(
            bottom,
            NodeKind::NccPartner { ncc: self.root, conjuncts, new_results: Vec::new() },
        );
        let ncc = self.attach_node(parent, NodeKind::Ncc { partner });
        if let NodeKind::NccPartner { ncc: slot, .. } = &mut self.nodes[partner.0].kind {
            *slot = ncc;
        }
        created.push(ncc);
        created.push(partner);
        self.update_new_node(ncc);
        self.update_new_node(partner);
        Ok(ncc)
    }

    fn attach_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let amem = match &kind {
            NodeKind::Join { amem, .. } | NodeKind::Negative { amem, .. } => Some(*amem),
            _ => None,
        };
        let id = NodeId(self.nodes.insert(ReteNode::new(Some(parent), kind)));
        self.nodes[parent.0].children.push(id);
        if let Some(amem) = amem {
            self.alphas[amem.0].successors.insert(0, id);
        }
        trace!(node = id.0, kind = self.nodes[id.0].kind.name(), "node created");
        id
    }

    fn check_node_budget(&self) -> EngineResult<()> {
        if self.nodes.len() >= self.max_nodes {
            return Err(EngineError::ResourceExhaustion {
                resource: Resource::NetworkNodes,
                limit: self.max_nodes,
            });
        }
        Ok(())
    }

    /// Fill a freshly attached node with the matches its parent already holds
    pub(super) fn update_new_node(&mut self, node: NodeId) {
        let Some(parent) = self.nodes[node.0].parent else { return };
        match self.nodes[parent.0].kind.clone() {
            NodeKind::Root | NodeKind::Memory => {
                for token in self.nodes[parent.0].tokens.clone() {
                    self.propagate(node, Activation::Left { token, wme: None });
                }
            }
            NodeKind::Join { amem, .. } => {
                let saved = std::mem::replace(&mut self.nodes[parent.0].children, vec![node]);
                for wme in self.alphas[amem.0].wmes.clone() {
                    self.propagate(parent, Activation::Right { wme });
                }
                self.nodes[parent.0].children = saved;
            }
            NodeKind::Negative { .. } => {
                let unblocked: Vec<_> = self.nodes[parent.0]
                    .tokens
                    .iter()
                    .copied()
                    .filter(|token| self.tokens[token.0].join_results.is_empty())
                    .collect();
                for token in unblocked {
                    self.propagate(node, Activation::Left { token, wme: None });
                }
            }
            NodeKind::Ncc { .. } => {
                let unblocked: Vec<_> = self.nodes[parent.0]
                    .tokens
                    .iter()
                    .copied()
                    .filter(|token| self.tokens[token.0].ncc_results.is_empty())
                    .collect();
                for token in unblocked {
                    self.propagate(node, Activation::Left { token, wme: None });
                }
            }
            NodeKind::NccPartner { .. } | NodeKind::Terminal { .. } => {}
        }
    }

    fn find_duplicate(
        &self,
        bottom: NodeId,
        canonical: &[CanonicalAction],
        production: &Production,
    ) -> Option<String> {
        self.nodes[bottom.0].children.iter().find_map(|&child| match self.nodes[child.0].kind {
            NodeKind::Terminal { production: existing } => {
                let record = self.productions.get(existing.0)?;
                (record.canonical == canonical && record.support == production.support)
                    .then(|| record.production.name.clone())
            }
            _ => None,
        })
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    pub(super) fn delete_node_and_unused_ancestors(&mut self, node: NodeId) {
        if let NodeKind::Ncc { partner } = self.nodes[node.0].kind {
            self.delete_node_and_unused_ancestors(partner);
        }
        let parent = self.remove_node(node);
        if let Some(parent) = parent {
            if parent != self.root && self.nodes[parent.0].children.is_empty() {
                self.delete_node_and_unused_ancestors(parent);
            }
        }
    }

    /// Undo the nodes a failed compilation attached, newest first
    fn rollback(&mut self, created: &[NodeId]) {
        for &node in created.iter().rev() {
            if self.nodes.get(node.0).is_some_and(|found| found.children.is_empty()) {
                self.remove_node(node);
            }
        }
    }

    fn remove_node(&mut self, node: NodeId) -> Option<NodeId> {
        while let Some(&token) = self.nodes.get(node.0).and_then(|found| found.tokens.last()) {
            self.delete_token_and_descendants(token);
        }
        if let Some(NodeKind::NccPartner { new_results, .. }) =
            self.nodes.get_mut(node.0).map(|found| &mut found.kind)
        {
            for token in std::mem::take(new_results) {
                self.delete_token_and_descendants(token);
            }
        }

        let removed = self.nodes.remove(node.0)?;
        if let Some(parent) = removed.parent.and_then(|parent| self.nodes.get_mut(parent.0)) {
            parent.children.retain(|&child| child != node);
        }
        if let NodeKind::Join { amem, .. } | NodeKind::Negative { amem, .. } = &removed.kind {
            if let Some(memory) = self.alphas.get_mut(amem.0) {
                memory.successors.retain(|&successor| successor != node);
            }
            self.release_alpha_if_unused(*amem);
        }
        self.release_kind(&removed.kind);
        removed.parent
    }

    fn release_alpha_if_unused(&mut self, amem: AlphaId) {
        if !self.alphas.get(amem.0).is_some_and(|memory| memory.successors.is_empty()) {
            return;
        }
        if let Some(memory) = self.alphas.remove(amem.0) {
            self.alpha_index.remove(&memory.key);
            for timetag in &memory.wmes {
                if let Some(entry) = self.wmes.get_mut(timetag) {
                    entry.amems.retain(|&a| a != amem);
                }
            }
            self.release_key(&memory.key);
        }
    }

    fn release_key(&self, key: &AlphaKey) {
        for symbol in [key.attr, key.value].into_iter().flatten() {
            if let Symbol::Const(constant) = symbol {
                self.symbols.release(constant);
            }
        }
    }

    fn release_kind(&self, kind: &NodeKind) {
        if let NodeKind::Join { tests, .. } | NodeKind::Negative { tests, .. } = kind {
            for constant in tests.iter().flat_map(JoinTest::constants) {
                self.symbols.release(constant);
            }
        }
    }
}

/// Replace variables by where they are bound so that renamed copies compare equal
pub(super) fn canonicalize(production: &Production, bindings: &Bindings) -> Vec<CanonicalAction> {
    let mut fresh: AHashMap<String, usize> = AHashMap::new();
    let mut value = |rhs: &RhsValue| -> CanonicalValue {
        match rhs {
            RhsValue::Const(constant) => CanonicalValue::Const(constant.clone()),
            RhsValue::Ident(id) => CanonicalValue::Ident(*id),
            RhsValue::Var(var) => match bindings.get(var) {
                Some(location) => CanonicalValue::Bound(*location),
                None => {
                    let next = fresh.len();
                    CanonicalValue::Fresh(*fresh.entry(var.clone()).or_insert(next))
                }
            },
        }
    };
    production
        .actions
        .iter()
        .map(|action| match action {
            Action::Make { id, attr, value: v, preference, referent } => CanonicalAction::Make {
                id: value(id),
                attr: value(attr),
                value: value(v),
                preference: *preference,
                referent: referent.as_ref().map(&mut value),
            },
            Action::Halt => CanonicalAction::Halt,
        })
        .collect()
}
