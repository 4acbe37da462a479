//! Left/right activations and token deletion

use super::node::{NodeKind, Token};
use super::{AlphaId, Assertion, NodeId, Rete, Retraction, TokenId};
use quiesce_types::Timetag;

/// What reaches a node: a token from above or a fact from its alpha memory
#[derive(Debug, Clone, Copy)]
pub(super) enum Activation {
    Left { token: TokenId, wme: Option<Timetag> },
    Right { wme: Timetag },
}

impl Rete {
    pub(super) fn alpha_activate(&mut self, amem: AlphaId, wme: Timetag) {
        let memory = &mut self.alphas[amem.0];
        memory.wmes.push(wme);
        let successors = memory.successors.clone();
        if let Some(entry) = self.wmes.get_mut(&wme) {
            entry.amems.push(amem);
        }
        for successor in successors {
            self.propagate(successor, Activation::Right { wme });
        }
    }

    /// Single dispatch point for every activation
    pub(super) fn propagate(&mut self, node: NodeId, activation: Activation) {
        let kind = match self.nodes.get(node.0) {
            Some(found) => found.kind.clone(),
            None => return,
        };
        self.activations += 1;
        match (kind, activation) {
            (NodeKind::Join { amem, tests }, Activation::Left { token, .. }) => {
                let candidates = self.alphas[amem.0].wmes.clone();
                for timetag in candidates {
                    let passes =
                        self.wmes.get(&timetag).is_some_and(|entry| self.passes(&tests, token, &entry.wme));
                    if passes {
                        self.activate_children(node, token, Some(timetag));
                    }
                }
            }
            (NodeKind::Join { tests, .. }, Activation::Right { wme }) => {
                let Some(parent) = self.nodes[node.0].parent else { return };
                let Some(entry) = self.wmes.get(&wme) else { return };
                let fact = entry.wme;
                let matching: Vec<TokenId> = self.nodes[parent.0]
                    .tokens
                    .iter()
                    .copied()
                    .filter(|&token| self.passes(&tests, token, &fact))
                    .collect();
                for token in matching {
                    self.activate_children(node, token, Some(wme));
                }
            }
            (NodeKind::Memory, Activation::Left { token, wme }) => {
                let created = self.make_token(node, token, wme);
                self.activate_children(node, created, None);
            }
            (NodeKind::Negative { amem, tests }, Activation::Left { token, wme }) => {
                let created = self.make_token(node, token, wme);
                let blockers: Vec<Timetag> = self.alphas[amem.0]
                    .wmes
                    .iter()
                    .copied()
                    .filter(|timetag| {
                        self.wmes.get(timetag).is_some_and(|entry| self.passes(&tests, created, &entry.wme))
                    })
                    .collect();
                for blocker in &blockers {
                    if let Some(entry) = self.wmes.get_mut(blocker) {
                        entry.negative_join_results.push(created);
                    }
                }
                let unblocked = blockers.is_empty();
                self.tokens[created.0].join_results = blockers;
                if unblocked {
                    self.activate_children(node, created, None);
                }
            }
            (NodeKind::Negative { tests, .. }, Activation::Right { wme }) => {
                let Some(entry) = self.wmes.get(&wme) else { return };
                let fact = entry.wme;
                let blocked: Vec<TokenId> = self.nodes[node.0]
                    .tokens
                    .iter()
                    .copied()
                    .filter(|&token| self.passes(&tests, token, &fact))
                    .collect();
                for token in blocked {
                    if self.tokens[token.0].join_results.is_empty() {
                        self.delete_descendants(token);
                    }
                    self.tokens[token.0].join_results.push(wme);
                    if let Some(entry) = self.wmes.get_mut(&wme) {
                        entry.negative_join_results.push(token);
                    }
                }
            }
            (NodeKind::Ncc { partner }, Activation::Left { token, wme }) => {
                let created = self.make_token(node, token, wme);
                let buffered = match &mut self.nodes[partner.0].kind {
                    NodeKind::NccPartner { new_results, .. } => std::mem::take(new_results),
                    _ => Vec::new(),
                };
                for result in &buffered {
                    self.tokens[result.0].owner = Some(created);
                }
                let unblocked = buffered.is_empty();
                self.tokens[created.0].ncc_results = buffered;
                if unblocked {
                    self.activate_children(node, created, None);
                }
            }
            (NodeKind::NccPartner { ncc, conjuncts, .. }, Activation::Left { token, wme }) => {
                self.partner_activate(node, ncc, conjuncts, token, wme);
            }
            (NodeKind::Terminal { production }, Activation::Left { token, wme }) => {
                let created = self.make_token(node, token, wme);
                self.terminal_activate(production, created);
            }
            _ => {}
        }
    }

    fn activate_children(&mut self, node: NodeId, token: TokenId, wme: Option<Timetag>) {
        let children = self.nodes[node.0].children.clone();
        for child in children {
            self.propagate(child, Activation::Left { token, wme });
        }
    }

    fn make_token(&mut self, node: NodeId, parent: TokenId, wme: Option<Timetag>) -> TokenId {
        let id = TokenId(self.tokens.insert(Token::new(Some(parent), wme, node)));
        self.tokens[parent.0].children.push(id);
        if let Some(timetag) = wme {
            if let Some(entry) = self.wmes.get_mut(&timetag) {
                entry.tokens.push(id);
            }
        }
        if self.nodes[node.0].kind.stores_tokens() {
            self.nodes[node.0].tokens.push(id);
        }
        id
    }

    fn partner_activate(
        &mut self,
        partner: NodeId,
        ncc: NodeId,
        conjuncts: usize,
        token: TokenId,
        wme: Option<Timetag>,
    ) {
        let result = self.make_token(partner, token, wme);

        // Climb out of the subnetwork to the match the ncc node sees
        let mut owners_token = Some(token);
        let mut owners_wme = wme;
        for _ in 0..conjuncts {
            let Some(current) = owners_token else { break };
            owners_wme = self.tokens[current.0].wme;
            owners_token = self.tokens[current.0].parent;
        }

        let owner = owners_token.and_then(|parent| {
            self.tokens[parent.0].children.iter().copied().find(|&child| {
                let candidate = &self.tokens[child.0];
                candidate.node == ncc && candidate.wme == owners_wme
            })
        });

        match owner {
            Some(owner) => {
                self.tokens[result.0].owner = Some(owner);
                self.tokens[owner.0].ncc_results.push(result);
                self.delete_descendants(owner);
            }
            None => {
                if let NodeKind::NccPartner { new_results, .. } = &mut self.nodes[partner.0].kind {
                    new_results.push(result);
                }
            }
        }
    }

    fn terminal_activate(&mut self, production: super::ProductionId, token: TokenId) {
        if self.refraction.as_ref().is_some_and(|state| !state.matched) {
            let wmes = self.token_wmes(token);
            if let Some(state) = self.refraction.as_mut().filter(|state| state.request.wmes == wmes) {
                state.matched = true;
                self.tokens[token.0].instantiation = Some(state.request.instantiation);
                return;
            }
        }
        self.pending_assertions.push(Assertion { production, token });
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    pub(super) fn retract_wme(&mut self, timetag: Timetag) {
        let Some(entry) = self.wmes.get(&timetag) else { return };
        let amems = entry.amems.clone();
        for amem in amems {
            if let Some(memory) = self.alphas.get_mut(amem.0) {
                if let Some(position) = memory.wmes.iter().position(|&w| w == timetag) {
                    memory.wmes.remove(position);
                }
            }
        }

        while let Some(&token) = self.wmes.get(&timetag).and_then(|entry| entry.tokens.last()) {
            self.delete_token_and_descendants(token);
        }

        let blocked = self
            .wmes
            .get_mut(&timetag)
            .map(|entry| std::mem::take(&mut entry.negative_join_results))
            .unwrap_or_default();
        for token in blocked {
            let Some(found) = self.tokens.get_mut(token.0) else { continue };
            found.join_results.retain(|&w| w != timetag);
            if found.join_results.is_empty() {
                let node = found.node;
                self.activate_children(node, token, None);
            }
        }
    }

    pub(super) fn delete_descendants(&mut self, token: TokenId) {
        while let Some(&child) = self.tokens.get(token.0).and_then(|t| t.children.last()) {
            self.delete_token_and_descendants(child);
        }
    }

    pub(super) fn delete_token_and_descendants(&mut self, id: TokenId) {
        self.delete_descendants(id);
        let Some(token) = self.tokens.remove(id.0) else { return };

        let kind = self.nodes.get(token.node.0).map(|node| node.kind.clone());
        if let Some(node) = self.nodes.get_mut(token.node.0) {
            if let Some(position) = node.tokens.iter().position(|&t| t == id) {
                node.tokens.swap_remove(position);
            }
        }
        self.unlink_token(id, &token);

        match kind {
            Some(NodeKind::Negative { .. }) => {
                for blocker in &token.join_results {
                    if let Some(entry) = self.wmes.get_mut(blocker) {
                        entry.negative_join_results.retain(|&t| t != id);
                    }
                }
            }
            Some(NodeKind::Ncc { .. }) => {
                for result in &token.ncc_results {
                    if let Some(found) = self.tokens.remove(result.0) {
                        self.unlink_token(*result, &found);
                    }
                }
            }
            Some(NodeKind::NccPartner { ncc, .. }) => match token.owner {
                Some(owner) => {
                    let emptied = self.tokens.get_mut(owner.0).is_some_and(|found| {
                        found.ncc_results.retain(|&r| r != id);
                        found.ncc_results.is_empty()
                    });
                    if emptied {
                        let children = self.nodes.get(ncc.0).map(|n| n.children.clone()).unwrap_or_default();
                        for child in children {
                            self.propagate(child, Activation::Left { token: owner, wme: None });
                        }
                    }
                }
                None => {
                    if let Some(NodeKind::NccPartner { new_results, .. }) =
                        self.nodes.get_mut(token.node.0).map(|n| &mut n.kind)
                    {
                        new_results.retain(|&r| r != id);
                    }
                }
            },
            Some(NodeKind::Terminal { production }) => match token.instantiation {
                Some(instantiation) => {
                    self.pending_retractions.push(Retraction { production, instantiation });
                }
                None => self.pending_assertions.retain(|assertion| assertion.token != id),
            },
            None => {
                // Result of an already excised partner
                if let Some(owner) = token.owner.and_then(|owner| self.tokens.get_mut(owner.0)) {
                    owner.ncc_results.retain(|&r| r != id);
                }
            }
            _ => {}
        }
    }

    fn unlink_token(&mut self, id: TokenId, token: &Token) {
        if let Some(timetag) = token.wme {
            if let Some(entry) = self.wmes.get_mut(&timetag) {
                entry.tokens.retain(|&t| t != id);
            }
        }
        if let Some(parent) = token.parent.and_then(|parent| self.tokens.get_mut(parent.0)) {
            parent.children.retain(|&t| t != id);
        }
    }
}
