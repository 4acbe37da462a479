//! Binary network images
//!
//! An image records the node graph, alpha memories and rules exactly as built,
//! with constants spelled out by value so another process (another symbol
//! table) can load it. Matches are not saved; loading replays the current
//! facts through the rebuilt network.

use super::build::canonicalize;
use super::node::{AlphaMemory, JoinTest, NodeKind, ReteNode};
use super::{AlphaId, AlphaKey, Field, Location, NodeId, ProductionId, ProductionRecord, Rete};
use crate::error::{EngineError, EngineResult, Resource};
use crate::production::{Production, ProductionKind, Relation};
use ahash::AHashMap;
use quiesce_types::{Constant, Symbol, Timetag};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

pub const IMAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkImage {
    pub format_version: u32,
    alphas: Vec<Option<AlphaImage>>,
    nodes: Vec<Option<NodeImage>>,
    productions: Vec<Option<ProductionImage>>,
}

impl NetworkImage {
    pub fn production_count(&self) -> usize {
        self.productions.iter().flatten().count()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.productions.iter().flatten().map(|p| p.production.name.as_str())
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| EngineError::persistence(format!("encode failed: {e}")))
    }

    pub fn read_from(path: &Path) -> EngineResult<Self> {
        let bytes = fs::read(path)
            .map_err(|e| EngineError::persistence(format!("cannot read {}: {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    pub fn write_to(&self, path: &Path) -> EngineResult<()> {
        fs::write(path, self.to_bytes()?)
            .map_err(|e| EngineError::persistence(format!("cannot write {}: {e}", path.display())))
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let image: Self = bincode::deserialize(bytes)
            .map_err(|e| EngineError::persistence(format!("decode failed: {e}")))?;
        if image.format_version != IMAGE_FORMAT_VERSION {
            return Err(EngineError::persistence(format!(
                "image format {} is not supported (expected {IMAGE_FORMAT_VERSION})",
                image.format_version
            )));
        }
        Ok(image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AlphaImage {
    attr: Option<Constant>,
    value: Option<Constant>,
    acceptable: bool,
    successors: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeImage {
    parent: Option<u32>,
    children: Vec<u32>,
    kind: KindImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum KindImage {
    Root,
    Join { amem: u32, tests: Vec<TestImage> },
    Memory,
    Negative { amem: u32, tests: Vec<TestImage> },
    Ncc { partner: u32 },
    NccPartner { ncc: u32, conjuncts: usize },
    Terminal { production: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TestImage {
    Binding { field: Field, levels_up: usize, other: Field, relation: Option<Relation> },
    Intra { field: Field, other: Field, relation: Option<Relation> },
    Constant { field: Field, relation: Option<Relation>, value: Constant },
    Disjunction { field: Field, values: Vec<Constant> },
    Goal,
    Impasse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProductionImage {
    production: Production,
    terminal: u32,
    bindings: Vec<(String, Location)>,
}

impl Rete {
    /// Snapshot the rule memory. Ground rules learned without variablization
    /// refer to this agent's identifiers and make the network unsaveable.
    pub fn save_image(&self) -> EngineResult<NetworkImage> {
        if let Some((_, record)) = self
            .productions
            .iter()
            .find(|(_, record)| record.production.kind == ProductionKind::Justification)
        {
            return Err(EngineError::persistence(format!(
                "justification '{}' cannot be saved; excise it first",
                record.production.name
            )));
        }

        let mut alphas = vec![None; self.alphas.capacity_index()];
        for (index, memory) in self.alphas.iter() {
            alphas[index as usize] = Some(AlphaImage {
                attr: memory.key.attr.map(|s| self.constant_of(s)).transpose()?,
                value: memory.key.value.map(|s| self.constant_of(s)).transpose()?,
                acceptable: memory.key.acceptable,
                successors: memory.successors.iter().map(|n| n.0).collect(),
            });
        }

        let mut nodes = vec![None; self.nodes.capacity_index()];
        for (index, node) in self.nodes.iter() {
            let kind = match &node.kind {
                NodeKind::Root => KindImage::Root,
                NodeKind::Join { amem, tests } => {
                    KindImage::Join { amem: amem.0, tests: self.save_tests(tests)? }
                }
                NodeKind::Memory => KindImage::Memory,
                NodeKind::Negative { amem, tests } => {
                    KindImage::Negative { amem: amem.0, tests: self.save_tests(tests)? }
                }
                NodeKind::Ncc { partner } => KindImage::Ncc { partner: partner.0 },
                NodeKind::NccPartner { ncc, conjuncts, .. } => {
                    KindImage::NccPartner { ncc: ncc.0, conjuncts: *conjuncts }
                }
                NodeKind::Terminal { production } => KindImage::Terminal { production: production.0 },
            };
            nodes[index as usize] = Some(NodeImage {
                parent: node.parent.map(|p| p.0),
                children: node.children.iter().map(|c| c.0).collect(),
                kind,
            });
        }

        let mut productions = vec![None; self.productions.capacity_index()];
        for (index, record) in self.productions.iter() {
            let mut bindings: Vec<_> =
                record.bindings.iter().map(|(var, location)| (var.clone(), *location)).collect();
            bindings.sort_by(|a, b| a.0.cmp(&b.0));
            productions[index as usize] = Some(ProductionImage {
                production: record.production.clone(),
                terminal: record.terminal.0,
                bindings,
            });
        }

        Ok(NetworkImage { format_version: IMAGE_FORMAT_VERSION, alphas, nodes, productions })
    }

    /// Rebuild the rule memory from an image. The rule memory must be empty.
    pub fn load_image(&mut self, image: NetworkImage) -> EngineResult<()> {
        if !self.productions.is_empty() {
            return Err(EngineError::persistence(format!(
                "rule memory holds {} rules; clear it before loading",
                self.productions.len()
            )));
        }
        let live_nodes = image.nodes.iter().flatten().count();
        if live_nodes > self.max_nodes {
            return Err(EngineError::ResourceExhaustion {
                resource: Resource::NetworkNodes,
                limit: self.max_nodes,
            });
        }
        validate_image(&image)?;

        for (index, alpha) in image.alphas.iter().enumerate() {
            let Some(alpha) = alpha else { continue };
            let key = AlphaKey {
                attr: alpha.attr.clone().map(|c| self.symbols.intern_symbol(c)),
                value: alpha.value.clone().map(|c| self.symbols.intern_symbol(c)),
                acceptable: alpha.acceptable,
            };
            let memory = AlphaMemory {
                key,
                wmes: Vec::new(),
                successors: alpha.successors.iter().map(|&n| NodeId(n)).collect(),
            };
            self.alphas.insert_at(index as u32, memory);
            self.alpha_index.insert(key, AlphaId(index as u32));
        }

        for (index, node) in image.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            let children: Vec<NodeId> = node.children.iter().map(|&c| NodeId(c)).collect();
            if index as u32 == self.root.0 {
                self.nodes[self.root.0].children = children;
                continue;
            }
            let kind = match &node.kind {
                KindImage::Root => {
                    return Err(EngineError::persistence("second root node in image"));
                }
                KindImage::Join { amem, tests } => {
                    NodeKind::Join { amem: AlphaId(*amem), tests: self.load_tests(tests) }
                }
                KindImage::Memory => NodeKind::Memory,
                KindImage::Negative { amem, tests } => {
                    NodeKind::Negative { amem: AlphaId(*amem), tests: self.load_tests(tests) }
                }
                KindImage::Ncc { partner } => NodeKind::Ncc { partner: NodeId(*partner) },
                KindImage::NccPartner { ncc, conjuncts } => {
                    NodeKind::NccPartner { ncc: NodeId(*ncc), conjuncts: *conjuncts, new_results: Vec::new() }
                }
                KindImage::Terminal { production } => {
                    NodeKind::Terminal { production: ProductionId(*production) }
                }
            };
            let mut rebuilt = ReteNode::new(node.parent.map(NodeId), kind);
            rebuilt.children = children;
            self.nodes.insert_at(index as u32, rebuilt);
        }

        for (index, production) in image.productions.into_iter().enumerate() {
            let Some(production) = production else { continue };
            let bindings: AHashMap<String, Location> = production.bindings.into_iter().collect();
            let canonical = canonicalize(&production.production, &bindings);
            let name = production.production.name.clone();
            let support = production.production.support;
            self.productions.insert_at(
                index as u32,
                ProductionRecord {
                    production: production.production,
                    terminal: NodeId(production.terminal),
                    bindings,
                    canonical,
                    support,
                },
            );
            self.by_name.insert(name, ProductionId(index as u32));
        }
        self.alphas.reindex_free();
        self.nodes.reindex_free();
        self.productions.reindex_free();

        // Replay the facts already present, oldest first
        let mut present: Vec<Timetag> = self.wmes.keys().copied().collect();
        present.sort();
        for timetag in present {
            let Some(entry) = self.wmes.get(&timetag) else { continue };
            let wme = entry.wme;
            for key in AlphaKey::probes(&wme) {
                if let Some(&amem) = self.alpha_index.get(&key) {
                    self.alpha_activate(amem, timetag);
                }
            }
        }

        info!(
            rules = self.productions.len(),
            nodes = self.nodes.len(),
            alpha_memories = self.alphas.len(),
            "network image loaded"
        );
        Ok(())
    }

    fn constant_of(&self, symbol: Symbol) -> EngineResult<Constant> {
        match symbol {
            Symbol::Const(id) => self
                .symbols
                .value(id)
                .ok_or_else(|| EngineError::persistence("network refers to a released constant")),
            Symbol::Ident(_) => Err(EngineError::persistence("network refers to an identifier")),
        }
    }

    fn save_tests(&self, tests: &[JoinTest]) -> EngineResult<Vec<TestImage>> {
        tests
            .iter()
            .map(|test| {
                Ok(match test {
                    JoinTest::Binding { field, levels_up, other, relation } => TestImage::Binding {
                        field: *field,
                        levels_up: *levels_up,
                        other: *other,
                        relation: *relation,
                    },
                    JoinTest::Intra { field, other, relation } => {
                        TestImage::Intra { field: *field, other: *other, relation: *relation }
                    }
                    JoinTest::Constant { field, relation, value } => TestImage::Constant {
                        field: *field,
                        relation: *relation,
                        value: self.constant_of(*value)?,
                    },
                    JoinTest::Disjunction { field, values } => TestImage::Disjunction {
                        field: *field,
                        values: values
                            .iter()
                            .map(|&c| self.constant_of(Symbol::Const(c)))
                            .collect::<EngineResult<_>>()?,
                    },
                    JoinTest::Goal => TestImage::Goal,
                    JoinTest::Impasse => TestImage::Impasse,
                })
            })
            .collect()
    }

    fn load_tests(&self, tests: &[TestImage]) -> Vec<JoinTest> {
        tests
            .iter()
            .map(|test| match test {
                TestImage::Binding { field, levels_up, other, relation } => JoinTest::Binding {
                    field: *field,
                    levels_up: *levels_up,
                    other: *other,
                    relation: *relation,
                },
                TestImage::Intra { field, other, relation } => {
                    JoinTest::Intra { field: *field, other: *other, relation: *relation }
                }
                TestImage::Constant { field, relation, value } => JoinTest::Constant {
                    field: *field,
                    relation: *relation,
                    value: self.symbols.intern_symbol(value.clone()),
                },
                TestImage::Disjunction { field, values } => JoinTest::Disjunction {
                    field: *field,
                    values: values.iter().map(|value| self.symbols.intern(value.clone())).collect(),
                },
                TestImage::Goal => JoinTest::Goal,
                TestImage::Impasse => JoinTest::Impasse,
            })
            .collect()
    }
}

/// Reject images whose handles point nowhere
fn validate_image(image: &NetworkImage) -> EngineResult<()> {
    let node_exists = |n: u32| image.nodes.get(n as usize).is_some_and(Option::is_some);
    let alpha_exists = |a: u32| image.alphas.get(a as usize).is_some_and(Option::is_some);
    let production_exists = |p: u32| image.productions.get(p as usize).is_some_and(Option::is_some);
    let broken = |what: &str| Err(EngineError::persistence(format!("corrupt image: {what}")));

    if !matches!(image.nodes.first(), Some(Some(NodeImage { kind: KindImage::Root, .. }))) {
        return broken("first node is not the root");
    }
    for node in image.nodes.iter().flatten() {
        if node.parent.is_some_and(|p| !node_exists(p)) || !node.children.iter().all(|&c| node_exists(c)) {
            return broken("dangling node link");
        }
        let ok = match &node.kind {
            KindImage::Join { amem, .. } | KindImage::Negative { amem, .. } => alpha_exists(*amem),
            KindImage::Ncc { partner } => node_exists(*partner),
            KindImage::NccPartner { ncc, .. } => node_exists(*ncc),
            KindImage::Terminal { production } => production_exists(*production),
            KindImage::Root | KindImage::Memory => true,
        };
        if !ok {
            return broken("dangling node reference");
        }
    }
    for alpha in image.alphas.iter().flatten() {
        if !alpha.successors.iter().all(|&n| node_exists(n)) {
            return broken("dangling alpha successor");
        }
    }
    for production in image.productions.iter().flatten() {
        if !node_exists(production.terminal) {
            return broken("dangling terminal");
        }
    }
    Ok(())
}
