//! Condition/action representation of one rule
//!
//! The rule compiler upstream hands the engine a [`Production`]: a list of
//! [`Condition`]s over `(id ^attr value)` patterns and a list of [`Action`]s.
//! [`Production::validate`] rejects malformed trees before the network is
//! touched.

use crate::error::{EngineError, EngineResult};
use crate::preference::{PreferenceKind, Support};
use quiesce_types::{Constant, IdHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the context-slot attribute on goals
pub const OPERATOR_ATTR: &str = "operator";

/// Right-hand operand of an equality or relational test
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Const(Constant),
    Var(String),
    /// Concrete identifier; only ground derived rules carry these
    Ident(IdHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl Relation {
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Relation::NotEqual => ordering != Equal,
            Relation::Less => ordering == Less,
            Relation::Greater => ordering == Greater,
            Relation::LessEqual => ordering != Greater,
            Relation::GreaterEqual => ordering != Less,
        }
    }
}

/// Test on one field of a fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Test {
    Blank,
    Equal(Operand),
    Relation(Relation, Operand),
    Disjunction(Vec<Constant>),
    Conjunction(Vec<Test>),
    /// The identifier must be a goal
    Goal,
    /// The identifier must be a goal created for an impasse
    Impasse,
}

impl Test {
    pub fn var(name: &str) -> Self {
        Test::Equal(Operand::Var(name.to_string()))
    }

    pub fn constant(value: impl Into<Constant>) -> Self {
        Test::Equal(Operand::Const(value.into()))
    }

    /// `(state <name> ...)` shorthand: goal test conjoined with a variable
    pub fn goal(name: &str) -> Self {
        Test::Conjunction(vec![Test::Goal, Test::var(name)])
    }

    pub(crate) fn flatten(&self) -> Vec<&Test> {
        match self {
            Test::Conjunction(parts) => parts.iter().flat_map(Test::flatten).collect(),
            other => vec![other],
        }
    }

    /// Variables this test binds by equality
    pub fn equality_vars(&self) -> Vec<&str> {
        self.flatten()
            .into_iter()
            .filter_map(|test| match test {
                Test::Equal(Operand::Var(name)) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Variables this test only reads
    fn relational_vars(&self) -> Vec<&str> {
        self.flatten()
            .into_iter()
            .filter_map(|test| match test {
                Test::Relation(_, Operand::Var(name)) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn has_goal_test(&self) -> bool {
        self.flatten().iter().any(|test| matches!(test, Test::Goal | Test::Impasse))
    }

    /// Constant equality, if this test pins the field to one constant
    pub fn constant_equality(&self) -> Option<&Constant> {
        self.flatten().into_iter().find_map(|test| match test {
            Test::Equal(Operand::Const(c)) => Some(c),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Test,
    pub attr: Test,
    pub value: Test,
    /// Match acceptable-preference facts instead of ordinary ones
    pub acceptable: bool,
}

impl Pattern {
    pub fn new(id: Test, attr: Test, value: Test) -> Self {
        Self { id, attr, value, acceptable: false }
    }

    /// `(<id> ^attr value)` with a constant attribute
    pub fn triple(id: &str, attr: &str, value: Test) -> Self {
        Self::new(Test::var(id), Test::constant(attr), value)
    }

    pub fn acceptable(mut self) -> Self {
        self.acceptable = true;
        self
    }

    fn fields(&self) -> [&Test; 3] {
        [&self.id, &self.attr, &self.value]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Positive(Pattern),
    Negative(Pattern),
    /// Conjunctive negation: none of the inner conjunction may match
    Conjunctive(Vec<Condition>),
}

/// Value slot of a `Make` action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RhsValue {
    Const(Constant),
    /// Bound on the left-hand side, or a fresh identifier per firing when unbound
    Var(String),
    Ident(IdHandle),
}

impl RhsValue {
    pub fn var(name: &str) -> Self {
        RhsValue::Var(name.to_string())
    }

    pub fn constant(value: impl Into<Constant>) -> Self {
        RhsValue::Const(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Make {
        id: RhsValue,
        attr: RhsValue,
        value: RhsValue,
        preference: PreferenceKind,
        referent: Option<RhsValue>,
    },
    Halt,
}

impl Action {
    pub fn make(id: &str, attr: &str, value: RhsValue, preference: PreferenceKind) -> Self {
        Action::Make {
            id: RhsValue::var(id),
            attr: RhsValue::constant(attr),
            value,
            preference,
            referent: None,
        }
    }

    pub fn make_binary(
        id: &str,
        attr: &str,
        value: RhsValue,
        preference: PreferenceKind,
        referent: RhsValue,
    ) -> Self {
        Action::Make {
            id: RhsValue::var(id),
            attr: RhsValue::constant(attr),
            value,
            preference,
            referent: Some(referent),
        }
    }

    fn vars(&self) -> Vec<&str> {
        match self {
            Action::Make { id, attr, value, referent, .. } => [Some(id), Some(attr), Some(value), referent.as_ref()]
                .into_iter()
                .flatten()
                .filter_map(|rhs| match rhs {
                    RhsValue::Var(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            Action::Halt => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductionKind {
    /// Supplied by the rule compiler
    User,
    /// Variablized rule learned from a subgoal result; reloadable
    Chunk,
    /// Ground rule recorded for a subgoal result; never saved
    Justification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Production {
    pub name: String,
    pub kind: ProductionKind,
    /// Forces the support of every preference this rule makes
    pub support: Option<Support>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Production {
    pub fn new(name: &str, conditions: Vec<Condition>, actions: Vec<Action>) -> Self {
        Self {
            name: name.to_string(),
            kind: ProductionKind::User,
            support: None,
            conditions,
            actions,
        }
    }

    pub fn with_support(mut self, support: Support) -> Self {
        self.support = Some(support);
        self
    }

    /// Whether the rule tests a selected (non-acceptable) operator
    pub fn tests_selected_operator(&self) -> bool {
        self.conditions.iter().any(|condition| match condition {
            Condition::Positive(pattern) => {
                !pattern.acceptable
                    && matches!(pattern.attr.constant_equality(), Some(Constant::Str(s)) if s == OPERATOR_ATTR)
            }
            _ => false,
        })
    }

    /// Support given to the preference a `Make` action creates
    pub fn support_for(&self, action: &Action) -> Support {
        if let Some(forced) = self.support {
            return forced;
        }
        let on_context_slot = matches!(
            action,
            Action::Make { attr: RhsValue::Const(Constant::Str(s)), .. } if s == OPERATOR_ATTR
        );
        if self.tests_selected_operator() && !on_context_slot {
            Support::O
        } else {
            Support::I
        }
    }

    /// Check the tree is well formed before it is compiled
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |message: &str| Err(EngineError::structural(&self.name, message));

        match self.conditions.first() {
            None => return fail("rule has no conditions"),
            Some(Condition::Positive(_)) => {}
            Some(_) => return fail("first condition must be positive"),
        }

        let mut bound = HashSet::new();
        let mut negated_only = HashSet::new();
        for condition in &self.conditions {
            self.validate_condition(condition, &mut bound, &mut negated_only, true)?;
        }

        for action in &self.actions {
            if let Action::Make { id, preference, referent, .. } = action {
                if matches!(id, RhsValue::Const(_)) {
                    return fail("action makes a preference for a constant identifier");
                }
                match (preference.is_binary(), referent.is_some()) {
                    (true, false) => return fail("binary preference without a referent"),
                    (false, true) => return fail("unary preference with a referent"),
                    _ => {}
                }
            }
            for var in action.vars() {
                if !bound.contains(var) && negated_only.contains(var) {
                    return Err(EngineError::structural(
                        &self.name,
                        format!("action uses <{var}>, bound only inside a negated condition"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_condition<'a>(
        &'a self,
        condition: &'a Condition,
        bound: &mut HashSet<&'a str>,
        negated_only: &mut HashSet<&'a str>,
        top_level_positive: bool,
    ) -> EngineResult<()> {
        match condition {
            Condition::Positive(pattern) | Condition::Negative(pattern) => {
                self.validate_pattern(pattern, bound)?;
                let binds = pattern.fields().into_iter().flat_map(Test::equality_vars);
                if top_level_positive && matches!(condition, Condition::Positive(_)) {
                    bound.extend(binds);
                } else {
                    negated_only.extend(binds);
                }
                Ok(())
            }
            Condition::Conjunctive(inner) => {
                if inner.is_empty() {
                    return Err(EngineError::structural(&self.name, "empty conjunctive negation"));
                }
                let mut scope = bound.clone();
                for condition in inner {
                    let mut local_negated = HashSet::new();
                    self.validate_condition(condition, &mut scope, &mut local_negated, true)?;
                    negated_only.extend(local_negated);
                }
                negated_only.extend(scope.difference(bound).copied().collect::<Vec<_>>());
                Ok(())
            }
        }
    }

    fn validate_pattern(&self, pattern: &Pattern, bound: &HashSet<&str>) -> EngineResult<()> {
        for part in pattern.id.flatten() {
            if matches!(
                part,
                Test::Equal(Operand::Const(_))
                    | Test::Relation(..)
                    | Test::Disjunction(_)
            ) {
                return Err(EngineError::structural(
                    &self.name,
                    "identifier field may only hold variables, identifiers or goal tests",
                ));
            }
        }
        if pattern.attr.has_goal_test() || pattern.value.has_goal_test() {
            return Err(EngineError::structural(
                &self.name,
                "goal tests apply only to the identifier field",
            ));
        }

        let local: HashSet<&str> =
            pattern.fields().into_iter().flat_map(Test::equality_vars).collect();
        for test in pattern.fields() {
            for var in test.relational_vars() {
                if !bound.contains(var) && !local.contains(var) {
                    return Err(EngineError::structural(
                        &self.name,
                        format!("relational test on unbound variable <{var}>"),
                    ));
                }
            }
        }
        Ok(())
    }
}
