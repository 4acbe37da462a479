//! Goal stack and the architecture's own structure in working memory

use super::Agent;
use crate::decide::ImpasseKind;
use crate::error::{EngineError, EngineResult};
use crate::trace::TraceEvent;
use crate::wm::WmeOrigin;
use quiesce_types::{Constant, IdHandle, Symbol, SymbolTable, Timetag};
use tracing::debug;

/// One level of the goal stack
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub id: IdHandle,
    pub level: usize,
    /// Why this goal exists; `None` only for the top goal
    pub impasse: Option<ImpasseKind>,
    pub items: Vec<Symbol>,
    /// Selected operator and the fact recording it
    pub operator: Option<(Timetag, Symbol)>,
    arch: Vec<Timetag>,
}

impl Goal {
    pub fn selected(&self) -> Option<Symbol> {
        self.operator.map(|(_, op)| op)
    }
}

/// Constants the architecture writes; interned once per agent
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArchSymbols {
    pub(crate) type_attr: Symbol,
    pub(crate) state: Symbol,
    pub(crate) superstate: Symbol,
    pub(crate) nil: Symbol,
    pub(crate) impasse: Symbol,
    pub(crate) choices: Symbol,
    pub(crate) attribute: Symbol,
    pub(crate) item: Symbol,
    pub(crate) item_count: Symbol,
    pub(crate) quiescence: Symbol,
    pub(crate) t: Symbol,
    pub(crate) io: Symbol,
    pub(crate) input_link: Symbol,
    pub(crate) output_link: Symbol,
    pub(crate) multiple: Symbol,
    pub(crate) none: Symbol,
}

impl ArchSymbols {
    pub(crate) fn intern(symbols: &SymbolTable) -> Self {
        let s = |text: &str| symbols.intern_symbol(text);
        Self {
            type_attr: s("type"),
            state: s("state"),
            superstate: s("superstate"),
            nil: s("nil"),
            impasse: s("impasse"),
            choices: s("choices"),
            attribute: s("attribute"),
            item: s("item"),
            item_count: s("item-count"),
            quiescence: s("quiescence"),
            t: s("t"),
            io: s("io"),
            input_link: s("input-link"),
            output_link: s("output-link"),
            multiple: s("multiple"),
            none: s("none"),
        }
    }
}

/// Identifiers of the top goal's I/O structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLinks {
    pub io: IdHandle,
    pub input: IdHandle,
    pub output: IdHandle,
}

#[derive(Debug, Default)]
pub(crate) struct GoalStack {
    goals: Vec<Goal>,
}

impl GoalStack {
    pub(crate) fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub(crate) fn bottom(&self) -> Option<&Goal> {
        self.goals.last()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Goal> {
        self.goals.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Goal> {
        self.goals.get_mut(index)
    }

    pub(crate) fn position(&self, id: IdHandle) -> Option<usize> {
        self.goals.iter().position(|g| g.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.goals.len()
    }
}

impl Agent {
    /// Create the top goal `S1` with `^type state ^superstate nil ^io`
    pub(super) fn init_top_goal(&mut self) -> EngineResult<IoLinks> {
        let arch = self.arch;
        let goal = self.wm.make_identifier('S', Some(1));
        self.wm.add_ref(goal);
        self.wm.mark_goal(goal, 1, false)?;

        let io = self.wm.make_identifier('I', Some(1));
        let input = self.wm.make_identifier('I', Some(1));
        let output = self.wm.make_identifier('I', Some(1));
        let mut facts = Vec::new();
        for (attr, value) in [
            (arch.superstate, arch.nil),
            (arch.type_attr, arch.state),
            (arch.io, Symbol::Ident(io)),
        ] {
            facts.push(self.wm.add_wme(goal, attr, value, false, WmeOrigin::Architecture)?);
        }
        facts.push(self.wm.add_wme(io, arch.input_link, Symbol::Ident(input), false, WmeOrigin::Architecture)?);
        facts.push(self.wm.add_wme(io, arch.output_link, Symbol::Ident(output), false, WmeOrigin::Architecture)?);

        self.goals.goals.push(Goal { id: goal, level: 1, impasse: None, items: Vec::new(), operator: None, arch: facts });
        debug!(agent = %self.name, goal = %self.wm.name_of(goal), "top goal created");
        Ok(IoLinks { io, input, output })
    }

    /// Create a subgoal one level below `parent`, which must be the bottom goal
    pub fn push_subgoal(&mut self, parent: IdHandle, impasse: ImpasseKind, items: Vec<Symbol>) -> EngineResult<IdHandle> {
        let Some(bottom) = self.goals.bottom().filter(|g| g.id == parent) else {
            return Err(EngineError::invariant(format!(
                "subgoal requested under {}, which is not the bottom goal",
                self.wm.name_of(parent)
            )));
        };
        let level = bottom.level + 1;
        let arch = self.arch;

        let goal = self.wm.make_identifier('S', Some(level));
        self.wm.add_ref(goal);
        if let Err(err) = self.wm.mark_goal(goal, level, true) {
            self.wm.release(goal)?;
            return Err(err);
        }

        let impasse_name = self.symbols.intern_symbol(impasse.name());
        let choices = match impasse {
            ImpasseKind::Tie | ImpasseKind::Conflict => arch.multiple,
            ImpasseKind::ConstraintFailure => impasse_name,
            ImpasseKind::StateNoChange | ImpasseKind::OperatorNoChange => arch.none,
        };
        let attribute = match impasse {
            ImpasseKind::StateNoChange => arch.state,
            _ => self.wm.operator_attr(),
        };
        let count = self.symbols.intern_symbol(Constant::Int(items.len() as i64));

        let mut facts = Vec::new();
        let mut entries = vec![
            (arch.type_attr, arch.state),
            (arch.superstate, Symbol::Ident(parent)),
            (arch.impasse, impasse_name),
            (arch.choices, choices),
            (arch.attribute, attribute),
            (arch.item_count, count),
            (arch.quiescence, arch.t),
        ];
        entries.extend(items.iter().map(|&item| (arch.item, item)));
        for (attr, value) in entries {
            facts.push(self.wm.add_wme(goal, attr, value, false, WmeOrigin::Architecture)?);
        }
        self.wm.symbol_release(impasse_name)?;
        self.wm.symbol_release(count)?;

        self.goals.goals.push(Goal { id: goal, level, impasse: Some(impasse), items, operator: None, arch: facts });
        let name = self.wm.name_of(goal);
        self.stats.subgoals += 1;
        self.emit(TraceEvent::SubgoalCreated { agent: self.name.clone(), goal: name, level, impasse });
        Ok(goal)
    }

    /// Remove `goal` and every goal below it, with their architecture facts,
    /// selected operators and every preference made at those levels
    pub fn pop_context(&mut self, goal: IdHandle) -> EngineResult<()> {
        let Some(index) = self.goals.position(goal) else {
            return Err(EngineError::invariant(format!("{} is not on the goal stack", self.wm.name_of(goal))));
        };
        if index == 0 {
            return Err(EngineError::invariant("the top goal cannot be removed"));
        }
        let cutoff = self.goals.goals[index].level;

        while self.goals.len() > index {
            let Some(removed) = self.goals.goals.pop() else { break };
            if let Some((timetag, _)) = removed.operator {
                self.wm.remove_wme(timetag)?;
            }
            for timetag in removed.arch {
                if self.wm.wme(timetag).is_some() {
                    self.wm.remove_wme(timetag)?;
                }
            }
            self.wm.unmark_goal(removed.id);
            self.wm.release(removed.id)?;
            let name = self.wm.name_of(removed.id);
            self.emit(TraceEvent::GoalRemoved { agent: self.name.clone(), goal: name, level: removed.level });
        }

        let doomed: Vec<_> = self
            .wm
            .preferences()
            .filter(|(_, pref)| pref.level >= cutoff)
            .map(|(pid, _)| pid)
            .collect();
        for pid in doomed {
            self.remove_preference(pid)?;
        }
        Ok(())
    }

    /// Select `operator` on the goal at `index`, replacing any previous selection
    pub(super) fn select_operator(&mut self, index: usize, operator: Symbol) -> EngineResult<()> {
        self.deselect_operator(index)?;
        let Some(goal) = self.goals.get(index).map(|g| g.id) else { return Ok(()) };
        let attr = self.wm.operator_attr();
        let timetag = self.wm.add_wme(goal, attr, operator, false, WmeOrigin::Architecture)?;
        if let Some(entry) = self.goals.get_mut(index) {
            entry.operator = Some((timetag, operator));
        }
        Ok(())
    }

    pub(super) fn deselect_operator(&mut self, index: usize) -> EngineResult<()> {
        let previous = self.goals.get_mut(index).and_then(|g| g.operator.take());
        if let Some((timetag, _)) = previous {
            self.wm.remove_wme(timetag)?;
        }
        Ok(())
    }
}
