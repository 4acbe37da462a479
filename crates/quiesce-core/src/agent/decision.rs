//! Decide phase: settle every goal's operator slot, top goal first

use super::Agent;
use crate::decide::{resolve_keeping, ImpasseKind, Resolution};
use crate::error::EngineResult;
use crate::trace::{DecisionOutcome, TraceEvent};
use quiesce_types::{IdHandle, Symbol};
use tracing::{debug, instrument};

impl Agent {
    #[instrument(level = "debug", skip(self), fields(agent = %self.name))]
    pub(super) fn run_decide(&mut self) -> EngineResult<()> {
        let (goal, outcome) = self.decide_context()?;
        self.apply_changes()?;
        self.collect_garbage()?;
        self.stats.decisions += 1;

        let goal = self.wm.name_of(goal);
        self.emit(TraceEvent::Decision { agent: self.name.clone(), cycle: self.stats.decisions, goal, outcome });
        Ok(())
    }

    /// Reconcile working memory, then account for the preferences it dropped
    pub(super) fn collect_garbage(&mut self) -> EngineResult<()> {
        let report = self.wm.reconcile()?;
        if report.removed_preferences.is_empty() {
            // Only facts of unreachable identifiers went, so no live slot changed
            return Ok(());
        }
        for (pid, pref) in report.removed_preferences {
            let Some(inst) = pref.instantiation else { continue };
            if let Some(done) = self.insts.drop_preference(inst, pid) {
                self.release_instantiation(done)?;
            }
        }
        self.wm.update_changed_slots()?;
        self.apply_changes()
    }

    /// Walk the goal stack and make at most one change: select, deselect or
    /// impasse. Returns the goal the decision was made on.
    fn decide_context(&mut self) -> EngineResult<(IdHandle, DecisionOutcome)> {
        let attr = self.wm.operator_attr();
        for index in 0..self.goals.len() {
            let Some(goal) = self.goals.get(index).cloned() else { break };
            let is_bottom = index + 1 == self.goals.len();
            let current = goal.selected();
            let resolution = {
                let prefs = self.wm.slot_preferences(goal.id, attr);
                resolve_keeping(&prefs, self.policy.as_mut(), &self.symbols, current)
            };

            match resolution {
                Resolution::Winner(op) if current == Some(op) => {
                    if is_bottom {
                        return self.impasse(index, ImpasseKind::OperatorNoChange, vec![op]);
                    }
                }
                Resolution::Winner(op) => {
                    self.remove_subgoals(index)?;
                    self.select_operator(index, op)?;
                    let operator = self.wm.display(op);
                    return Ok((goal.id, DecisionOutcome::Selected { operator }));
                }
                Resolution::Impasse { kind, items } => {
                    let unchanged = self
                        .goals
                        .get(index + 1)
                        .is_some_and(|child| child.impasse == Some(kind) && child.items == items);
                    if !unchanged {
                        return self.impasse(index, kind, items);
                    }
                }
                Resolution::Empty => {
                    if let Some(op) = current {
                        self.remove_subgoals(index)?;
                        self.deselect_operator(index)?;
                        let operator = self.wm.display(op);
                        return Ok((goal.id, DecisionOutcome::Deselected { operator }));
                    }
                    if is_bottom {
                        return self.impasse(index, ImpasseKind::StateNoChange, Vec::new());
                    }
                }
            }
        }
        Ok((self.bottom_goal(), DecisionOutcome::Unchanged))
    }

    /// Replace whatever hangs below the goal at `index` with a fresh subgoal
    fn impasse(
        &mut self,
        index: usize,
        kind: ImpasseKind,
        items: Vec<Symbol>,
    ) -> EngineResult<(IdHandle, DecisionOutcome)> {
        let Some(goal) = self.goals.get(index).map(|g| g.id) else {
            return Ok((self.bottom_goal(), DecisionOutcome::Unchanged));
        };
        self.remove_subgoals(index)?;
        if kind != ImpasseKind::OperatorNoChange {
            self.deselect_operator(index)?;
        }
        let count = items.len();
        let subgoal = self.push_subgoal(goal, kind, items)?;
        debug!(agent = %self.name, goal = %self.wm.name_of(subgoal), %kind, "impasse");
        Ok((goal, DecisionOutcome::Impasse { kind, items: count }))
    }

    fn remove_subgoals(&mut self, index: usize) -> EngineResult<()> {
        match self.goals.get(index + 1).map(|g| g.id) {
            Some(child) => self.pop_context(child),
            None => Ok(()),
        }
    }
}
