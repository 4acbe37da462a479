//! Runtime parameter table
//!
//! One flat, indexed table per agent. Every knob the engine consults goes
//! through [`ParamTable::get`] / [`ParamTable::set`]; there are no ad hoc
//! globals.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Granularity of the trace feed, coarse to fine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TraceLevel {
    Off = 0,
    Phases = 1,
    Decisions = 2,
    Firings = 3,
    Wmes = 4,
}

impl TraceLevel {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Phases),
            2 => Some(Self::Decisions),
            3 => Some(Self::Firings),
            4 => Some(Self::Wmes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Param {
    TraceLevel,
    Learning,
    MaxElaborations,
    MaxGoalDepth,
    Timers,
    MaxNilOutputCycles,
    MaxNodes,
}

impl Param {
    pub const COUNT: usize = 7;

    pub const ALL: [Param; Param::COUNT] = [
        Param::TraceLevel,
        Param::Learning,
        Param::MaxElaborations,
        Param::MaxGoalDepth,
        Param::Timers,
        Param::MaxNilOutputCycles,
        Param::MaxNodes,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Param::TraceLevel => "trace-level",
            Param::Learning => "learning",
            Param::MaxElaborations => "max-elaborations",
            Param::MaxGoalDepth => "max-goal-depth",
            Param::Timers => "timers",
            Param::MaxNilOutputCycles => "max-nil-output-cycles",
            Param::MaxNodes => "max-nodes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.name() == name)
    }

    fn default_value(self) -> ParamValue {
        match self {
            Param::TraceLevel => ParamValue::Int(TraceLevel::Phases as i64),
            Param::Learning => ParamValue::Bool(false),
            Param::MaxElaborations => ParamValue::Int(100),
            Param::MaxGoalDepth => ParamValue::Int(100),
            Param::Timers => ParamValue::Bool(false),
            Param::MaxNilOutputCycles => ParamValue::Int(15),
            Param::MaxNodes => ParamValue::Int(1_000_000),
        }
    }

    /// Inclusive bounds for integer parameters
    fn bounds(self) -> Option<(i64, i64)> {
        match self {
            Param::TraceLevel => Some((0, 4)),
            Param::MaxElaborations => Some((1, i64::from(u32::MAX))),
            Param::MaxGoalDepth => Some((1, i64::from(u16::MAX))),
            Param::MaxNilOutputCycles => Some((1, i64::from(u32::MAX))),
            Param::MaxNodes => Some((1, i64::from(u32::MAX))),
            Param::Learning | Param::Timers => None,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Bool(b) => write!(f, "{}", if *b { "on" } else { "off" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamTable {
    values: [ParamValue; Param::COUNT],
}

impl Default for ParamTable {
    fn default() -> Self {
        Self { values: Param::ALL.map(Param::default_value) }
    }
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, param: Param) -> ParamValue {
        self.values[param.index()]
    }

    /// Write a parameter, rejecting the wrong type or an out-of-range value
    pub fn set(&mut self, param: Param, value: ParamValue) -> EngineResult<()> {
        match (param.default_value(), value) {
            (ParamValue::Bool(_), ParamValue::Bool(_)) => {}
            (ParamValue::Int(_), ParamValue::Int(v)) => {
                if let Some((lo, hi)) = param.bounds() {
                    if v < lo || v > hi {
                        return Err(EngineError::parameter(format!(
                            "{param} must be within {lo}..={hi}, got {v}"
                        )));
                    }
                }
            }
            (expected, _) => {
                return Err(EngineError::parameter(format!(
                    "{param} expects a {} value",
                    match expected {
                        ParamValue::Int(_) => "numeric",
                        ParamValue::Bool(_) => "boolean",
                    }
                )));
            }
        }
        self.values[param.index()] = value;
        Ok(())
    }

    /// Write a parameter from its textual form (`on`/`off`, integers)
    pub fn set_by_name(&mut self, name: &str, raw: &str) -> EngineResult<()> {
        let param = Param::from_name(name)
            .ok_or_else(|| EngineError::parameter(format!("no parameter named '{name}'")))?;
        let value = match param.default_value() {
            ParamValue::Bool(_) => match raw {
                "on" | "true" | "1" => ParamValue::Bool(true),
                "off" | "false" | "0" => ParamValue::Bool(false),
                _ => return Err(EngineError::parameter(format!("{param}: '{raw}' is not on/off"))),
            },
            ParamValue::Int(_) => ParamValue::Int(raw.parse().map_err(|_| {
                EngineError::parameter(format!("{param}: '{raw}' is not an integer"))
            })?),
        };
        self.set(param, value)
    }

    pub fn int(&self, param: Param) -> i64 {
        match self.get(param) {
            ParamValue::Int(i) => i,
            ParamValue::Bool(b) => i64::from(b),
        }
    }

    pub fn flag(&self, param: Param) -> bool {
        match self.get(param) {
            ParamValue::Bool(b) => b,
            ParamValue::Int(i) => i != 0,
        }
    }

    pub fn trace_level(&self) -> TraceLevel {
        TraceLevel::from_i64(self.int(Param::TraceLevel)).unwrap_or(TraceLevel::Phases)
    }

    pub fn max_goal_depth(&self) -> usize {
        usize::try_from(self.int(Param::MaxGoalDepth)).unwrap_or(usize::MAX)
    }

    pub fn max_elaborations(&self) -> u64 {
        u64::try_from(self.int(Param::MaxElaborations)).unwrap_or(u64::MAX)
    }

    pub fn max_nil_output_cycles(&self) -> u64 {
        u64::try_from(self.int(Param::MaxNilOutputCycles)).unwrap_or(u64::MAX)
    }

    pub fn max_nodes(&self) -> usize {
        usize::try_from(self.int(Param::MaxNodes)).unwrap_or(usize::MAX)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, ParamValue)> + '_ {
        Param::ALL.into_iter().map(|param| (param, self.get(param)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_indexed_by_param() {
        let table = ParamTable::new();
        for (index, param) in Param::ALL.into_iter().enumerate() {
            assert_eq!(param.index(), index);
        }
        assert_eq!(table.get(Param::Learning), ParamValue::Bool(false));
        assert_eq!(table.max_elaborations(), 100);
    }

    #[test]
    fn test_type_and_range_checks() {
        let mut table = ParamTable::new();
        assert!(table.set(Param::Learning, ParamValue::Int(1)).is_err());
        assert!(table.set(Param::MaxGoalDepth, ParamValue::Int(0)).is_err());
        assert!(table.set(Param::TraceLevel, ParamValue::Int(9)).is_err());
        table.set(Param::MaxGoalDepth, ParamValue::Int(5)).unwrap();
        assert_eq!(table.max_goal_depth(), 5);
    }

    #[test]
    fn test_set_by_name() {
        let mut table = ParamTable::new();
        table.set_by_name("learning", "on").unwrap();
        table.set_by_name("max-elaborations", "7").unwrap();
        assert!(table.flag(Param::Learning));
        assert_eq!(table.max_elaborations(), 7);
        assert!(table.set_by_name("bogus", "1").is_err());
        assert!(table.set_by_name("timers", "maybe").is_err());
    }
}
