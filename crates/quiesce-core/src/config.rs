//! TOML configuration for a kernel and its agents
//!
//! Missing keys fall back to the same defaults the parameter table uses, and
//! `QUIESCE_*` environment variables override every agent's values.

use crate::decide::{FirstCandidate, NumericWeighted, RandomChoice, SelectionPolicy};
use crate::error::{EngineError, EngineResult};
use crate::params::{Param, ParamTable, ParamValue};
use crate::scheduler::StepUnit;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionConfig {
    #[default]
    First,
    Random,
    Numeric,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_trace_level")]
    pub trace_level: i64,
    #[serde(default)]
    pub learning: bool,
    #[serde(default = "default_max_elaborations")]
    pub max_elaborations: i64,
    #[serde(default = "default_max_goal_depth")]
    pub max_goal_depth: i64,
    #[serde(default)]
    pub timers: bool,
    #[serde(default = "default_max_nil_output_cycles")]
    pub max_nil_output_cycles: i64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: i64,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub seed: u64,
    /// Saved network to load at startup
    #[serde(default)]
    pub network_image: Option<PathBuf>,
}

impl AgentConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trace_level: default_trace_level(),
            learning: false,
            max_elaborations: default_max_elaborations(),
            max_goal_depth: default_max_goal_depth(),
            timers: false,
            max_nil_output_cycles: default_max_nil_output_cycles(),
            max_nodes: default_max_nodes(),
            selection: SelectionConfig::default(),
            seed: 0,
            network_image: None,
        }
    }

    /// Parameter table holding these values; out-of-range values are rejected
    pub fn params(&self) -> EngineResult<ParamTable> {
        let mut params = ParamTable::new();
        let entries = [
            (Param::TraceLevel, ParamValue::Int(self.trace_level)),
            (Param::Learning, ParamValue::Bool(self.learning)),
            (Param::MaxElaborations, ParamValue::Int(self.max_elaborations)),
            (Param::MaxGoalDepth, ParamValue::Int(self.max_goal_depth)),
            (Param::Timers, ParamValue::Bool(self.timers)),
            (Param::MaxNilOutputCycles, ParamValue::Int(self.max_nil_output_cycles)),
            (Param::MaxNodes, ParamValue::Int(self.max_nodes)),
        ];
        for (param, value) in entries {
            params.set(param, value).map_err(|err| {
                EngineError::configuration(format!("agent '{}': {err}", self.name))
            })?;
        }
        Ok(params)
    }

    pub fn selection_policy(&self) -> Box<dyn SelectionPolicy> {
        match self.selection {
            SelectionConfig::First => Box::new(FirstCandidate),
            SelectionConfig::Random => Box::new(RandomChoice::new(self.seed)),
            SelectionConfig::Numeric => Box::new(NumericWeighted::new(self.seed)),
        }
    }
}

/// Arguments of one `Kernel::run` call
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    #[serde(default = "default_step_unit")]
    pub step_unit: StepUnit,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default = "default_interleave_unit")]
    pub interleave_unit: StepUnit,
    #[serde(default)]
    pub synchronize: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_unit: default_step_unit(),
            count: default_count(),
            interleave_unit: default_interleave_unit(),
            synchronize: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct KernelConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentConfig>,
}

impl KernelConfig {
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let config: KernelConfig = toml::from_str(source)
            .map_err(|err| EngineError::configuration(format!("invalid configuration: {err}")))?;
        let mut names: Vec<&str> = config.agents.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(EngineError::configuration(format!("agent '{}' is configured twice", pair[0])));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let source = fs::read_to_string(path).map_err(|err| {
            EngineError::configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        info!(path = %path.display(), "loaded kernel configuration");
        Self::from_toml_str(&source)
    }

    /// Apply `QUIESCE_*` environment overrides to every agent
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, raw = %raw, "ignoring unparsable override");
                    None
                }
            }
        }

        let trace_level = parsed::<i64>(&lookup, "QUIESCE_TRACE_LEVEL");
        let learning = parsed::<bool>(&lookup, "QUIESCE_LEARNING");
        let max_elaborations = parsed::<i64>(&lookup, "QUIESCE_MAX_ELABORATIONS");
        let max_goal_depth = parsed::<i64>(&lookup, "QUIESCE_MAX_GOAL_DEPTH");
        let max_nil_output_cycles = parsed::<i64>(&lookup, "QUIESCE_MAX_NIL_OUTPUT_CYCLES");
        let max_nodes = parsed::<i64>(&lookup, "QUIESCE_MAX_NODES");
        let seed = parsed::<u64>(&lookup, "QUIESCE_SEED");

        for agent in &mut self.agents {
            if let Some(value) = trace_level {
                agent.trace_level = value;
            }
            if let Some(value) = learning {
                agent.learning = value;
            }
            if let Some(value) = max_elaborations {
                agent.max_elaborations = value;
            }
            if let Some(value) = max_goal_depth {
                agent.max_goal_depth = value;
            }
            if let Some(value) = max_nil_output_cycles {
                agent.max_nil_output_cycles = value;
            }
            if let Some(value) = max_nodes {
                agent.max_nodes = value;
            }
            if let Some(value) = seed {
                agent.seed = value;
            }
        }
        if let Some(count) = parsed::<u64>(&lookup, "QUIESCE_RUN_COUNT") {
            self.run.count = count;
        }
        self
    }
}

fn default_trace_level() -> i64 {
    1
}

fn default_max_elaborations() -> i64 {
    100
}

fn default_max_goal_depth() -> i64 {
    100
}

fn default_max_nil_output_cycles() -> i64 {
    15
}

fn default_max_nodes() -> i64 {
    1_000_000
}

fn default_step_unit() -> StepUnit {
    StepUnit::Decision
}

fn default_count() -> u64 {
    1
}

fn default_interleave_unit() -> StepUnit {
    StepUnit::Phase
}
