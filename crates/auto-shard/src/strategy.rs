//! Strategy descriptors and the validation that turns dynamic arguments into them.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use serde::{Deserialize, Serialize};

use crate::context::DeviceTarget;
use crate::error::{ArgumentError, ArgumentErrors};
use crate::sharding::Layout;
use crate::value::Value;

/// Objective of the strategy search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum StrategyLevel {
    /// Maximize the computation over communication ratio.
    #[default]
    MinimizeCommunication,
    /// Maximize the running speed.
    MaximizeSpeed,
    /// Minimize memory usage.
    MinimizeMemory,
}

impl TryFrom<i64> for StrategyLevel {
    type Error = ArgumentError;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::MinimizeCommunication),
            1 => Ok(Self::MaximizeSpeed),
            2 => Ok(Self::MinimizeMemory),
            level => Err(ArgumentError::UnsupportedLevel { level }),
        }
    }
}

impl From<StrategyLevel> for i64 {
    fn from(level: StrategyLevel) -> Self {
        level as i64
    }
}

/// Layouts of named parameters.
///
/// Entries are kept sorted by name, so two plans built in different orders are equal and
/// hash the same.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterPlan(BTreeMap<String, Layout>);

impl ParameterPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the layout of `name`, replacing any earlier one.
    pub fn with(mut self, name: impl Into<String>, layout: Layout) -> Self {
        self.0.insert(name.into(), layout);
        self
    }

    /// Layout of `name`, if planned.
    pub fn get(&self, name: &str) -> Option<&Layout> {
        self.0.get(name)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Layout)> {
        self.0.iter().map(|(name, layout)| (name.as_str(), layout))
    }

    /// Number of planned parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no parameter is planned.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How the inputs, outputs and parameters of a function are distributed.
///
/// Equality is structural over every field. A shard site reuses its closure exactly when
/// the incoming descriptor equals the stored one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    /// One entry per input; `None` selects the data-parallel default.
    pub in_strategy: Vec<Option<Layout>>,
    /// Output layouts, in the same form as the inputs.
    pub out_strategy: Option<Vec<Option<Layout>>>,
    /// Layouts of named parameters.
    pub parameter_plan: Option<ParameterPlan>,
    /// Device class the strategy is meant for.
    pub device: DeviceTarget,
    /// Search objective.
    pub level: StrategyLevel,
}

impl StrategyDescriptor {
    /// Descriptor with the given input layouts and defaults everywhere else.
    pub fn new(in_strategy: Vec<Option<Layout>>) -> Self {
        Self {
            in_strategy,
            out_strategy: None,
            parameter_plan: None,
            device: DeviceTarget::Ascend,
            level: StrategyLevel::default(),
        }
    }

    /// Sets the output layouts.
    pub fn with_out_strategy(mut self, out_strategy: Vec<Option<Layout>>) -> Self {
        self.out_strategy = Some(out_strategy);
        self
    }

    /// Sets the parameter plan.
    pub fn with_parameter_plan(mut self, parameter_plan: ParameterPlan) -> Self {
        self.parameter_plan = Some(parameter_plan);
        self
    }

    /// Sets the device class.
    pub fn with_device(mut self, device: DeviceTarget) -> Self {
        self.device = device;
        self
    }

    /// Sets the search objective.
    pub fn with_level(mut self, level: StrategyLevel) -> Self {
        self.level = level;
        self
    }
}

/// Arguments of the shard entry point, in their dynamic form.
///
/// Defaults mirror the front end: no output strategy, no parameter plan, `device="Ascend"`
/// and `level=0`.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardArgs {
    in_strategy: Value,
    out_strategy: Value,
    parameter_plan: Value,
    device: Value,
    level: Value,
}

impl ShardArgs {
    /// Arguments with the given input strategy and defaults elsewhere.
    pub fn new(in_strategy: impl Into<Value>) -> Self {
        Self {
            in_strategy: in_strategy.into(),
            out_strategy: Value::None,
            parameter_plan: Value::None,
            device: Value::from("Ascend"),
            level: Value::Int(0),
        }
    }

    /// Sets `out_strategy`; `None` or a sequence of layouts.
    pub fn out_strategy(mut self, out_strategy: impl Into<Value>) -> Self {
        self.out_strategy = out_strategy.into();
        self
    }

    /// Sets `parameter_plan`; `None` or a dict from names to layouts.
    pub fn parameter_plan(mut self, parameter_plan: impl Into<Value>) -> Self {
        self.parameter_plan = parameter_plan.into();
        self
    }

    /// Sets `device`; one of `"CPU"`, `"GPU"` or `"Ascend"`.
    pub fn device(mut self, device: impl Into<Value>) -> Self {
        self.device = device.into();
        self
    }

    /// Sets `level`; 0, 1 or 2.
    pub fn level(mut self, level: impl Into<Value>) -> Self {
        self.level = level.into();
        self
    }

    /// Validates every field and builds the descriptor.
    ///
    /// Fields are checked independently; all problems are returned together, in field
    /// order.
    pub fn validate(&self) -> Result<StrategyDescriptor, ArgumentErrors> {
        let mut errors = Vec::new();

        let in_strategy = collect(&mut errors, strategy_sequence("in_strategy", &self.in_strategy));
        let out_strategy = match &self.out_strategy {
            Value::None => Some(None),
            value => collect(&mut errors, strategy_sequence("out_strategy", value)).map(Some),
        };
        let parameter_plan = collect(&mut errors, parameter_plan(&self.parameter_plan));
        let device = collect(&mut errors, device(&self.device));
        let level = collect(&mut errors, level(&self.level));

        match (in_strategy, out_strategy, parameter_plan, device, level) {
            (Some(in_strategy), Some(out_strategy), Some(parameter_plan), Some(device), Some(level))
                if errors.is_empty() =>
            {
                Ok(StrategyDescriptor {
                    in_strategy,
                    out_strategy,
                    parameter_plan,
                    device,
                    level,
                })
            }
            _ => Err(ArgumentErrors::new(errors)),
        }
    }
}

fn collect<T>(errors: &mut Vec<ArgumentError>, result: Result<T, Vec<ArgumentError>>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(mut field_errors) => {
            errors.append(&mut field_errors);
            None
        }
    }
}

/// A sequence of positive integers, or `None` if `value` is anything else.
fn layout(value: &Value) -> Option<Layout> {
    let factors = value
        .as_sequence()?
        .iter()
        .map(|factor| match factor.as_int() {
            Some(factor) if factor > 0 => usize::try_from(factor).ok(),
            _ => None,
        })
        .collect::<Option<Vec<usize>>>()?;
    Layout::new(factors).ok()
}

fn strategy_sequence(argument: &'static str, value: &Value) -> Result<Vec<Option<Layout>>, Vec<ArgumentError>> {
    let Some(items) = value.as_sequence() else {
        let expected = match argument {
            "out_strategy" => "None or a tuple",
            _ => "a tuple",
        };
        return Err(vec![ArgumentError::UnexpectedType {
            argument,
            expected,
            got: value.type_name(),
        }]);
    };

    let mut errors = Vec::new();
    let layouts = items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::None => None,
            item => {
                let layout = layout(item);
                if layout.is_none() {
                    errors.push(ArgumentError::InvalidLayout {
                        argument,
                        index,
                        got: item.to_string(),
                    });
                }
                layout
            }
        })
        .collect();

    if errors.is_empty() { Ok(layouts) } else { Err(errors) }
}

fn parameter_plan(value: &Value) -> Result<Option<ParameterPlan>, Vec<ArgumentError>> {
    let entries = match value {
        Value::None => return Ok(None),
        Value::Dict(entries) => entries,
        value => {
            return Err(vec![ArgumentError::UnexpectedType {
                argument: "parameter_plan",
                expected: "a dict or None",
                got: value.type_name(),
            }]);
        }
    };

    let mut errors = Vec::new();
    let mut plan = BTreeMap::new();
    for (key, value) in entries {
        let Some(name) = key.as_str() else {
            errors.push(ArgumentError::InvalidParameterName { got: key.type_name() });
            continue;
        };
        if name.is_empty() {
            errors.push(ArgumentError::EmptyParameterName);
            continue;
        }
        let Some(layout) = layout(value) else {
            errors.push(ArgumentError::InvalidParameterLayout {
                name: name.to_owned(),
                got: value.to_string(),
            });
            continue;
        };
        match plan.entry(name.to_owned()) {
            Entry::Vacant(entry) => {
                entry.insert(layout);
            }
            Entry::Occupied(_) => errors.push(ArgumentError::DuplicateParameter { name: name.to_owned() }),
        }
    }

    if errors.is_empty() {
        Ok(Some(ParameterPlan(plan)))
    } else {
        Err(errors)
    }
}

fn device(value: &Value) -> Result<DeviceTarget, Vec<ArgumentError>> {
    let Some(device) = value.as_str() else {
        return Err(vec![ArgumentError::UnexpectedType {
            argument: "device",
            expected: "a string",
            got: value.type_name(),
        }]);
    };
    device.parse().map_err(|_| {
        vec![ArgumentError::UnsupportedDevice {
            device: device.to_owned(),
        }]
    })
}

fn level(value: &Value) -> Result<StrategyLevel, Vec<ArgumentError>> {
    // Front-end booleans are integers, so `True` selects level 1.
    let level = match value {
        Value::Bool(flag) => Some(i64::from(*flag)),
        value => value.as_int(),
    };
    let Some(level) = level else {
        return Err(vec![ArgumentError::UnexpectedType {
            argument: "level",
            expected: "an integer",
            got: value.type_name(),
        }]);
    };
    StrategyLevel::try_from(level).map_err(|error| vec![error])
}
