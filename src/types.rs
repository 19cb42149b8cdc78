// src/types.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form metadata attached to blocks and curves.
pub type Info = BTreeMap<String, Value>;

/// Argument mapping recorded alongside a command name.
pub type Arguments = BTreeMap<String, Value>;

/// Kind of experiment a curve was recorded with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Experiment {
    VelocityClamp,
    ForceClamp,
    TwoColorFluorescence,
    #[default]
    Generic,
}

/// One recorded operation: a command name plus its arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    command: String,
    #[serde(default)]
    arguments: Arguments,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            command: command.into(),
            arguments,
        }
    }

    pub fn bare(command: impl Into<String>) -> Self {
        Self::new(command, Arguments::new())
    }

    /// Builds a message from a JSON object literal; non-object values yield no arguments.
    pub fn with_json(command: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map.into_iter().collect(),
            _ => Arguments::new(),
        };
        Self::new(command, arguments)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}
