//! Recorded operations and the registry that dispatches them by name.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Arguments, CommandMessage};

/// Ordered provenance log of the operations applied to a target.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStack {
    messages: Vec<CommandMessage>,
}

impl CommandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: CommandMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[CommandMessage] {
        &self.messages
    }

    /// Replays every message, in order, without recording.
    pub fn execute<T: Recorder>(
        &self,
        target: &mut T,
        registry: &CommandRegistry<T>,
    ) -> anyhow::Result<()> {
        self.execute_filtered(target, registry, |_, _| true)
    }

    /// Replays the messages `filter` accepts, in order, without recording.
    pub fn execute_filtered<T, F>(
        &self,
        target: &mut T,
        registry: &CommandRegistry<T>,
        mut filter: F,
    ) -> anyhow::Result<()>
    where
        T: Recorder,
        F: FnMut(&T, &CommandMessage) -> bool,
    {
        for message in &self.messages {
            if !filter(target, message) {
                debug!("replay: skipping {:?}", message.command());
                continue;
            }
            registry.run(target, message, false)?;
        }
        Ok(())
    }
}

impl FromIterator<CommandMessage> for CommandStack {
    fn from_iter<I: IntoIterator<Item = CommandMessage>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

/// Something that keeps its own command stack.
pub trait Recorder {
    fn record(&mut self, message: CommandMessage);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Curve,
    Playlist,
}

pub type Handler<T> = Box<dyn Fn(&mut T, &Arguments) -> anyhow::Result<()> + Send + Sync>;

pub struct Command<T> {
    name: String,
    help: String,
    scope: Scope,
    handler: Handler<T>,
}

impl<T> Command<T> {
    pub fn new<F>(name: impl Into<String>, scope: Scope, help: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut T, &Arguments) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            help: help.into(),
            scope,
            handler: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// Name to handler mapping for one kind of target.
pub struct CommandRegistry<T> {
    commands: BTreeMap<String, Command<T>>,
}

impl<T> Default for CommandRegistry<T> {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
        }
    }
}

impl<T> CommandRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command, replacing any command of the same name.
    pub fn register(&mut self, command: Command<T>) -> &mut Self {
        self.commands.insert(command.name.clone(), command);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Command<T>> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Runs one message against `target`; on success and with `record`, the
    /// message is appended to the target's own stack.
    pub fn run(&self, target: &mut T, message: &CommandMessage, record: bool) -> anyhow::Result<()>
    where
        T: Recorder,
    {
        let command = self
            .commands
            .get(message.command())
            .ok_or_else(|| CoreError::UnknownCommand {
                name: message.command().to_string(),
            })?;
        debug!("running {:?}", command.name);
        (command.handler)(target, message.arguments())?;
        if record {
            target.record(message.clone());
        }
        Ok(())
    }
}
