use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::command::{CommandRegistry, CommandStack, Recorder};
use crate::data::DataBlock;
use crate::drivers::Driver;
use crate::error::{CoreError, Result};
use crate::types::{CommandMessage, Experiment, Info};

/// One experiment file, loaded lazily through its driver.
#[derive(Clone)]
pub struct Curve {
    path: PathBuf,
    driver: Arc<dyn Driver>,
    pub experiment: Experiment,
    pub note: String,
    pub info: Info,
    pub command_stack: CommandStack,
    blocks: Option<Vec<DataBlock>>,
}

impl Curve {
    pub fn new(path: impl Into<PathBuf>, driver: Arc<dyn Driver>) -> Self {
        Self {
            path: path.into(),
            driver,
            experiment: Experiment::default(),
            note: String::new(),
            info: Info::new(),
            command_stack: CommandStack::new(),
            blocks: None,
        }
    }

    pub fn with_experiment(mut self, experiment: Experiment) -> Self {
        self.experiment = experiment;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn is_loaded(&self) -> bool {
        self.blocks.is_some()
    }

    /// Reads the blocks through the driver unless they are already present.
    pub fn load(&mut self) -> Result<()> {
        if self.blocks.is_some() {
            return Ok(());
        }
        let (blocks, info) = self.driver.read(&self.path, &self.info)?;
        debug!("loaded {:?}: {} blocks", self.path, blocks.len());
        self.info = info;
        self.blocks = Some(blocks);
        Ok(())
    }

    /// Drops the data but keeps path, note, metadata and command stack.
    pub fn unload(&mut self) {
        if self.blocks.take().is_some() {
            debug!("unloaded {:?}", self.path);
        }
    }

    pub fn blocks(&self) -> Result<&[DataBlock]> {
        self.blocks.as_deref().ok_or_else(|| CoreError::NotLoaded {
            path: self.path.clone(),
        })
    }

    pub fn blocks_mut(&mut self) -> Result<&mut Vec<DataBlock>> {
        let path = &self.path;
        self.blocks.as_mut().ok_or_else(|| CoreError::NotLoaded {
            path: path.clone(),
        })
    }

    fn missing_block(&self, name: &str) -> CoreError {
        CoreError::MissingBlock {
            name: name.to_string(),
            available: self
                .blocks
                .iter()
                .flatten()
                .map(|b| b.name().unwrap_or_default().to_string())
                .collect(),
        }
    }

    pub fn block(&self, name: &str) -> Result<&DataBlock> {
        self.blocks()?
            .iter()
            .find(|b| b.name() == Some(name))
            .ok_or_else(|| self.missing_block(name))
    }

    pub fn block_mut(&mut self, name: &str) -> Result<&mut DataBlock> {
        let missing = self.missing_block(name);
        self.blocks_mut()?
            .iter_mut()
            .find(|b| b.name() == Some(name))
            .ok_or(missing)
    }

    /// Replays the curve's own stack against its current data.
    pub fn replay(&mut self, registry: &CommandRegistry<Curve>) -> anyhow::Result<()> {
        let stack = self.command_stack.clone();
        stack.execute(self, registry)
    }
}

impl Recorder for Curve {
    fn record(&mut self, message: CommandMessage) {
        self.command_stack.push(message);
    }
}

impl fmt::Debug for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Curve")
            .field("path", &self.path)
            .field("driver", &self.driver.name())
            .field("experiment", &self.experiment)
            .field("loaded", &self.is_loaded())
            .field("commands", &self.command_stack.len())
            .finish()
    }
}
