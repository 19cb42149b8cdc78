//! Bookmarked curve playlist with a bound on materialized curves.

use std::collections::VecDeque;
use std::path::Path;

use log::{debug, info};

use crate::command::{CommandStack, Recorder};
use crate::curve::Curve;
use crate::error::{CoreError, Result};
use crate::types::CommandMessage;

pub const DEFAULT_MAX_LOADED: usize = 100;

#[derive(Debug)]
pub struct Playlist {
    pub name: String,
    pub command_stack: CommandStack,
    curves: Vec<Curve>,
    index: usize,
    max_loaded: usize,
    /// Curve indices in the order they were loaded through the playlist.
    load_order: VecDeque<usize>,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new("playlist")
    }
}

impl Playlist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_stack: CommandStack::new(),
            curves: Vec::new(),
            index: 0,
            max_loaded: DEFAULT_MAX_LOADED,
            load_order: VecDeque::new(),
        }
    }

    pub fn with_max_loaded(mut self, max_loaded: usize) -> Self {
        self.max_loaded = max_loaded.max(1);
        self
    }

    pub fn max_loaded(&self) -> usize {
        self.max_loaded
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn curves(&self) -> &[Curve] {
        &self.curves
    }

    pub fn get(&self, index: usize) -> Option<&Curve> {
        self.curves.get(index)
    }

    pub fn append(&mut self, curve: Curve) {
        if curve.is_loaded() {
            self.load_order.push_back(self.curves.len());
        }
        self.curves.push(curve);
        self.enforce_bound();
    }

    pub fn remove(&mut self, index: usize) -> Result<Curve> {
        self.check_index(index)?;
        let curve = self.curves.remove(index);
        self.load_order.retain(|&i| i != index);
        for i in self.load_order.iter_mut() {
            if *i > index {
                *i -= 1;
            }
        }
        if self.index > index || self.index >= self.curves.len() {
            self.index = self.index.saturating_sub(1);
        }
        Ok(curve)
    }

    /// Bookmark, or `None` for an empty playlist.
    pub fn current_index(&self) -> Option<usize> {
        (!self.curves.is_empty()).then_some(self.index)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.curves.get(self.index).map(Curve::path)
    }

    /// The bookmarked curve, loaded on demand.
    pub fn current(&mut self) -> Result<&mut Curve> {
        let index = self.index;
        self.check_index(index)?;
        self.load(index)?;
        Ok(&mut self.curves[index])
    }

    pub fn next(&mut self) {
        if !self.curves.is_empty() {
            self.index = (self.index + 1) % self.curves.len();
        }
    }

    pub fn previous(&mut self) {
        if !self.curves.is_empty() {
            self.index = (self.index + self.curves.len() - 1) % self.curves.len();
        }
    }

    pub fn jump(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        self.index = index;
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.curves.len() {
            return Err(CoreError::IndexOutOfRange {
                index,
                len: self.curves.len(),
            });
        }
        Ok(())
    }

    /// Curves whose data is currently materialized.
    pub fn loaded_count(&self) -> usize {
        self.curves.iter().filter(|c| c.is_loaded()).count()
    }

    /// Loads curve `index` if needed, then evicts the oldest-loaded curves
    /// beyond the bound.
    pub fn load(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        if self.curves[index].is_loaded() {
            return Ok(());
        }
        self.curves[index].load()?;
        self.load_order.push_back(index);
        self.enforce_bound();
        Ok(())
    }

    fn enforce_bound(&mut self) {
        let curves = &self.curves;
        self.load_order.retain(|&i| curves[i].is_loaded());
        while self.load_order.len() > self.max_loaded {
            let Some(evicted) = self.load_order.pop_front() else {
                break;
            };
            self.curves[evicted].unload();
            debug!("evicted curve {evicted} ({:?})", self.curves[evicted].path());
        }
    }

    /// Visits every curve in order (or reverse), moving the bookmark and
    /// loading as it goes. `f` receives the playlist and the load outcome of
    /// the bookmarked curve. The bookmark is restored afterwards.
    pub fn visit<F>(&mut self, reverse: bool, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut Playlist, Result<()>) -> anyhow::Result<()>,
    {
        let saved = self.index;
        let order: Vec<usize> = if reverse {
            (0..self.curves.len()).rev().collect()
        } else {
            (0..self.curves.len()).collect()
        };
        let mut outcome = Ok(());
        for i in order {
            self.index = i;
            let loaded = self.load(i);
            if let Err(e) = f(self, loaded) {
                outcome = Err(e);
                break;
            }
        }
        self.index = saved.min(self.curves.len().saturating_sub(1));
        outcome
    }

    /// Like [`visit`](Self::visit), but a curve that fails to load stops the iteration.
    pub fn items<F>(&mut self, reverse: bool, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut Playlist) -> anyhow::Result<()>,
    {
        self.visit(reverse, |playlist, loaded| {
            loaded?;
            f(playlist)
        })
    }

    /// New playlist of the curves `predicate` keeps; the bookmark follows
    /// the current curve when it survives, else resets to 0.
    pub fn filter<P>(&self, mut predicate: P) -> Playlist
    where
        P: FnMut(&Curve) -> bool,
    {
        let mut kept = Vec::new();
        let mut remap = vec![None; self.curves.len()];
        for (i, curve) in self.curves.iter().enumerate() {
            if predicate(curve) {
                remap[i] = Some(kept.len());
                kept.push(curve.clone());
            }
        }
        let load_order = self
            .load_order
            .iter()
            .filter_map(|&i| remap[i])
            .filter(|&i| kept[i].is_loaded())
            .collect();
        let mut filtered = Playlist {
            name: self.name.clone(),
            command_stack: self.command_stack.clone(),
            index: remap.get(self.index).copied().flatten().unwrap_or(0),
            curves: kept,
            max_loaded: self.max_loaded,
            load_order,
        };
        filtered.enforce_bound();
        info!(
            "filtered {:?}: kept {} of {} curves",
            self.name,
            filtered.len(),
            self.len()
        );
        filtered
    }
}

impl Recorder for Playlist {
    fn record(&mut self, message: CommandMessage) {
        self.command_stack.push(message);
    }
}
