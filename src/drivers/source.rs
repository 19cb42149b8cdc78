use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::data::DataBlock;
use crate::error::{CoreError, Result};
use crate::types::Info;

/// File-format reader that turns a curve file into data blocks.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `path` looks like a file this driver understands.
    fn sniff(&self, path: &Path) -> bool;

    /// Reads every block of the curve. `info` is the curve's metadata so
    /// far; the returned map replaces it.
    fn read(&self, path: &Path, info: &Info) -> Result<(Vec<DataBlock>, Info)>;
}

/// In-memory driver useful for tests and deterministic playback.
#[derive(Default)]
pub struct MemoryDriver {
    curves: RwLock<HashMap<PathBuf, (Vec<DataBlock>, Info)>>,
    reads: AtomicUsize,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, blocks: Vec<DataBlock>, info: Info) {
        if let Ok(mut curves) = self.curves.write() {
            curves.insert(path.into(), (blocks, info));
        }
    }

    /// Number of successful reads so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn sniff(&self, path: &Path) -> bool {
        self.curves
            .read()
            .map(|curves| curves.contains_key(path))
            .unwrap_or(false)
    }

    fn read(&self, path: &Path, info: &Info) -> Result<(Vec<DataBlock>, Info)> {
        let curves = self.curves.read().map_err(|_| CoreError::Driver {
            path: path.to_path_buf(),
            reason: "store lock poisoned".into(),
        })?;
        let (blocks, stored) = curves.get(path).ok_or_else(|| CoreError::Driver {
            path: path.to_path_buf(),
            reason: "no such curve".into(),
        })?;
        let mut merged = info.clone();
        merged.extend(stored.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok((blocks.clone(), merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_return_copies_and_count() {
        let driver = MemoryDriver::new();
        let block = DataBlock::from_columns(vec![("z piezo (m)", vec![0.0, 1e-9])]).unwrap();
        let mut info = Info::new();
        info.insert("temperature (K)".into(), json!(300.0));
        driver.insert("a.jpk", vec![block.clone()], info);

        assert!(driver.sniff(Path::new("a.jpk")));
        assert!(!driver.sniff(Path::new("b.jpk")));
        let mut prior = Info::new();
        prior.insert("note".into(), json!("kept"));
        let (blocks, merged) = driver.read(Path::new("a.jpk"), &prior).unwrap();
        assert_eq!(blocks, vec![block]);
        assert_eq!(merged["note"], json!("kept"));
        assert_eq!(merged["temperature (K)"], json!(300.0));
        assert_eq!(driver.reads(), 1);

        let err = driver.read(Path::new("b.jpk"), &Info::new()).unwrap_err();
        assert!(matches!(err, CoreError::Driver { .. }));
        assert_eq!(driver.reads(), 1);
    }
}
