//! Built-in commands and batch operations over playlists.
//!
//! Batch operations never stop on a curve that merely lacks input or fails
//! a fit: those are recorded in a [`BatchSummary`] and the batch moves on.
//! Contract violations abort the batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandRegistry, CommandStack, Scope};
use crate::config::{
    from_arguments, BlindWindow, ConvolutionConfig, FitConfig, FlatFilterConfig, FlattenConfig,
    SurfaceConfig,
};
use crate::curve::Curve;
use crate::data::DataBlock;
use crate::error::{CoreError, Result};
use crate::fit::{fit_polymer, ContactPoint, FitResult};
use crate::peaks::{find_peaks, flat_filter_count, Peak};
use crate::playlist::Playlist;
use crate::surface::SurfaceContact;
use crate::types::{Arguments, CommandMessage};
use crate::vclamp::{
    add_cantilever_adjusted_extension_array, add_flattened_extension_array, add_force_array,
    zero_surface_contact_point, ADJUSTED_EXTENSION, DEFLECTION, FORCE, SURFACE_CONTACT_KEY,
    SURFACE_DEFLECTION,
};

pub const PEAKS_KEY: &str = "peaks";
pub const POLYMER_FIT_KEY: &str = "polymer fit";
pub const FLAT_FILTER_KEY: &str = "flat filter";
pub const RETRACT: &str = "retract";

fn retract() -> String {
    RETRACT.to_string()
}

fn force_column() -> String {
    FORCE.to_string()
}

fn extension_column() -> String {
    ADJUSTED_EXTENSION.to_string()
}

/// Blocks named by `block`, or every block when it is `None`.
fn selected<'a>(curve: &'a mut Curve, block: Option<&str>) -> Result<Vec<&'a mut DataBlock>> {
    match block {
        Some(name) => Ok(vec![curve.block_mut(name)?]),
        None => Ok(curve.blocks_mut()?.iter_mut().collect()),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ContactArgs {
    block: Option<String>,
    #[serde(flatten)]
    config: SurfaceConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct ForceArgs {
    block: Option<String>,
    column: String,
}

impl Default for ForceArgs {
    fn default() -> Self {
        Self {
            block: None,
            column: SURFACE_DEFLECTION.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct BlockArgs {
    block: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FlattenArgs {
    block: Option<String>,
    #[serde(flatten)]
    config: FlattenConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct PeakArgs {
    block: String,
    column: String,
    /// Only needed for a distance blind window.
    x_column: Option<String>,
    #[serde(flatten)]
    config: ConvolutionConfig,
}

impl Default for PeakArgs {
    fn default() -> Self {
        Self {
            block: retract(),
            column: force_column(),
            x_column: None,
            config: ConvolutionConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct FlatArgs {
    block: String,
    column: String,
    #[serde(flatten)]
    config: FlatFilterConfig,
}

impl Default for FlatArgs {
    fn default() -> Self {
        Self {
            block: retract(),
            column: DEFLECTION.to_string(),
            config: FlatFilterConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct PolymerArgs {
    block: String,
    x_column: String,
    f_column: String,
    /// Explicit window; otherwise each stored peak is fitted.
    bounds: Option<(usize, usize)>,
    #[serde(flatten)]
    config: FitConfig,
}

impl Default for PolymerArgs {
    fn default() -> Self {
        Self {
            block: retract(),
            x_column: extension_column(),
            f_column: force_column(),
            bounds: None,
            config: FitConfig::default(),
        }
    }
}

/// Peaks found in `block`, stored under [`PEAKS_KEY`] (replacing earlier results).
pub fn find_block_peaks(
    block: &mut DataBlock,
    column: &str,
    x_column: Option<&str>,
    cfg: &ConvolutionConfig,
) -> Result<Vec<Peak>> {
    let signal = block.column_vec(column)?;
    let x = x_column.map(|c| block.column_vec(c)).transpose()?;
    let peaks = find_peaks(&signal, x.as_deref(), cfg)?;
    block.set_info_json(PEAKS_KEY, &peaks)?;
    Ok(peaks)
}

/// Fits the polymer model to every stored peak, or to `bounds` when given.
///
/// Each peak is fitted from the previous peak's tip (or the contact point)
/// to its own tip. Peaks whose fit is poor keep `fit: None`; the call fails
/// only if no peak could be fitted.
pub fn fit_block_peaks(
    block: &mut DataBlock,
    x_column: &str,
    f_column: &str,
    bounds: Option<(usize, usize)>,
    cfg: &FitConfig,
) -> Result<Vec<FitResult>> {
    let x = block.column_vec(x_column)?;
    let y = block.column_vec(f_column)?;
    let contact: SurfaceContact = block.info_json(SURFACE_CONTACT_KEY)?;
    let contact = ContactPoint::at(contact.index, &x, &y)?;

    if let Some(bounds) = bounds {
        let fit = fit_polymer(&x, &y, contact, bounds, cfg)?;
        block.set_info_json(POLYMER_FIT_KEY, &vec![fit.clone()])?;
        return Ok(vec![fit]);
    }

    let mut peaks: Vec<Peak> = block.info_json(PEAKS_KEY)?;
    if peaks.is_empty() {
        return Err(CoreError::degenerate("no peaks to fit"));
    }
    let mut fits = Vec::new();
    let mut first_error = None;
    let mut start = contact.index;
    for peak in peaks.iter_mut() {
        let window = (start, peak.tip);
        start = peak.tip;
        match fit_polymer(&x, &y, contact, window, cfg) {
            Ok(fit) => {
                peak.fit = Some(fit.clone());
                fits.push(fit);
            }
            Err(e) if e.is_recoverable() => {
                warn!("{}: {e}", peak.name);
                peak.fit = None;
                first_error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    if fits.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    block.set_info_json(PEAKS_KEY, &peaks)?;
    block.set_info_json(POLYMER_FIT_KEY, &fits)?;
    Ok(fits)
}

/// Registry of the commands that operate on a single curve.
pub fn curve_commands() -> CommandRegistry<Curve> {
    let mut registry = CommandRegistry::new();
    registry
        .register(Command::new(
            "zero surface contact point",
            Scope::Curve,
            "Fit the contact point and add surface distance/deflection columns.",
            |curve: &mut Curve, args: &Arguments| {
                let args: ContactArgs = from_arguments("zero surface contact point", args)?;
                for block in selected(curve, args.block.as_deref())? {
                    zero_surface_contact_point(block, &args.config)?;
                }
                Ok(())
            },
        ))
        .register(Command::new(
            "add block force array",
            Scope::Curve,
            "Convert a deflection column in metres to force.",
            |curve: &mut Curve, args: &Arguments| {
                let args: ForceArgs = from_arguments("add block force array", args)?;
                for block in selected(curve, args.block.as_deref())? {
                    add_force_array(block, &args.column)?;
                }
                Ok(())
            },
        ))
        .register(Command::new(
            "add block cantilever adjusted extension array",
            Scope::Curve,
            "Subtract cantilever bending from the surface distance.",
            |curve: &mut Curve, args: &Arguments| {
                let args: BlockArgs =
                    from_arguments("add block cantilever adjusted extension array", args)?;
                for block in selected(curve, args.block.as_deref())? {
                    add_cantilever_adjusted_extension_array(block)?;
                }
                Ok(())
            },
        ))
        .register(Command::new(
            "add flattened extension array",
            Scope::Curve,
            "Subtract a polynomial baseline from the off-surface force.",
            |curve: &mut Curve, args: &Arguments| {
                let args: FlattenArgs = from_arguments("add flattened extension array", args)?;
                for block in selected(curve, args.block.as_deref())? {
                    add_flattened_extension_array(block, &args.config)?;
                }
                Ok(())
            },
        ))
        .register(Command::new(
            "find peaks",
            Scope::Curve,
            "Convolution peak search; results stored in the block info.",
            |curve: &mut Curve, args: &Arguments| {
                let args: PeakArgs = from_arguments("find peaks", args)?;
                let block = curve.block_mut(&args.block)?;
                find_block_peaks(block, &args.column, args.x_column.as_deref(), &args.config)?;
                Ok(())
            },
        ))
        .register(Command::new(
            "flat filter",
            Scope::Curve,
            "Count derivative features; stored in the curve info.",
            |curve: &mut Curve, args: &Arguments| {
                let args: FlatArgs = from_arguments("flat filter", args)?;
                let signal = curve.block(&args.block)?.column_vec(&args.column)?;
                let count = flat_filter_count(&signal, &args.config);
                curve.info.insert(FLAT_FILTER_KEY.into(), count.into());
                Ok(())
            },
        ))
        .register(Command::new(
            "polymer fit",
            Scope::Curve,
            "Fit a polymer model to the stored peaks or an explicit window.",
            |curve: &mut Curve, args: &Arguments| {
                let args: PolymerArgs = from_arguments("polymer fit", args)?;
                let block = curve.block_mut(&args.block)?;
                fit_block_peaks(block, &args.x_column, &args.f_column, args.bounds, &args.config)?;
                Ok(())
            },
        ));
    registry
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct JumpArgs {
    index: usize,
}

/// Registry of the playlist navigation commands.
pub fn playlist_commands() -> CommandRegistry<Playlist> {
    let mut registry = CommandRegistry::new();
    registry
        .register(Command::new(
            "next curve",
            Scope::Playlist,
            "Move the bookmark forward, wrapping at the end.",
            |playlist: &mut Playlist, _: &Arguments| {
                playlist.next();
                Ok(())
            },
        ))
        .register(Command::new(
            "previous curve",
            Scope::Playlist,
            "Move the bookmark back, wrapping at the start.",
            |playlist: &mut Playlist, _: &Arguments| {
                playlist.previous();
                Ok(())
            },
        ))
        .register(Command::new(
            "jump to curve",
            Scope::Playlist,
            "Move the bookmark to `index`.",
            |playlist: &mut Playlist, args: &Arguments| {
                let args: JumpArgs = from_arguments("jump to curve", args)?;
                playlist.jump(args.index)?;
                Ok(())
            },
        ));
    registry
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Curve path and error message of every failure, in visiting order.
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    /// Records the outcome for one curve; unrecoverable errors are handed back.
    fn record(&mut self, path: PathBuf, outcome: anyhow::Result<()>) -> anyhow::Result<()> {
        match outcome {
            Ok(()) => {
                self.succeeded += 1;
                Ok(())
            }
            Err(e) => {
                let fatal = e
                    .downcast_ref::<CoreError>()
                    .map_or(false, |core| !core.is_recoverable());
                if fatal {
                    return Err(e);
                }
                warn!("skipping {path:?}: {e:#}");
                self.failed += 1;
                self.failures.push((path, format!("{e:#}")));
                Ok(())
            }
        }
    }
}

/// Replays `stack` on every curve of the playlist, recording nothing.
///
/// Only messages `filter` accepts are executed.
pub fn apply_stack<F>(
    playlist: &mut Playlist,
    registry: &CommandRegistry<Curve>,
    stack: &CommandStack,
    mut filter: F,
) -> anyhow::Result<BatchSummary>
where
    F: FnMut(&Curve, &CommandMessage) -> bool,
{
    let mut summary = BatchSummary::default();
    playlist.visit(false, |pl, loaded| {
        let path = pl.current_path().map(Path::to_path_buf).unwrap_or_default();
        let outcome = loaded
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                let curve = pl.current()?;
                stack.execute_filtered(curve, registry, &mut filter)
            });
        summary.record(path, outcome)
    })?;
    info!(
        "applied {} commands: {} curves succeeded, {} failed",
        stack.len(),
        summary.succeeded,
        summary.failed
    );
    Ok(summary)
}

/// Runs `score` on `block` of every curve and keeps the curves it accepts.
fn filter_playlist<S>(
    playlist: &mut Playlist,
    block: &str,
    mut score: S,
) -> anyhow::Result<(Playlist, BatchSummary)>
where
    S: FnMut(&DataBlock) -> Result<bool>,
{
    let mut summary = BatchSummary::default();
    let mut keep: HashSet<PathBuf> = HashSet::new();
    playlist.visit(false, |pl, loaded| {
        let path = pl.current_path().map(Path::to_path_buf).unwrap_or_default();
        let outcome = loaded.and_then(|()| {
            let curve = pl.current()?;
            score(curve.block(block)?)
        });
        let outcome = match outcome {
            Ok(true) => {
                keep.insert(path.clone());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e.into()),
        };
        summary.record(path, outcome)
    })?;
    let filtered = playlist.filter(|c| keep.contains(c.path()));
    info!(
        "filter kept {} of {} curves ({} failed)",
        filtered.len(),
        playlist.len(),
        summary.failed
    );
    Ok((filtered, summary))
}

/// Keeps the curves whose flat-filter feature count is non-zero.
pub fn flat_filter_playlist(
    playlist: &mut Playlist,
    block: &str,
    column: &str,
    cfg: &FlatFilterConfig,
) -> anyhow::Result<(Playlist, BatchSummary)> {
    filter_playlist(playlist, block, |b| {
        Ok(flat_filter_count(&b.column_vec(column)?, cfg) > 0)
    })
}

/// Keeps the curves with at least `min_peaks` convolution peaks.
///
/// `x_column` is read only for a distance blind window.
pub fn convolution_filter_playlist(
    playlist: &mut Playlist,
    block: &str,
    column: &str,
    x_column: Option<&str>,
    cfg: &ConvolutionConfig,
    min_peaks: usize,
) -> anyhow::Result<(Playlist, BatchSummary)> {
    filter_playlist(playlist, block, |b| {
        let x = match (cfg.blind_window, x_column) {
            (BlindWindow::Distance(_), Some(c)) => Some(b.column_vec(c)?),
            _ => None,
        };
        let peaks = find_peaks(&b.column_vec(column)?, x.as_deref(), cfg)?;
        Ok(peaks.len() >= min_peaks.max(1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::types::Info;
    use crate::vclamp::{SPRING_CONSTANT, SURFACE_DISTANCE, Z_PIEZO};
    use serde_json::json;
    use std::sync::Arc;

    /// Contact ramp over the first 100 rows, then `features` small alternating steps.
    fn block(features: usize) -> DataBlock {
        let n: usize = 600;
        let z: Vec<f64> = (0..n).map(|i| i as f64 * 1e-9).collect();
        let d: Vec<f64> = (0..n)
            .map(|i| {
                let ramp = 1e-10 * i.min(100) as f64;
                let crossed = (0..features).filter(|k| i >= 200 + 60 * k).count();
                ramp + if crossed % 2 == 1 { 2e-10 } else { 0.0 }
            })
            .collect();
        DataBlock::from_columns(vec![(Z_PIEZO, z), (DEFLECTION, d)])
            .unwrap()
            .with_name(RETRACT)
            .with_info(SPRING_CONSTANT, json!(0.05))
    }

    fn playlist() -> Playlist {
        let driver = Arc::new(MemoryDriver::new());
        driver.insert("busy", vec![block(5)], Info::new());
        driver.insert("flat", vec![block(0)], Info::new());
        let bare = DataBlock::from_columns(vec![(Z_PIEZO, vec![0.0; 10])])
            .unwrap()
            .with_name(RETRACT);
        driver.insert("bare", vec![bare], Info::new());
        let mut playlist = Playlist::new("batch");
        for path in ["busy", "flat", "bare"] {
            playlist.append(Curve::new(path, driver.clone()));
        }
        playlist
    }

    #[test]
    fn recorded_commands_replay_across_a_playlist() {
        let registry = curve_commands();
        let mut p = playlist();
        let curve = p.current().unwrap();
        registry
            .run(curve, &CommandMessage::bare("zero surface contact point"), true)
            .unwrap();
        registry
            .run(curve, &CommandMessage::bare("add block force array"), true)
            .unwrap();
        assert_eq!(curve.command_stack.len(), 2);
        let stack = curve.command_stack.clone();

        let summary = apply_stack(&mut p, &registry, &stack, |_, _| true).unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].0, PathBuf::from("bare"));
        assert!(p.get(1).unwrap().block(RETRACT).unwrap().has_column(SURFACE_DISTANCE));
        // replay leaves provenance alone
        assert_eq!(p.get(0).unwrap().command_stack.len(), 2);
        assert_eq!(p.get(1).unwrap().command_stack.len(), 0);
    }

    #[test]
    fn unknown_commands_abort_the_batch() {
        let registry = curve_commands();
        let mut p = playlist();
        let stack: CommandStack = vec![CommandMessage::bare("no such thing")].into_iter().collect();
        assert!(apply_stack(&mut p, &registry, &stack, |_, _| true).is_err());
        assert_eq!(p.current_index(), Some(0));
    }

    #[test]
    fn flat_filter_drops_featureless_curves() {
        let mut p = playlist();
        let (kept, summary) =
            flat_filter_playlist(&mut p, RETRACT, DEFLECTION, &FlatFilterConfig::default()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get(0).unwrap().path(), PathBuf::from("busy").as_path());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 2);
    }

    fn spiked(at: usize) -> DataBlock {
        let z: Vec<f64> = (0..600).map(|i| i as f64 * 2e-9).collect();
        let d: Vec<f64> = (0..600)
            .map(|i| if (at..at + 5).contains(&i) { -5e-9 } else { 0.0 })
            .collect();
        DataBlock::from_columns(vec![(Z_PIEZO, z), (DEFLECTION, d)])
            .unwrap()
            .with_name(RETRACT)
    }

    #[test]
    fn convolution_filter_honours_a_distance_blind_window() {
        let driver = Arc::new(MemoryDriver::new());
        driver.insert("early", vec![spiked(30)], Info::new());
        driver.insert("late", vec![spiked(400)], Info::new());
        let mut p = Playlist::new("spikes");
        for path in ["early", "late"] {
            p.append(Curve::new(path, driver.clone()));
        }
        let cfg = ConvolutionConfig {
            blind_window: BlindWindow::Distance(120e-9),
            ..ConvolutionConfig::default()
        };

        let (kept, summary) =
            convolution_filter_playlist(&mut p, RETRACT, DEFLECTION, Some(Z_PIEZO), &cfg, 1)
                .unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get(0).unwrap().path(), PathBuf::from("late").as_path());

        let (all, _) = convolution_filter_playlist(
            &mut p,
            RETRACT,
            DEFLECTION,
            None,
            &ConvolutionConfig::default(),
            1,
        )
        .unwrap();
        assert_eq!(all.len(), 2);
        // a distance window without positions is a caller error, not a skipped curve
        assert!(convolution_filter_playlist(&mut p, RETRACT, DEFLECTION, None, &cfg, 1).is_err());
    }

    #[test]
    fn playlist_commands_move_the_bookmark() {
        let registry = playlist_commands();
        let mut p = playlist();
        registry.run(&mut p, &CommandMessage::bare("previous curve"), true).unwrap();
        assert_eq!(p.current_index(), Some(2));
        registry
            .run(&mut p, &CommandMessage::with_json("jump to curve", json!({"index": 1})), true)
            .unwrap();
        assert_eq!(p.current_index(), Some(1));
        assert_eq!(p.command_stack.len(), 2);
        let err = registry
            .run(&mut p, &CommandMessage::with_json("jump to curve", json!({"index": 9})), false)
            .unwrap_err();
        assert!(!err.downcast_ref::<CoreError>().unwrap().is_recoverable());
    }
}
