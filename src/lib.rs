//! Force-curve analysis core for single-molecule AFM pulling experiments.
//!
//! Curves are read through a [`Driver`](drivers::Driver) into named-column
//! [`DataBlock`](data::DataBlock)s. Column derivations ([`vclamp`]), the
//! contact-point estimator ([`surface`]), the peak finder ([`peaks`]) and the
//! polymer fitters ([`fit`]) are exposed as plain functions and as named
//! commands ([`engine::curve_commands`]) that a curve records and replays.

pub mod command;
pub mod config;
pub mod curve;
pub mod data;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod fit;
pub mod peaks;
pub mod playlist;
pub mod signal;
pub mod surface;
pub mod types;
pub mod vclamp;

pub use command::{Command, CommandRegistry, CommandStack, Recorder, Scope};
pub use curve::Curve;
pub use data::DataBlock;
pub use error::{CoreError, ErrorKind, Result};
pub use playlist::Playlist;
pub use types::{Arguments, CommandMessage, Experiment, Info};
