pub mod lsq;
pub mod polymer;

pub use lsq::{least_squares, LsqOutcome};
pub use polymer::{
    extended_fjc_extension, fit_polymer, fjc_extension, fjc_peg_extension, peg_segment_length,
    wlc_force, ContactPoint, FitResult, PolymerModel, BOLTZMANN,
};
