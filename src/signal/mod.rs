// src/signal/mod.rs
pub mod calculus;
pub mod fft;
pub mod filter;
pub mod noise;

pub use calculus::{derivative, Stencil};
pub use fft::{averaged_power_spectrum, power_spectrum, PowerSpectrum, Window};
pub use filter::{convolve_same, median_filter};
pub use noise::{trimmed_deviation, NoiseFloor};
