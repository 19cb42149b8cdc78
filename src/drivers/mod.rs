// src/drivers/mod.rs
pub mod source;

pub use source::{Driver, MemoryDriver};
