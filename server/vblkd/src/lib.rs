//! The vblkd driver server: connection management and the factory surface.

#![forbid(unsafe_code)]

pub mod driver;

pub use driver::{DeviceSummary, Driver};
