//! Hardware drivers for motion test bench equipment.
//!
//! Each driver is feature-gated for optional compilation.
//!
//! # Features
//!
//! - `galil` - Galil DMC motion controller (Ethernet, cross-platform)

#[cfg(feature = "galil")]
pub mod galil;
