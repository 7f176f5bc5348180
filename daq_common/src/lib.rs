//! DAQ Common Library
//!
//! This crate provides the value types, constants and configuration loading
//! utilities shared by all DAQ workspace crates.
//!
//! # Module Structure
//!
//! - [`layout`] - Element layout of signals and parameters (type, dims, sizes)
//! - [`timestamp`] - Wall-clock timestamp carried by data frames
//! - [`consts`] - Arena sizing limits and default intervals
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! daq = { package = "daq_common", path = "../daq_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use daq_common::layout::{ElementLayout, PrimitiveType};
//! use daq_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod layout;
pub mod prelude;
pub mod timestamp;
