//! # DAQ Server Library
//!
//! Acquisition server built on `daq_shared_memory`. One real-time thread runs
//! the base loop: it commits pending parameter writes, computes the demo
//! model into the process image and ticks every task whose decimation
//! divides the base tick counter. Logging sessions run on their own threads
//! and read the task arenas through subscription managers.
//!
//! ## Threads
//!
//! 1. **rt**: [`cycle::BaseLoop`], never blocks on a session
//! 2. **session-N**: [`logger::run_session`], one per logging session
//! 3. **tuner**: periodic parameter writes through a `ParameterClient`

pub mod cycle;
pub mod demo;
pub mod logger;
