//! Platform-specific memory mapping

pub mod linux;

pub use linux::{ArenaMemoryConfig, map_arena};
