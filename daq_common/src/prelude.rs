//! Prelude module for common re-exports.
//!
//! ```rust
//! use daq_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AcquisitionConfig, ConfigError, ConfigLoader, MailboxConfig, ServerConfig, SharedConfig,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_BUFFER_SECONDS, DEFAULT_POLL_INTERVAL};

// ─── Value types ────────────────────────────────────────────────────
pub use crate::layout::{ElementLayout, LayoutError, Primitive, PrimitiveType};
pub use crate::timestamp::Timestamp;
