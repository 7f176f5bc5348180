//! Error types for registration, arena setup, subscriptions and parameters

use daq::layout::LayoutError;
use thiserror::Error;

/// Setup-time failures. Every one of them is fatal: the process must not
/// enter real-time operation after receiving one.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Path already registered (signals and parameters share one namespace)
    #[error("Duplicate path: {path}")]
    DuplicatePath {
        /// Offending path
        path: String,
    },

    /// Path is empty or does not start with '/'
    #[error("Invalid path: '{path}' (must start with '/')")]
    InvalidPath {
        /// Offending path
        path: String,
    },

    /// Lookup of an unknown path
    #[error("Variable not found: {path}")]
    NotFound {
        /// Requested path
        path: String,
    },

    /// Registration or metadata change after `finalize()`
    #[error("Registry is finalized, cannot modify {path}")]
    RegistryFinalized {
        /// Path of the rejected change
        path: String,
    },

    /// Element layout rejected
    #[error("Invalid layout for {path}: {source}")]
    InvalidLayout {
        /// Variable path
        path: String,
        /// Layout error
        #[source]
        source: LayoutError,
    },

    /// Task id outside the configured task table
    #[error("Unknown task {task_id} for {path}")]
    UnknownTask {
        /// Variable path
        path: String,
        /// Requested task id
        task_id: usize,
    },

    /// Storage offset plus size exceeds the process image
    #[error("Storage of {path} ({offset}+{size}) exceeds process image of {image_len} bytes")]
    StorageOutOfBounds {
        /// Variable path
        path: String,
        /// Byte offset
        offset: usize,
        /// Byte size
        size: usize,
        /// Process image length
        image_len: usize,
    },

    /// Storage offset not aligned to the element width
    #[error("Storage of {path} at offset {offset} not aligned to {alignment}")]
    AlignmentError {
        /// Variable path
        path: String,
        /// Byte offset
        offset: usize,
        /// Required alignment
        alignment: usize,
    },

    /// Invalid arena size
    #[error("Invalid arena size: {size} bytes (must be 4KB-1GB)")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Invalid task timing
    #[error("Invalid sample time {sample_time} for task {task_id}")]
    InvalidSampleTime {
        /// Task id
        task_id: usize,
        /// Requested sample time
        sample_time: f64,
    },

    /// Arena mapping failed
    #[error("Arena allocation failed for task {task_id}: {source}")]
    ArenaAllocation {
        /// Task id
        task_id: usize,
        /// Source IO error
        #[source]
        source: std::io::Error,
    },
}

/// Result type for setup operations
pub type SetupResult<T> = Result<T, SetupError>;

/// Failures of a session changing its subscriptions. Local to that session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The mailbox stayed full for the whole retry budget
    #[error("Subscription change failed for task {task_id}, retry later")]
    MailboxFull {
        /// Task id
        task_id: usize,
    },

    /// Signal index does not exist
    #[error("Unknown signal index {signal}")]
    UnknownSignal {
        /// Signal index
        signal: usize,
    },

    /// Signal belongs to a task this session has no handle for
    #[error("Signal {signal} belongs to task {task_id} which is not served")]
    TaskNotServed {
        /// Signal index
        signal: usize,
        /// Task id
        task_id: usize,
    },
}

/// Parameter write failures. Each maps onto a negative errno-style code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    /// Parameter index does not exist
    #[error("Unknown parameter index {parameter}")]
    UnknownParameter {
        /// Parameter index
        parameter: usize,
    },

    /// Parameter is not writable
    #[error("Parameter {parameter} is read-only")]
    AccessDenied {
        /// Parameter index
        parameter: usize,
    },

    /// Element range or byte count does not match the layout
    #[error("Invalid range for parameter {parameter}: start {start}, count {count}")]
    InvalidRange {
        /// Parameter index
        parameter: usize,
        /// First element
        start: usize,
        /// Number of elements
        count: usize,
    },

    /// Check or commit callback returned non-zero
    #[error("Parameter {parameter} rejected with code {code}")]
    Rejected {
        /// Parameter index
        parameter: usize,
        /// Negative callback code
        code: i32,
    },

    /// The real-time side did not acknowledge within the retry budget
    #[error("Parameter {parameter} commit not acknowledged")]
    CommitTimeout {
        /// Parameter index
        parameter: usize,
    },
}

impl ParameterError {
    /// Negative error code reported to protocol sessions.
    pub fn code(&self) -> i32 {
        match self {
            Self::UnknownParameter { .. } => -libc::ENOENT,
            Self::AccessDenied { .. } => -libc::EACCES,
            Self::InvalidRange { .. } => -libc::ERANGE,
            Self::Rejected { code, .. } => *code,
            Self::CommitTimeout { .. } => -libc::ETIMEDOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_codes_are_negative() {
        let errors = [
            ParameterError::UnknownParameter { parameter: 0 },
            ParameterError::AccessDenied { parameter: 0 },
            ParameterError::InvalidRange {
                parameter: 0,
                start: 3,
                count: 9,
            },
            ParameterError::Rejected {
                parameter: 0,
                code: -5,
            },
            ParameterError::CommitTimeout { parameter: 0 },
        ];
        for e in errors {
            assert!(e.code() < 0, "{e} -> {}", e.code());
        }
    }

    #[test]
    fn setup_error_messages_name_the_path() {
        let e = SetupError::DuplicatePath {
            path: "/plant/speed".to_string(),
        };
        assert_eq!(e.to_string(), "Duplicate path: /plant/speed");
    }
}
