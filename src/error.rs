//! Error types for tpgate
//!
//! Errors are grouped by the phase that produces them. Configuration and
//! environment errors abort before any kernel mutation, apply errors abort a
//! start attempt, teardown errors are only ever logged, and process errors
//! are tolerated during start.

use std::io;

use thiserror::Error;

/// Top-level error type for tpgate
#[derive(Debug, Error)]
pub enum TpgateError {
    /// Invalid policy, configuration file, or list file
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Host is missing something the engine needs (commands, groups)
    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    /// A rule, set, or route could not be installed during start
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// External proxy or resolver process failure
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TpgateError {
    /// Whether the error was raised before the kernel was touched.
    #[must_use]
    pub fn is_pre_mutation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Environment(_))
    }

    /// Check if re-running the operation can succeed without operator changes.
    ///
    /// Apply errors leave partial state behind; `stop` followed by `start`
    /// is the documented recovery.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Environment(_) => false,
            Self::Apply(_) | Self::Process(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Unknown mode / strategy / policy keyword
    #[error("Unknown {kind} '{value}'")]
    UnknownKeyword { kind: &'static str, value: String },

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// A required list file is missing
    #[error("Required list file not found: {path}")]
    MissingListFile { path: String },

    /// A list file line could not be parsed
    #[error("Invalid entry in {path} line {line}: {reason}")]
    ListEntry {
        path: String,
        line: usize,
        reason: String,
    },

    /// I/O error while reading config or lists
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create a list entry error
    pub fn list_entry(path: impl Into<String>, line: usize, reason: impl Into<String>) -> Self {
        Self::ListEntry {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}

/// Host environment errors
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// A required external command is not on PATH
    #[error("Required command not found in PATH: {command}")]
    MissingCommand { command: String },

    /// A process group could not be resolved or created
    #[error("Process group '{name}' unavailable: {reason}")]
    Group { name: String, reason: String },
}

/// Failure class of a kernel-facing command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelErrorKind {
    /// Object (chain, rule, set, route) does not exist
    NotFound,
    /// Object exists but is referenced by something else
    Busy,
    /// Object already exists
    Exists,
    /// Anything else
    Other,
}

/// Error returned by kernel backends (iptables, ipset, ip, sysctl)
#[derive(Debug, Error)]
#[error("{command}: {message}")]
pub struct KernelError {
    /// Command line (or operation) that failed
    pub command: String,
    /// Failure class
    pub kind: KernelErrorKind,
    /// Diagnostic text (stderr or description)
    pub message: String,
}

impl KernelError {
    /// Create a kernel error of a given kind
    pub fn new(command: impl Into<String>, kind: KernelErrorKind, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(command, KernelErrorKind::NotFound, message)
    }

    /// Create a busy error
    pub fn busy(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(command, KernelErrorKind::Busy, message)
    }

    /// Absence is a success condition during cleanup.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == KernelErrorKind::NotFound
    }

    /// Transient "still referenced" condition.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.kind == KernelErrorKind::Busy
    }
}

/// A start step failed
#[derive(Debug, Error)]
#[error("Failed to {step}: {source}")]
pub struct ApplyError {
    /// What the engine was doing
    pub step: String,
    /// Underlying kernel failure
    #[source]
    pub source: KernelError,
}

impl ApplyError {
    /// Wrap a kernel error with the step being applied
    pub fn new(step: impl Into<String>, source: KernelError) -> Self {
        Self {
            step: step.into(),
            source,
        }
    }
}

/// A stop step failed; never aborts teardown
#[derive(Debug, Error)]
#[error("Failed to {step}: {source}")]
pub struct TeardownError {
    /// What the engine was removing
    pub step: String,
    /// Underlying kernel failure
    #[source]
    pub source: KernelError,
}

impl TeardownError {
    /// Wrap a kernel error with the step being torn down
    pub fn new(step: impl Into<String>, source: KernelError) -> Self {
        Self {
            step: step.into(),
            source,
        }
    }
}

/// External process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to launch a program
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// Shell command exited unsuccessfully
    #[error("Command `{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    /// Failed to signal a process
    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// Group name does not resolve to a gid
    #[error("Unknown process group: {0}")]
    UnknownGroup(String),

    /// I/O error
    #[error("Process I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProcessError {
    /// Create a spawn error
    pub fn spawn(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with TpgateError
pub type Result<T> = std::result::Result<T, TpgateError>;
