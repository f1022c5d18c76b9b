//! Error types for graph loading, configuration, and enumeration runs.
//!
//! Every failure in this crate is fatal to the run that observes it: there is no retry path.
//! Library code returns these types; the binary wraps them with `anyhow` context.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Graph input
// ============================================================================

/// Errors raised while reading or building a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The input file could not be opened.
    #[error("could not open {}: {source}", path.display())]
    Open {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Reading from an opened input failed.
    #[error("I/O error while reading graph: {0}")]
    Io(#[from] io::Error),
    /// A line could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },
    /// An edge endpoint or vertex id is outside `0..n`.
    #[error("line {line}: vertex {vertex} is out of range for a graph with {n} vertices")]
    VertexOutOfRange {
        /// 1-based line number.
        line: usize,
        /// The offending id, as written in the file (before one-based adjustment).
        vertex: u64,
        /// Declared vertex count.
        n: usize,
    },
    /// The declared vertex count does not fit the selected vertex id width.
    #[error("graph has {n} vertices, which does not fit {bits}-bit vertex ids (use --huge-graph)")]
    TooManyVertices {
        /// Declared vertex count.
        n: usize,
        /// Width of the vertex id type.
        bits: u32,
    },
    /// The adjacency lists for the declared vertex count could not be allocated.
    #[error("cannot allocate adjacency lists for {n} vertices")]
    Allocation {
        /// Declared vertex count.
        n: usize,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Invalid run configuration, detected before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A flag holds a value outside its valid domain.
    #[error("invalid value for --{flag}: {message}")]
    Invalid {
        /// Flag name without the leading dashes.
        flag: &'static str,
        /// Explanation of the constraint.
        message: String,
    },
    /// The distributed enumerator was requested but the build does not include it.
    #[error(
        "the distributed enumerator is not available in this build; \
         rebuild with `--features distributed`"
    )]
    DistributedUnavailable,
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(flag: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            flag,
            message: message.into(),
        }
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// Failure of a single `expand` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expansion failed: {message}")]
pub struct ExpandError {
    message: String,
}

impl ExpandError {
    /// Creates an expansion error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that abort an enumeration run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumError {
    /// An `expand` call failed.
    #[error(transparent)]
    Expand(#[from] ExpandError),
    /// A worker thread panicked.
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked {
        /// Index of the worker thread.
        worker: usize,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// A worker thread could not be spawned.
    #[error("could not spawn worker thread: {0}")]
    Spawn(String),
    /// A rank of a distributed run reported a failure.
    #[error("rank {rank} failed: {reason}")]
    RankFailed {
        /// Rank that failed.
        rank: usize,
        /// Failure reported by the rank.
        reason: String,
    },
    /// The run was aborted by the coordinator.
    #[error("run aborted: {0}")]
    Aborted(String),
    /// The message-passing substrate failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// A peer sent a message that is invalid in the current protocol state.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The run configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// An emitted item failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("item {item:?} is invalid: {reason}")]
pub struct ValidationError {
    /// The offending item as a list of vertex ids.
    pub item: Vec<u64>,
    /// Which property it violates.
    pub reason: String,
}

/// Top-level error for a full run (load, configure, enumerate, validate).
#[derive(Debug, Error)]
pub enum Error {
    /// Graph loading failed.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Enumeration failed.
    #[error(transparent)]
    Enum(#[from] EnumError),
    /// An emitted item failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
