//! Error types for the readout data-handling pipeline.
//!
//! Only conditions that must abort a lifecycle transition (`conf`, `start`,
//! `record`) surface as [`ReadoutError`]. Everything the pipeline is required
//! to survive (full downstream queues, late packets, empty-buffer requests,
//! failed recording writes) is reported through `tracing` warnings plus a
//! counter on the owning component, so the data path never stalls on an
//! error return.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SourceId;

/// Result type alias for readout operations.
pub type Result<T> = std::result::Result<T, ReadoutError>;

/// Errors that can abort a lifecycle transition.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Invalid configuration detected during `conf` (bad percentages,
    /// missing connection, allocation failure). Fatal for the transition.
    #[error("SourceID[{sourceid}] configuration error: {message}")]
    Configuration { sourceid: SourceId, message: String },

    /// Initialization failed (wrong module wiring, no implementation for the
    /// raw type). Fatal during `init`.
    #[error("initialization error: {message}")]
    Initialization { message: String },

    /// A command arrived in a state that cannot accept it (`record` while
    /// recording, `start` before `conf`). The command is a no-op.
    #[error("SourceID[{sourceid}] command error: {message}")]
    Command { sourceid: SourceId, message: String },

    /// A binary input file could not be opened.
    #[error("couldn't open binary file: {path}")]
    CannotOpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A binary input file could not be read.
    #[error("couldn't read binary file: {path}")]
    CannotReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A recording output file could not be written.
    #[error("could not write to file: {path}")]
    CannotWriteToFile { path: PathBuf },

    /// The emulator's source buffer holds no complete element.
    #[error("SourceID[{sourceid}] source buffer is empty, check file: {path}")]
    EmptySourceBuffer { sourceid: SourceId, path: PathBuf },

    /// Underlying I/O failure outside the classified file errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadoutError {
    /// Shorthand for a [`ReadoutError::Configuration`].
    pub fn configuration(sourceid: SourceId, message: impl Into<String>) -> Self {
        Self::Configuration {
            sourceid,
            message: message.into(),
        }
    }

    /// Shorthand for a [`ReadoutError::Command`].
    pub fn command(sourceid: SourceId, message: impl Into<String>) -> Self {
        Self::Command {
            sourceid,
            message: message.into(),
        }
    }

    /// Whether this error class is fatal when raised during `conf`.
    pub fn is_fatal_during_conf(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Initialization { .. }
                | Self::CannotOpenFile { .. }
                | Self::CannotReadFile { .. }
        )
    }
}
