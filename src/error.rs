//! Crate-wide error type.
//!
//! Graph construction mistakes (mismatched shapes, impossible operator
//! arguments) are not represented here: they panic at the builder call that
//! introduced them, before any command is encoded. What remains are the
//! failures a correct program can still run into at runtime: allocation
//! failures, commands that fail while executing, and snapshot I/O.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by buffer allocation, command execution and checkpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// A value or gradient buffer could not be reserved.
    #[error("failed to allocate a buffer of {len} floats")]
    Allocation {
        /// Requested element count.
        len: usize,
    },

    /// The command queue worker is no longer accepting submissions.
    #[error("command queue is closed")]
    QueueClosed,

    /// A command failed or panicked while executing.
    #[error("command submission failed: {0}")]
    Submission(String),

    /// A pipeline was invoked again while one of its invocations was still encoding.
    #[error("pipeline is already running")]
    PipelineBusy,

    /// Accelerator initialisation or dispatch failed.
    #[error("gpu failure: {0}")]
    Gpu(String),

    /// Reading or writing a snapshot failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A snapshot file is malformed.
    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),

    /// A snapshot does not contain a parameter that was asked for.
    #[error("checkpoint has no parameter named `{0}`")]
    MissingParameter(String),

    /// Only named parameters can be written to a snapshot.
    #[error("cannot snapshot an unnamed tensor")]
    UnnamedParameter,

    /// A snapshot entry has a different shape than the parameter it is loaded into.
    #[error("parameter `{name}` has shape {expected} but the checkpoint stores {found}")]
    ParameterShape {
        /// Parameter name.
        name: String,
        /// Shape of the live parameter.
        expected: crate::shape::Shape,
        /// Shape recorded in the snapshot.
        found: crate::shape::Shape,
    },
}
