// gpu/error.rs — Error type for the device resource layer.
//
// Every backend failure is translated into one of these variants and
// returned from the call that caused it. Shape violations (`DimensionMismatch`,
// `IndivisibleRange`) are detected on the host before any wgpu call.

use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::ndrange::NdRange;

/// Result alias used throughout `gpu`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the device controller and the objects it owns.
#[derive(Debug, Error)]
pub enum Error {
    /// No GPU-class or CPU-class adapter could be opened.
    #[error("no compatible compute device found: {0}")]
    DeviceUnavailable(String),

    /// The device capability query produced an unusable value.
    #[error("could not read device info: {0}")]
    Query(String),

    #[error("could not allocate memory buffer: {0}")]
    Allocation(String),

    #[error("memory buffer transfer failed: {0}")]
    Transfer(String),

    /// Compilation failed. `log` holds the (bounded) diagnostic text.
    #[error("{log}")]
    Compile { log: String },

    /// `create_kernel` on a program with no compiled code.
    #[error("program has not been compiled")]
    NotCompiled,

    /// No entry point with this name in the compiled program.
    #[error("could not create kernel `{name}`: no such kernel ({reason})")]
    Symbol { name: String, reason: String },

    #[error("could not set kernel argument {index}: {reason}")]
    Argument { index: u32, reason: String },

    #[error("global range has {global} dimension(s) but local range has {local}")]
    DimensionMismatch { global: usize, local: usize },

    #[error("global range {global} is not divisible by local range {local}")]
    IndivisibleRange { global: NdRange, local: NdRange },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The handle outlived its owner (controller dropped, program recompiled).
    #[error("{0} has been released")]
    Released(&'static str),

    /// The handle was issued by a different device controller.
    #[error("{0} belongs to a different device controller")]
    ForeignHandle(&'static str),

    #[error("unable to read source file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classified dispatch failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid kernel arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid work dimension: {0}")]
    InvalidWorkDimension(String),

    #[error("invalid work group size: {0}")]
    InvalidWorkGroupSize(String),

    #[error("invalid local work group size: {0}")]
    InvalidWorkItemSize(String),

    #[error("could not execute kernel: {0}")]
    Generic(String),
}

/// Largest diagnostic carried by [`Error::Compile`], prefix included.
pub const BUILD_LOG_LIMIT: usize = 2048;

const BUILD_LOG_PREFIX: &str = "Error while compiling program:\n";

/// Prefix and truncate a backend diagnostic to [`BUILD_LOG_LIMIT`] bytes,
/// cutting on a char boundary.
pub(crate) fn bounded_build_log(diagnostic: &str) -> String {
    let mut log = String::with_capacity(BUILD_LOG_LIMIT);
    log.push_str(BUILD_LOG_PREFIX);
    let room = BUILD_LOG_LIMIT - BUILD_LOG_PREFIX.len();
    let mut end = diagnostic.len().min(room);
    while !diagnostic.is_char_boundary(end) {
        end -= 1;
    }
    log.push_str(&diagnostic[..end]);
    log
}
