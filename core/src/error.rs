use std::{io, path::PathBuf};

use thiserror::Error;

pub type RtResult<T> = std::result::Result<T, RtError>;

#[derive(Error, Debug)]
pub enum RtError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("spaces up to 2^{max} strings are supported, but the requested space needs 2^{requested}")]
    Space { requested: u32, max: u32 },

    #[error("cannot {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed parameter file {path}: {reason}")]
    Params { path: PathBuf, reason: String },

    #[error("table file {path} is corrupt: length {len} is not a multiple of 16")]
    TableSize { path: PathBuf, len: u64 },

    #[error("tables disagree on the alphabet or the space size; all tables of a set must share them")]
    TableMismatch,

    #[cfg(feature = "opencl")]
    #[error("OpenCL backend error: {0}")]
    Backend(String),

    #[error("device endpoint {device} disagrees with host recomputation {host} (walked from {from})")]
    Verification { from: u64, device: u64, host: u64 },

    #[error("device lookup result {device:#x} disagrees with host lookup {host:#x} for query {query}")]
    LookupVerification { query: usize, device: u64, host: u64 },
}

#[cfg(feature = "opencl")]
impl From<ocl::Error> for RtError {
    // The rendered diagnostic includes the program build log on compile
    // failures, which is the part worth surfacing.
    fn from(err: ocl::Error) -> Self {
        RtError::Backend(err.to_string())
    }
}

impl RtError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        RtError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
