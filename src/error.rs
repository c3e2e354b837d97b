//! Standard error type for ocl-prims.

use ocl::core::Status;
use ocl::error::Error as OclError;

pub type Result<T> = std::result::Result<T, Error>;

/// The one error type everything in this crate returns.
///
/// Implements the usual error traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller violated a documented precondition. Raised eagerly,
    /// before any work is enqueued.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A program build, tuning run or internal invariant failed in a way
    /// that is not attributable to the caller. Carries diagnostic text
    /// (including the device build log where applicable).
    #[error("{0}")]
    Internal(String),
    /// The parameter cache is unreachable or corrupt, or a required entry
    /// is missing while tuning is disabled.
    #[error("cache error: {0}")]
    Cache(String),
    /// No candidate parameter set survived tuning.
    #[error("tuning failed: {0}")]
    Tune(String),
    /// An error propagated unchanged from the OpenCL runtime.
    #[error("{0}")]
    Ocl(#[from] OclError),
}

impl Error {
    pub(crate) fn invalid_arg<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }

    /// Returns the raw OpenCL status code for `Ocl` variants.
    pub fn api_status(&self) -> Option<Status> {
        match *self {
            Error::Ocl(ref err) => err.api_status(),
            _ => None,
        }
    }
}

impl From<ocl::core::Error> for Error {
    fn from(err: ocl::core::Error) -> Error {
        Error::Ocl(err.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Error {
        Error::Cache(err.to_string())
    }
}
