//! The closed error taxonomy surfaced to callers.

use crate::path::PathBuf;
use std::any::TypeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the public API.
///
/// Input errors (`ArgumentNull`, `Argument`) fail at the API
/// boundary with no side effects; logical errors (`DataNodeExistsAlready`,
/// `DataTypeMismatch`, ...) fail after any partial reservation made while
/// resolving a path has been unwound.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required argument was `None`/empty where a value was required.
    #[error("argument `{0}` must not be null")]
    ArgumentNull(&'static str),

    /// An argument failed validation (malformed path, unsupported property
    /// flag, name too long, ...).
    #[error("invalid argument `{0}`: {1}")]
    Argument(&'static str, String),

    /// A regular node already exists at the given path.
    #[error("a node already exists at `{0}`")]
    DataNodeExistsAlready(PathBuf),

    /// A regular value already exists at the given path.
    #[error("a value already exists at `{0}`")]
    DataValueExistsAlready(PathBuf),

    /// The value at the given path does not exist, or is a dummy.
    #[error("no value exists at `{0}`")]
    DataValueDoesNotExist(PathBuf),

    /// A value's fixed type does not match the requested type.
    #[error("type mismatch at `{path}`: value is `{actual:?}`, requested `{requested:?}`")]
    DataTypeMismatch {
        /// Path of the mismatched value.
        path: PathBuf,
        /// The value's actual type id.
        actual: TypeId,
        /// The type id requested by the caller.
        requested: TypeId,
    },

    /// A reference's binding is broken; no live value backs it.
    #[error("reference to `{0}` is broken")]
    DataValueReferenceBroken(PathBuf),

    /// The entity has already been disposed.
    #[error("object has been disposed")]
    ObjectDisposed,

    /// The backing file for the default instance does not exist.
    #[error("file not found: `{0}`")]
    FileNotFound(String),

    /// The injected serializer failed to read or write a subtree.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The archive version read from a byte source is not supported.
    #[error("unsupported archive version {0}")]
    VersionNotSupported(u32),

    /// An operation that requires single initialization was invoked twice.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}
