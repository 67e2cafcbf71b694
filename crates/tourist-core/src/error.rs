//! Error types for tourist-core

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::entity::ObjectId;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the persistence stack.
///
/// The `Model*`, `DataDirectory` and `StoreOpen` variants are startup faults:
/// `Stack::open` returns them before any lane is started.
#[derive(Error, Debug)]
pub enum StackError {
    /// The model resource does not exist
    #[error("Model resource not found: {0}")]
    ModelNotFound(PathBuf),

    /// The model resource could not be read or parsed
    #[error("Model could not be parsed: {0}")]
    ModelParse(String),

    /// The model parsed but does not describe the entities the engine maps
    #[error("Model is invalid: {0}")]
    ModelInvalid(String),

    /// No writable directory is available for the store file
    #[error("No writable data directory: {0}")]
    DataDirectory(String),

    /// The store file could not be opened or attached
    #[error("Unable to open store at {path}: {message}")]
    StoreOpen { path: PathBuf, message: String },

    /// A read or commit against the store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A lane could not accept or complete a job
    #[error("Lane error: {0}")]
    Lane(#[from] LaneError),

    /// Configuration did not validate
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised when posting work to a lane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneError {
    /// The lane thread has stopped
    #[error("lane '{0}' is closed")]
    Closed(String),

    /// A lane tried to wait on a job queued behind itself
    #[error("lane '{0}' cannot wait on its own queue")]
    Reentrant(String),

    /// The lane thread could not be started
    #[error("unable to start lane '{name}': {message}")]
    Spawn { name: String, message: String },
}

/// Recoverable errors from mutating or reading a context.
///
/// These never leave a context in an inconsistent state: the offending
/// mutation is rejected before anything is recorded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    /// No object with this id exists in the context
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The id refers to an object of another entity type
    #[error("Object {id} is not a {expected}")]
    WrongEntity { id: ObjectId, expected: &'static str },

    /// Coordinates are not finite or out of range
    #[error("Invalid coordinate: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    /// Photos must carry a URL
    #[error("Photo {0} has no URL")]
    MissingUrl(i64),

    /// The image payload of a photo is written once
    #[error("Photo {0} already has an image")]
    ImageAlreadySet(ObjectId),
}

impl From<rusqlite::Error> for StackError {
    fn from(err: rusqlite::Error) -> Self {
        StackError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for StackError {
    fn from(err: std::io::Error) -> Self {
        StackError::Storage(err.to_string())
    }
}
