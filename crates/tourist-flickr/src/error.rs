//! Error types for tourist-flickr

use thiserror::Error;
use tourist_core::{ContextError, LaneError, StackError};

/// A photo search that produced no usable photo list
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The request failed or the API reported a failure
    #[error("Search returned no data: {0}")]
    NoData(String),

    /// The search succeeded but found nothing with an image URL
    #[error("No photos available at this location")]
    NoPhotosAvailable,

    /// The response body is not the expected photo list
    #[error("Malformed photo list: {0}")]
    MalformedPhotoList(String),
}

/// An image download that produced no bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Image request failed: {0}")]
    Transport(String),

    #[error("Image request returned HTTP {0}")]
    Status(u16),

    #[error("Image response was empty")]
    Empty,
}

/// The client could not be constructed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP client could not be built: {0}")]
    Build(String),
}

/// Failures of the album workflows
#[derive(Error, Debug)]
pub enum AlbumError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Lane(#[from] LaneError),

    /// The stack shut down before the unit reached the store
    #[error("Batch was dropped before it completed")]
    Cancelled,
}
