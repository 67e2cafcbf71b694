//! Tourist Flickr - photo search for pins
//!
//! - **Source**: the `PhotoSource` trait, searching near a coordinate and
//!   downloading image bytes
//! - **Client**: `FlickrClient`, the `flickr.photos.search` implementation
//! - **Album**: populate, refresh and prune a pin's photos through the
//!   tourist-core batch scheduler
//!
//! Network failures are returned to the caller and never reach the stack.

pub mod album;
pub mod client;
pub mod config;
pub mod error;
pub mod source;

pub use album::{Album, PopulateReport};
pub use client::FlickrClient;
pub use config::FlickrConfig;
pub use error::{AlbumError, ClientError, FetchError, SearchError};
pub use source::{PhotoRecord, PhotoSource};
