//! Photo source abstraction.

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, SearchError};

/// One search hit: the provider's photo id and the URL of its image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: i64,
    pub url: String,
}

/// Remote service that finds photos near a coordinate and serves their bytes.
///
/// Coordinates are passed as the strings the service expects. `page` selects
/// a page of results; `None` means the first.
#[allow(async_fn_in_trait)]
pub trait PhotoSource {
    async fn search(
        &self,
        latitude: &str,
        longitude: &str,
        page: Option<u32>,
    ) -> Result<Vec<PhotoRecord>, SearchError>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}
