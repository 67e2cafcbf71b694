//! Flickr client configuration

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub const DEFAULT_ENDPOINT: &str = "https://api.flickr.com/services/rest/";

/// Photos requested per search page
pub const DEFAULT_PER_PAGE: u32 = 24;

/// Size suffix of the image URL requested through `extras`
pub const DEFAULT_EXTRAS: &str = "url_z";

/// Flickr API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlickrConfig {
    pub api_key: String,
    pub endpoint: String,
    pub per_page: u32,
    pub extras: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for FlickrConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            per_page: DEFAULT_PER_PAGE,
            extras: DEFAULT_EXTRAS.to_string(),
            timeout_secs: 30,
        }
    }
}

impl FlickrConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.trim().is_empty() {
            return Err(ClientError::Config("api_key is empty".to_string()));
        }
        if reqwest::Url::parse(&self.endpoint).is_err() {
            return Err(ClientError::Config(format!("invalid endpoint: {}", self.endpoint)));
        }
        // The API caps per_page at 500
        if self.per_page == 0 || self.per_page > 500 {
            return Err(ClientError::Config(format!("per_page out of range: {}", self.per_page)));
        }
        if self.timeout_secs == 0 {
            return Err(ClientError::Config("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}
