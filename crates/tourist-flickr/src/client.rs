//! Flickr REST client using reqwest

use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::FlickrConfig;
use crate::error::{ClientError, FetchError, SearchError};
use crate::source::{PhotoRecord, PhotoSource};

const SEARCH_METHOD: &str = "flickr.photos.search";
const JSONP_PREFIX: &str = "jsonFlickrApi(";

pub struct FlickrClient {
    client: Client,
    config: FlickrConfig,
}

impl FlickrClient {
    pub fn new(config: FlickrConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tourist-flickr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Build(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FlickrConfig {
        &self.config
    }

    /// Build the `flickr.photos.search` URL for a coordinate.
    pub fn search_url(&self, latitude: &str, longitude: &str, page: Option<u32>) -> Result<Url, SearchError> {
        let per_page = self.config.per_page.to_string();
        let page = page.map(|page| page.to_string());
        let mut params = vec![
            ("method", SEARCH_METHOD),
            ("api_key", self.config.api_key.as_str()),
            ("lat", latitude),
            ("lon", longitude),
            ("per_page", per_page.as_str()),
            ("extras", self.config.extras.as_str()),
            ("format", "json"),
        ];
        if let Some(page) = page.as_deref() {
            params.push(("page", page));
        }

        Url::parse_with_params(&self.config.endpoint, &params)
            .map_err(|e| SearchError::NoData(format!("invalid search URL: {e}")))
    }
}

impl PhotoSource for FlickrClient {
    async fn search(
        &self,
        latitude: &str,
        longitude: &str,
        page: Option<u32>,
    ) -> Result<Vec<PhotoRecord>, SearchError> {
        let url = self.search_url(latitude, longitude, page)?;
        debug!(latitude, longitude, ?page, "photo search");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SearchError::NoData(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::NoData(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SearchError::NoData(e.to_string()))?;

        let records = parse_search_response(&body, &self.config.extras)?;
        info!(count = records.len(), ?page, "photo search returned");
        Ok(records)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FetchError::Empty);
        }
        debug!(url, size = bytes.len(), "image downloaded");
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    stat: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    photos: Option<PhotoPage>,
}

#[derive(Debug, Deserialize)]
struct PhotoPage {
    #[serde(default)]
    photo: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Remove the `jsonFlickrApi(...)` callback wrapper, if present.
pub fn strip_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    trimmed
        .strip_prefix(JSONP_PREFIX)
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(trimmed)
}

/// Parse a search response body into photo records.
///
/// Entries without the `extras` URL field are skipped. A successful search
/// with nothing usable is [`SearchError::NoPhotosAvailable`].
pub fn parse_search_response(body: &str, extras: &str) -> Result<Vec<PhotoRecord>, SearchError> {
    let response: SearchResponse = serde_json::from_str(strip_jsonp(body))
        .map_err(|e| SearchError::MalformedPhotoList(e.to_string()))?;

    if response.stat != "ok" {
        return Err(SearchError::NoData(
            response.message.unwrap_or(response.stat),
        ));
    }

    let page = response
        .photos
        .ok_or_else(|| SearchError::MalformedPhotoList("missing photos".to_string()))?;

    let mut records = Vec::with_capacity(page.photo.len());
    for entry in page.photo {
        let Some(url) = entry.get(extras).and_then(|url| url.as_str()) else {
            continue;
        };
        let id = match entry.get("id") {
            Some(serde_json::Value::String(id)) => id.parse::<i64>().ok(),
            Some(serde_json::Value::Number(id)) => id.as_i64(),
            _ => None,
        }
        .ok_or_else(|| SearchError::MalformedPhotoList(format!("bad photo id in {entry:?}")))?;

        records.push(PhotoRecord {
            id,
            url: url.to_string(),
        });
    }

    if records.is_empty() {
        return Err(SearchError::NoPhotosAvailable);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_BODY: &str = r#"jsonFlickrApi({"photos":{"page":1,"pages":4,"perpage":24,"total":"90","photo":[
        {"id":"29384756102","owner":"1@N00","title":"Lake","url_z":"https://farm9.staticflickr.com/1/29384756102_z.jpg"},
        {"id":"29384756103","owner":"1@N00","title":"No size"},
        {"id":"29384756104","owner":"2@N00","title":"Fountain","url_z":"https://farm9.staticflickr.com/1/29384756104_z.jpg"}
    ]},"stat":"ok"})"#;

    #[test]
    fn test_strip_jsonp() {
        assert_eq!(strip_jsonp("jsonFlickrApi({\"a\":1})"), "{\"a\":1}");
        assert_eq!(strip_jsonp("  {\"a\":1}\n"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_skips_entries_without_url() {
        let records = parse_search_response(OK_BODY, "url_z").unwrap();
        assert_eq!(
            records,
            vec![
                PhotoRecord {
                    id: 29384756102,
                    url: "https://farm9.staticflickr.com/1/29384756102_z.jpg".into()
                },
                PhotoRecord {
                    id: 29384756104,
                    url: "https://farm9.staticflickr.com/1/29384756104_z.jpg".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_failure_stat() {
        let body = r#"jsonFlickrApi({"stat":"fail","code":100,"message":"Invalid API Key (Key has invalid format)"})"#;
        assert_eq!(
            parse_search_response(body, "url_z"),
            Err(SearchError::NoData("Invalid API Key (Key has invalid format)".into()))
        );
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        let empty = r#"{"photos":{"page":1,"pages":0,"photo":[]},"stat":"ok"}"#;
        assert_eq!(
            parse_search_response(empty, "url_z"),
            Err(SearchError::NoPhotosAvailable)
        );

        assert!(matches!(
            parse_search_response("<html>", "url_z"),
            Err(SearchError::MalformedPhotoList(_))
        ));

        let bad_id = r#"{"photos":{"photo":[{"id":"x1","url_z":"https://a/b.jpg"}]},"stat":"ok"}"#;
        assert!(matches!(
            parse_search_response(bad_id, "url_z"),
            Err(SearchError::MalformedPhotoList(_))
        ));
    }

    #[tokio::test]
    async fn test_search_url_parameters() {
        let client = FlickrClient::new(FlickrConfig::with_api_key("key123")).unwrap();
        let url = client.search_url("28.497529", "-81.368113", Some(3)).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.host_str(), Some("api.flickr.com"));
        assert!(pairs.contains(&("method".into(), "flickr.photos.search".into())));
        assert!(pairs.contains(&("api_key".into(), "key123".into())));
        assert!(pairs.contains(&("lat".into(), "28.497529".into())));
        assert!(pairs.contains(&("lon".into(), "-81.368113".into())));
        assert!(pairs.contains(&("per_page".into(), "24".into())));
        assert!(pairs.contains(&("extras".into(), "url_z".into())));
        assert!(pairs.contains(&("format".into(), "json".into())));
        assert!(pairs.contains(&("page".into(), "3".into())));

        let first = client.search_url("0", "0", None).unwrap();
        assert!(first.query_pairs().all(|(k, _)| k != "page"));
    }

    #[test]
    fn test_new_rejects_missing_key() {
        assert!(matches!(
            FlickrClient::new(FlickrConfig::default()),
            Err(ClientError::Config(_))
        ));
    }
}
