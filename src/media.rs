use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::{Client, redirect};
use tracing::{debug, warn};
use url::Url;

use crate::error::{BridgeError, DownloadFailure};

pub const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 50 * 1024 * 1024;
const MAX_REDIRECTS: usize = 10;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A `<server-name>/<media-id>` pair, optionally written with an `mxc://` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaReference {
    pub server_name: String,
    pub media_id: String,
}

impl MediaReference {
    pub fn parse(reference: &str) -> Result<Self, BridgeError> {
        let invalid = || BridgeError::InvalidMediaReference(reference.to_string());
        let path = reference.strip_prefix("mxc://").unwrap_or(reference);

        let (server_name, media_id) = path.split_once('/').ok_or_else(invalid)?;
        let server_ok = !server_name.is_empty()
            && server_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
        let media_ok = !media_id.is_empty()
            && media_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));

        if !server_ok || !media_ok {
            return Err(invalid());
        }

        Ok(Self {
            server_name: server_name.to_string(),
            media_id: media_id.to_string(),
        })
    }

    pub fn to_mxc(&self) -> String {
        format!("mxc://{}/{}", self.server_name, self.media_id)
    }
}

impl FromStr for MediaReference {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MediaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_name, self.media_id)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl DownloadedMedia {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct MediaResolver {
    client: Client,
    origin: Url,
    max_download_bytes: usize,
}

impl MediaResolver {
    pub fn new(
        origin: &str,
        max_download_bytes: usize,
        download_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let origin = Url::parse(origin)
            .map_err(|e| BridgeError::Configuration(format!("invalid media origin {origin}: {e}")))?;
        if origin.cannot_be_a_base() {
            return Err(BridgeError::Configuration(format!(
                "media origin {origin} cannot carry a path"
            )));
        }

        let client = Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(download_timeout)
            .build()
            .map_err(|e| BridgeError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            origin,
            max_download_bytes,
        })
    }

    pub fn max_download_bytes(&self) -> usize {
        self.max_download_bytes
    }

    /// Fetchable URL for a media reference. Pure string work, no network.
    pub fn resolve_media_reference(&self, reference: &str) -> Result<String, BridgeError> {
        let media = MediaReference::parse(reference)?;
        self.media_url(&["download", &media.server_name, &media.media_id])
            .map(String::from)
    }

    pub fn resolve_thumbnail_reference(
        &self,
        reference: &str,
        width: u32,
        height: u32,
    ) -> Result<String, BridgeError> {
        let media = MediaReference::parse(reference)?;
        let mut url = self.media_url(&["thumbnail", &media.server_name, &media.media_id])?;
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("method", "scale");
        Ok(url.into())
    }

    /// Fetches the whole body into memory, or fails without returning any of it.
    pub async fn download_to_buffer(&self, url: &str) -> Result<DownloadedMedia, BridgeError> {
        debug!("downloading media from {}", url);
        let failed = |failure: DownloadFailure| {
            warn!("media download from {} failed: {}", url, failure);
            BridgeError::DownloadFailed(failure)
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(DownloadFailure::Transport(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(DownloadFailure::Status(status.as_u16())));
        }

        let limit = self.max_download_bytes;
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(failed(DownloadFailure::TooLarge { limit }));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let mut data = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| failed(DownloadFailure::Transport(e.to_string())))?
        {
            if data.len() + chunk.len() > limit {
                return Err(failed(DownloadFailure::TooLarge { limit }));
            }
            data.extend_from_slice(&chunk);
        }

        debug!("downloaded {} bytes from {}", data.len(), url);
        Ok(DownloadedMedia { data, content_type })
    }

    pub async fn download_media_reference(
        &self,
        reference: &str,
    ) -> Result<DownloadedMedia, BridgeError> {
        let url = self.resolve_media_reference(reference)?;
        self.download_to_buffer(&url).await
    }

    fn media_url(&self, tail: &[&str]) -> Result<Url, BridgeError> {
        let mut url = self.origin.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BridgeError::Configuration(format!("media origin {} cannot carry a path", self.origin))
            })?
            .pop_if_empty()
            .extend(["_matrix", "media", "v3"])
            .extend(tail);
        Ok(url)
    }
}
