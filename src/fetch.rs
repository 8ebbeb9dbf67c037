// src/fetch.rs

//! Resolving URLs to archive bytes
//!
//! Supports plain filesystem paths, `file://` URLs and `http(s)://` URLs.
//! HTTP requests use a blocking client with a timeout and bounded retries.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{BufReader, Read};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Opens a readable stream for a URL
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// Fetcher for local paths, `file://` and `http(s)://` URLs
pub struct UrlFetcher {
    client: Client,
    max_retries: u32,
}

impl UrlFetcher {
    /// Create a new fetcher
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    fn fetch_local(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        debug!("Opening local archive {}", path);
        let file = File::open(path)
            .map_err(|e| Error::DownloadError(format!("Failed to open {}: {}", path, e)))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn fetch_http(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        debug!("Downloading archive from {}", url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }
                    return Ok(Box::new(response));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

impl ResourceFetcher for UrlFetcher {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        if let Some(path) = url.strip_prefix("file://") {
            self.fetch_local(path)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url)
        } else if let Some((scheme, _)) = url.split_once("://") {
            Err(Error::DownloadError(format!(
                "Unsupported URL scheme '{}' in {}",
                scheme, url
            )))
        } else {
            self.fetch_local(url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fetch_local_path_and_file_url() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"payload").unwrap();
        let path = temp.path().to_str().unwrap().to_string();

        let fetcher = UrlFetcher::new().unwrap();

        let mut content = Vec::new();
        fetcher.fetch(&path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"payload");

        let mut content = Vec::new();
        fetcher
            .fetch(&format!("file://{}", path))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"payload");
    }

    #[test]
    fn test_fetch_missing_file_is_download_error() {
        let fetcher = UrlFetcher::new().unwrap();
        let result = fetcher.fetch("/nonexistent/module.tar");
        assert!(matches!(result, Err(Error::DownloadError(_))));
    }

    #[test]
    fn test_unsupported_scheme() {
        let fetcher = UrlFetcher::new().unwrap();
        let result = fetcher.fetch("ftp://example.com/module.tar");
        assert!(matches!(result, Err(Error::DownloadError(msg)) if msg.contains("ftp")));
    }
}
