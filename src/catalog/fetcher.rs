//! EK-020: Catalog fetcher: download the remote community index.
//!
//! Stale is better than missing: a failed download never touches the
//! existing local copy. The new copy replaces the old one atomically.

use crate::core::error::{EngineError, Result};
use crate::core::state::write_atomic;
use std::path::Path;
use std::time::Duration;

/// Retrieves raw index bytes from a URL.
pub trait IndexFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("envkiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Fetch {
                url: String::new(),
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

impl IndexFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let fetch_err = |reason: String| EngineError::Fetch {
            url: url.to_string(),
            reason,
        };
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP status {}", resp.status())));
        }
        let bytes = resp.bytes().map_err(|e| fetch_err(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Download `url` into `dest`, replacing it atomically.
///
/// Returns the number of bytes written. On any failure `dest` is left as
/// it was.
pub fn refresh_index(fetcher: &dyn IndexFetcher, url: &str, dest: &Path) -> Result<usize> {
    let bytes = fetcher.fetch(url)?;
    if bytes.is_empty() {
        return Err(EngineError::Fetch {
            url: url.to_string(),
            reason: "empty response".to_string(),
        });
    }
    write_atomic(dest, &bytes)?;
    tracing::info!(url, dest = %dest.display(), bytes = bytes.len(), "catalog index refreshed");
    Ok(bytes.len())
}
