//! HTTP client for fetching tracks.
//!
//! Tracks are fetched whole into memory as [`Blob`]s. This module provides a
//! wrapper around `reqwest::Client` with consistent timeouts and headers, and
//! the [`Fetch`] trait the playback elements fetch through.
//!
//! # Status Handling
//!
//! * 2xx: the body becomes a blob, tagged with its `Content-Type`
//! * 410 Gone: [`ResourceExpired`](crate::error::ErrorKind::ResourceExpired),
//!   so the caller can retry with a fresh URL
//! * Anything else: [`NetworkFailure`](crate::error::ErrorKind::NetworkFailure)
//!
//! # Example
//!
//! ```rust,ignore
//! use crossfader::http::{Client, Fetch};
//!
//! let client = Client::new(&config)?;
//! let blob = client.fetch(&url).await?;
//! ```

use std::{future::Future, pin::Pin, time::Duration};

use futures_util::TryFutureExt;
use reqwest::{
    header::{HeaderValue, ACCEPT, CONTENT_TYPE},
    StatusCode,
};
use url::Url;

use crate::{
    blob::Blob,
    config::Config,
    error::{Error, Result},
};

/// Future returned by [`Fetch::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Blob>> + Send + 'a>>;

/// Source of track bytes.
///
/// Implemented by [`Client`] for real network access. Anything else that can
/// turn a URL into bytes, like a fixture store in tests, can stand in.
pub trait Fetch: Send + Sync {
    /// Fetches the resource at `url` completely.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExpired` if the resource is gone, and
    /// `NetworkFailure` for any other failure to retrieve it.
    fn fetch<'a>(&'a self, url: &'a Url) -> FetchFuture<'a>;
}

/// HTTP client with consistent timeouts and headers.
pub struct Client {
    inner: reqwest::Client,
}

impl Client {
    /// Duration to keep idle connections alive.
    ///
    /// Consecutive tracks usually come from the same CDN host.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the TLS backend cannot be initialized.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("audio/*, */*;q=0.5"));

        let inner = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(config.read_timeout)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { inner })
    }

    /// Fetches `url` into a blob.
    ///
    /// # Errors
    ///
    /// See [`Fetch::fetch`].
    pub async fn get(&self, url: &Url) -> Result<Blob> {
        trace!("GET {url}");
        let response = self
            .inner
            .get(url.clone())
            .send()
            .map_err(Error::from)
            .await?;

        let status = response.status();
        if status == StatusCode::GONE {
            return Err(Error::resource_expired(format!("{url} is gone")));
        }
        if !status.is_success() {
            return Err(Error::network_failure(format!("{url} returned {status}")));
        }

        // Strip parameters like `; charset=binary`.
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());

        let body = response.bytes().await?;
        debug!(
            "fetched {} bytes of {} from {url}",
            body.len(),
            mime_type.as_deref().unwrap_or("unknown type")
        );

        Ok(Blob::new(&*body, mime_type))
    }
}

impl Fetch for Client {
    fn fetch<'a>(&'a self, url: &'a Url) -> FetchFuture<'a> {
        Box::pin(self.get(url))
    }
}
