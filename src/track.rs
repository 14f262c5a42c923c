//! Track descriptors supplied by the caller.
//!
//! The engine only needs a URL to stream from; the rest is carried along for
//! logging and for the caller's own bookkeeping.

use std::{fmt, time::Duration};

use url::Url;

use crate::error::{Error, Result};

/// A track to be played.
///
/// Immutable once handed to the engine: a refreshed URL means a new `Track`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Track {
    id: String,
    stream_url: Url,
    duration: Option<Duration>,
    title: String,
    artist: String,
}

impl Track {
    /// Creates a track descriptor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `stream_url` does not parse or is not an
    /// HTTP(S) URL.
    pub fn new(id: impl Into<String>, stream_url: &str) -> Result<Self> {
        let stream_url = Url::parse(stream_url)?;
        if !is_network_url(&stream_url) {
            return Err(Error::invalid_argument(format!(
                "{stream_url} is not a network url"
            )));
        }

        Ok(Self {
            id: id.into(),
            stream_url,
            duration: None,
            title: String::new(),
            artist: String::new(),
        })
    }

    /// Sets the duration hint, used before the decoder knows better.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn artist(&self) -> &str {
        &self.artist
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.artist.is_empty(), self.title.is_empty()) {
            (false, false) => write!(f, "{}: {} - {}", self.id, self.artist, self.title),
            (true, false) => write!(f, "{}: {}", self.id, self.title),
            _ => write!(f, "{}", self.id),
        }
    }
}

/// Whether `url` can be fetched over the network.
#[must_use]
pub fn is_network_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.has_host()
}

/// Parses `url` if it is a network URL.
#[must_use]
pub fn parse_network_url(url: &str) -> Option<Url> {
    Url::parse(url).ok().filter(is_network_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_urls_are_accepted() {
        assert!(parse_network_url("https://cdn.example.com/a.mp3").is_some());
        assert!(parse_network_url("http://127.0.0.1:8080/a.flac").is_some());
        assert!(parse_network_url("file:///tmp/a.mp3").is_none());
        assert!(parse_network_url("data:audio/wav;base64,UklGRg==").is_none());
        assert!(parse_network_url("not a url").is_none());
    }

    #[test]
    fn display_includes_metadata() {
        let track = Track::new("42", "https://cdn.example.com/42.mp3")
            .unwrap()
            .with_artist("Artist")
            .with_title("Title");
        assert_eq!(track.to_string(), "42: Artist - Title");
        assert!(Track::new("1", "ftp://example.com/a.mp3").is_err());
    }
}
