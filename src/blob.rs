//! Provides the `Blob` abstraction: a fetched track held in memory.
//!
//! A blob is what an element plays from. It is cheap to clone, so the same
//! bytes can sit in the preload slot and back an element at the same time.
//! Replacing an element's blob releases the previous one as soon as the last
//! clone is dropped.
//!
//! # Examples
//!
//! ```no_run
//! use crossfader::blob::Blob;
//! use std::io::Read;
//!
//! # fn example(bytes: Vec<u8>) -> std::io::Result<()> {
//! let blob = Blob::new(bytes, Some("audio/flac".to_string()));
//! let mut reader = blob.reader();
//! let mut buf = vec![0; 1024];
//! let n = reader.read(&mut buf)?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    io::{Cursor, Read, Seek},
    sync::Arc,
};

use symphonia::core::io::MediaSource;

/// An immutable, shareable buffer of encoded audio.
#[derive(Clone)]
pub struct Blob {
    data: Arc<[u8]>,

    /// `Content-Type` reported by the server, if any
    mime_type: Option<String>,
}

impl Blob {
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, mime_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            mime_type,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Opens a reader positioned at the start of the blob.
    #[must_use]
    pub fn reader(&self) -> BlobReader {
        BlobReader {
            inner: Cursor::new(Arc::clone(&self.data)),
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.data.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Reading cursor over a [`Blob`].
pub struct BlobReader {
    inner: Cursor<Arc<[u8]>>,
}

impl Read for BlobReader {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for BlobReader {
    #[inline]
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Implements the `MediaSource` trait required by Symphonia.
///
/// A blob is fully downloaded, so it is always seekable and its length known.
impl MediaSource for BlobReader {
    #[inline]
    fn is_seekable(&self) -> bool {
        true
    }

    #[inline]
    fn byte_len(&self) -> Option<u64> {
        u64::try_from(self.inner.get_ref().len()).ok()
    }
}
