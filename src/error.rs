//! Error handling for the playback engine.
//!
//! Every failure carries an [`ErrorKind`] that tells the caller how to react,
//! and the underlying error for diagnostics.
//!
//! # Error Categories
//!
//! * Silent outcomes: [`Aborted`](ErrorKind::Aborted) (superseded or cancelled
//!   work) is never surfaced to listeners
//! * Retryable by the caller: [`ResourceExpired`](ErrorKind::ResourceExpired)
//!   (the URL is gone, fetch a fresh one)
//! * Track failures: network, decode and unsupported format errors
//! * Misuse that cannot be repaired locally: context and graph mismatches
//! * Transition failures: [`FadeFailure`](ErrorKind::FadeFailure), after which
//!   the current track keeps playing
//!
//! # Example
//!
//! ```rust
//! use crossfader::error::{Error, ErrorKind, Result};
//!
//! fn check(volume: f32) -> Result<()> {
//!     if volume.is_nan() {
//!         return Err(Error::invalid_argument("volume is not a number"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// An engine error: what kind of failure, and what caused it.
#[derive(Debug)]
pub struct Error {
    /// How the caller should react
    pub kind: ErrorKind,

    /// The cause, for logs and `downcast`
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Returns the cause if it is an `E`.
    ///
    /// # Example
    /// ```
    /// use std::io;
    /// use crossfader::error::Error;
    ///
    /// let error = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
    /// let cause = error.downcast::<io::Error>().map(io::Error::kind);
    /// assert_eq!(cause, Some(io::ErrorKind::ConnectionReset));
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether this error must stay invisible to listeners.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted | ErrorKind::ResourceExpired)
    }
}

/// Standard result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the playback engine.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Work was cancelled or superseded. Expected, never surfaced.
    #[error("operation aborted")]
    Aborted,

    /// The resource answered "gone"; the caller should refresh the URL.
    #[error("resource expired")]
    ResourceExpired,

    /// Transport failure or a non-success status other than "gone".
    #[error("network failure")]
    NetworkFailure,

    /// The bytes could not be decoded.
    #[error("decode failure")]
    DecodeFailure,

    /// The media format or codec is not supported.
    #[error("format unsupported")]
    FormatUnsupported,

    /// The audio output could not be brought up.
    #[error("audio context unavailable")]
    ContextUnavailable,

    /// The element is bound to a different context or graph.
    #[error("processing graph mismatch")]
    GraphMismatch,

    /// A transition could not be completed; the current track plays on.
    #[error("crossfade failed")]
    FadeFailure,

    #[error("invalid argument specified")]
    InvalidArgument,

    #[error("invalid state")]
    FailedPrecondition,

    #[error("operation timed out")]
    DeadlineExceeded,

    #[error("internal error")]
    Internal,

    #[error("unknown error")]
    Unknown,
}

macro_rules! constructors {
    ($($(#[$meta:meta])* $name:ident => $kind:ident),* $(,)?) => {
        impl Error {
            /// Wraps `error` as a failure of `kind`.
            pub fn new<E>(kind: ErrorKind, error: E) -> Self
            where
                E: Into<Box<dyn std::error::Error + Send + Sync>>,
            {
                Self {
                    kind,
                    error: error.into(),
                }
            }

            $(
                $(#[$meta])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

constructors! {
    /// Creates an error for cancelled or superseded work.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use crossfader::error::{Error, ErrorKind};
    /// let err = Error::aborted("load superseded");
    /// assert_eq!(err.kind, ErrorKind::Aborted);
    /// ```
    aborted => Aborted,

    /// Creates an error for a resource that answered "gone".
    resource_expired => ResourceExpired,

    /// Creates an error for transport failures and unexpected statuses.
    network_failure => NetworkFailure,

    /// Creates an error for undecodable media.
    decode_failure => DecodeFailure,

    /// Creates an error for media formats without a decoder.
    format_unsupported => FormatUnsupported,

    /// Creates an error for an audio output that cannot be brought up.
    context_unavailable => ContextUnavailable,

    /// Creates an error for an element bound elsewhere.
    graph_mismatch => GraphMismatch,

    /// Creates an error for a transition that could not complete.
    fade_failure => FadeFailure,

    /// Creates an error for invalid arguments.
    invalid_argument => InvalidArgument,

    /// Creates an error for operations that cannot run in the current state.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use crossfader::error::{Error, ErrorKind};
    /// let err = Error::failed_precondition("duration not known yet");
    /// assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    /// ```
    failed_precondition => FailedPrecondition,

    /// Creates an error for operations that exceeded their deadline.
    deadline_exceeded => DeadlineExceeded,

    /// Creates an error for unexpected internal errors.
    internal => Internal,

    /// Creates an error that fits no other category.
    unknown => Unknown,
}

/// The cause is the error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Displays as `kind: cause`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        fmt::Display::fmt(&self.error, fmt)
    }
}

/// Classifies I/O errors by their `io::ErrorKind`.
///
/// I/O in this crate is either network transport or reading from an
/// in-memory blob, so most errors are network or decode failures.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            Interrupted => Self::aborted(err),
            AddrNotAvailable | BrokenPipe | ConnectionAborted | ConnectionRefused
            | ConnectionReset | NotConnected => Self::network_failure(err),
            TimedOut => Self::deadline_exceeded(err),
            UnexpectedEof | InvalidData => Self::decode_failure(err),
            InvalidInput => Self::invalid_argument(err),
            Unsupported => Self::format_unsupported(err),
            _ => Self::unknown(err),
        }
    }
}

/// Classifies HTTP client errors.
///
/// Status errors are mapped by the caller, because a "gone" status is not an
/// error at all. Everything else the client reports is a network failure,
/// except for timeouts and malformed requests.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if err.status() == Some(reqwest::StatusCode::GONE) {
            return Self::resource_expired(err);
        }

        Self::network_failure(err)
    }
}

/// Classifies Symphonia errors.
///
/// Mapping:
/// * `Unsupported` → `FormatUnsupported`
/// * `IoError`, `DecodeError`, `LimitError` → `DecodeFailure`
/// * `SeekError` → `FailedPrecondition`
/// * `ResetRequired` → `Internal`
impl From<symphonia::core::errors::Error> for Error {
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match e {
            Unsupported(e) => Self::format_unsupported(e),
            IoError(e) => Self::decode_failure(e),
            DecodeError(e) => Self::decode_failure(e),
            LimitError(e) => Self::decode_failure(e),
            SeekError(e) => Self::failed_precondition(format!("seek error: {e:?}")),
            ResetRequired => Self::internal("reset required"),
        }
    }
}

/// Converts audio stream errors to `ContextUnavailable`.
///
/// An output stream that cannot be built leaves nothing to play on.
impl From<rodio::StreamError> for Error {
    fn from(e: rodio::StreamError) -> Self {
        Self::context_unavailable(e.to_string())
    }
}

/// Converts audio device enumeration errors to `ContextUnavailable`.
impl From<rodio::DevicesError> for Error {
    fn from(e: rodio::DevicesError) -> Self {
        Self::context_unavailable(e.to_string())
    }
}

/// Converts sink creation errors to `ContextUnavailable`.
impl From<rodio::PlayError> for Error {
    fn from(e: rodio::PlayError) -> Self {
        Self::context_unavailable(e.to_string())
    }
}

/// Classifies seek errors.
///
/// Mapping:
/// * `NotSupported` -> `FailedPrecondition`
/// * Others -> `Unknown`
impl From<rodio::source::SeekError> for Error {
    fn from(e: rodio::source::SeekError) -> Self {
        use rodio::source::SeekError::*;
        match e {
            NotSupported { underlying_source } => Self::failed_precondition(format!(
                "seeking not supported by {underlying_source}"
            )),
            _ => Self::unknown(e.to_string()),
        }
    }
}

/// An elapsed `tokio::time::timeout` is `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts configuration parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts task join errors: cancelled tasks are aborts, panics are internal.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::aborted(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// A poisoned lock is `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_kind_and_details() {
        let err = Error::graph_mismatch("element bound elsewhere");
        assert_eq!(
            err.to_string(),
            "processing graph mismatch: element bound elsewhere"
        );
    }

    #[test]
    fn silent_kinds() {
        assert!(Error::aborted("superseded").is_silent());
        assert!(Error::resource_expired("gone").is_silent());
        assert!(!Error::network_failure("503").is_silent());
    }

    #[test]
    fn unsupported_media_maps_to_format_unsupported() {
        let err = Error::from(symphonia::core::errors::Error::Unsupported("codec"));
        assert_eq!(err.kind, ErrorKind::FormatUnsupported);
    }
}
