//! Playback elements: one decodable track at a time.
//!
//! An element owns the blob it plays from and exposes the usual transport
//! primitives. Its audio leaves through a *tap*: an endless rodio [`Source`]
//! in the output format that plays the current track, or silence while
//! paused. The tap can be taken exactly once. Whoever takes it, normally a
//! source binding in the [`Registry`](crate::registry::Registry), owns the
//! element's audio for the rest of its life.
//!
//! # Position
//!
//! Time advances as the tap is pulled, so the position is exactly what was
//! handed to the output and not a wall clock estimate.
//!
//! # Events
//!
//! Events go to at most one listener. [`poll`](PlaybackElement::poll) reports
//! the position and the end of the track; the transport and load operations
//! report their own state changes.

use std::{
    ffi::OsStr,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rodio::{source::UniformSourceIterator, Source};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    blob::Blob,
    config::Config,
    decoder::Decoder,
    error::{Error, ErrorKind, Result},
    events::{self, Event},
    http::Fetch,
    util::AtomicF32,
};

/// Frames rendered per refill of the tap.
const CHUNK_FRAMES: usize = 512;

/// Outcome of [`PlaybackElement::load`].
#[derive(Debug)]
pub enum LoadResult {
    /// The track is assigned, paused at the start.
    Loaded,

    /// Nothing was done, for example because the track is already loaded.
    Skipped,

    /// The server reported the resource gone. Retry with a fresh URL.
    Expired,

    /// Superseded or cancelled.
    Aborted,

    /// The track could not be fetched or decoded.
    Failed(Error),
}

impl LoadResult {
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }

    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => write!(f, "loaded"),
            Self::Skipped => write!(f, "skipped"),
            Self::Expired => write!(f, "expired"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

type Converted = UniformSourceIterator<Decoder, f32>;

/// The current track of an element.
#[derive(Default)]
struct Media {
    source: Option<Converted>,

    /// Kept to rebuild the decoder when it cannot rewind.
    blob: Option<Blob>,

    src: Option<Url>,
    duration: Option<Duration>,
}

struct Shared {
    id: String,
    sample_rate: u32,
    channels: u16,

    media: Mutex<Media>,

    paused: AtomicBool,
    ended: AtomicBool,
    /// Set when the end is reached, cleared when `Ended` is emitted.
    ended_pending: AtomicBool,
    /// Frames played since the start of the track.
    frames: AtomicU64,

    volume: AtomicF32,
    muted: AtomicBool,

    /// Whether the audio output was handed out.
    tapped: AtomicBool,
    listener: Mutex<Option<UnboundedSender<Event>>>,
}

impl Shared {
    fn media(&self) -> MutexGuard<'_, Media> {
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        events::emit(listener.as_ref(), event);
    }

    fn position(&self) -> Duration {
        #[expect(clippy::cast_precision_loss)]
        let frames = self.frames.load(Ordering::Relaxed) as f64;
        Duration::from_secs_f64(frames / f64::from(self.sample_rate))
    }
}

/// A playback element.
///
/// Cloning yields another handle to the same element.
#[derive(Clone)]
pub struct PlaybackElement {
    shared: Arc<Shared>,
    fetch: Arc<dyn Fetch>,
}

impl PlaybackElement {
    /// Creates an element that fetches through `fetch` and renders in the
    /// output format of `config`.
    ///
    /// Prefer [`Registry::element`](crate::registry::Registry::element),
    /// which hands out the same element for the same id.
    #[must_use]
    pub fn new(id: impl Into<String>, fetch: Arc<dyn Fetch>, config: &Config) -> Self {
        let channels = config.channels.max(1);
        let sample_rate = config.sample_rate.max(1);

        let shared = Arc::new(Shared {
            id: id.into(),
            sample_rate,
            channels,
            media: Mutex::new(Media::default()),
            paused: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            ended_pending: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            volume: AtomicF32::new(1.0),
            muted: AtomicBool::new(false),
            tapped: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        Self { shared, fetch }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether both handles refer to the same element.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Takes the element's audio output. Succeeds only once.
    pub(crate) fn take_tap(&self) -> Option<ElementSource> {
        if self.shared.tapped.swap(true, Ordering::AcqRel) {
            return None;
        }

        Some(ElementSource {
            shared: Arc::clone(&self.shared),
            buffer: Vec::with_capacity(CHUNK_FRAMES * usize::from(self.shared.channels)),
            position: 0,
        })
    }

    /// Whether the audio output was taken.
    #[must_use]
    pub fn is_tapped(&self) -> bool {
        self.shared.tapped.load(Ordering::Acquire)
    }

    /// Sends all further events to `listener`, replacing any previous one.
    pub fn attach(&self, listener: UnboundedSender<Event>) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Stops sending events, returning the listener.
    pub fn detach(&self) -> Option<UnboundedSender<Event>> {
        self.shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Fetches `url` and makes it the current track.
    ///
    /// Failures to fetch or decode are reported through an `Error` event as
    /// well as the result, except for an expired resource, which is for the
    /// caller to retry. Cancelling `token` at any point before the track is
    /// assigned aborts silently and leaves the current track alone.
    pub async fn load(&self, url: &Url, token: &CancellationToken) -> LoadResult {
        if token.is_cancelled() {
            return LoadResult::Aborted;
        }

        debug!("{}: loading {url}", self.id());
        self.shared.emit(Event::LoadStart);

        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => return LoadResult::Aborted,
            fetched = self.fetch.fetch(url) => fetched,
        };

        match fetched {
            Ok(blob) => self.assign(blob, url, token),
            Err(e) => self.fail(e),
        }
    }

    /// Makes an already fetched blob the current track.
    ///
    /// Behaves like [`load`](Self::load) after the fetch.
    pub fn load_blob(&self, blob: Blob, url: &Url, token: &CancellationToken) -> LoadResult {
        if token.is_cancelled() {
            return LoadResult::Aborted;
        }

        debug!("{}: loading {url} from {} prefetched bytes", self.id(), blob.len());
        self.shared.emit(Event::LoadStart);
        self.assign(blob, url, token)
    }

    fn fail(&self, e: Error) -> LoadResult {
        match e.kind {
            ErrorKind::Aborted => LoadResult::Aborted,
            ErrorKind::ResourceExpired => {
                debug!("{}: {e}", self.id());
                LoadResult::Expired
            }
            _ => {
                error!("{}: {e}", self.id());
                self.shared.emit(Event::Error(e.to_string()));
                LoadResult::Failed(e)
            }
        }
    }

    fn assign(&self, blob: Blob, url: &Url, token: &CancellationToken) -> LoadResult {
        if token.is_cancelled() {
            return LoadResult::Aborted;
        }

        let extension = Path::new(url.path()).extension().and_then(OsStr::to_str);
        let decoder = match Decoder::new(&blob, extension) {
            Ok(decoder) => decoder,
            Err(e) => return self.fail(e),
        };
        let duration = decoder.total_duration();
        let source =
            UniformSourceIterator::new(decoder, self.shared.channels, self.shared.sample_rate);

        let previous = {
            let mut media = self.shared.media();
            if token.is_cancelled() {
                return LoadResult::Aborted;
            }

            self.shared.paused.store(true, Ordering::Relaxed);
            self.shared.ended.store(false, Ordering::Relaxed);
            self.shared.ended_pending.store(false, Ordering::Relaxed);
            self.shared.frames.store(0, Ordering::Relaxed);

            media.source = Some(source);
            media.src = Some(url.clone());
            media.duration = duration;
            media.blob.replace(blob)
        };

        if let Some(previous) = previous {
            trace!("{}: released {} bytes", self.id(), previous.len());
        }

        if let Some(duration) = duration {
            self.shared.emit(Event::DurationChange(duration));
        }
        self.shared.emit(Event::CanPlay);

        LoadResult::Loaded
    }

    /// Starts or resumes playback. Playing an ended track starts it over.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if no track is loaded.
    pub fn play(&self) -> Result<()> {
        if self.shared.media().source.is_none() {
            return Err(Error::failed_precondition("no track loaded"));
        }

        if self.shared.ended.load(Ordering::Relaxed) {
            self.rewind();
        }

        if self.shared.paused.swap(false, Ordering::Relaxed) {
            debug!("{}: play", self.id());
            self.shared.emit(Event::Play);
        }
        Ok(())
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::Relaxed) {
            debug!("{}: pause", self.id());
            self.shared.emit(Event::Pause);
        }
    }

    /// Pauses and rewinds to the start.
    pub fn stop(&self) {
        self.pause();
        self.rewind();
    }

    fn rewind(&self) {
        let mut media = self.shared.media();
        self.shared.ended.store(false, Ordering::Relaxed);
        self.shared.ended_pending.store(false, Ordering::Relaxed);
        self.shared.frames.store(0, Ordering::Relaxed);

        let Some(source) = media.source.as_mut() else {
            return;
        };
        if let Err(e) = source.try_seek(Duration::ZERO) {
            // Start over from the bytes.
            debug!("{}: cannot rewind ({e}), reopening", self.id());
            let Some(blob) = media.blob.clone() else {
                return;
            };
            let extension = media
                .src
                .as_ref()
                .and_then(|src| Path::new(src.path()).extension())
                .and_then(OsStr::to_str)
                .map(str::to_owned);
            match Decoder::new(&blob, extension.as_deref()) {
                Ok(decoder) => {
                    media.source = Some(UniformSourceIterator::new(
                        decoder,
                        self.shared.channels,
                        self.shared.sample_rate,
                    ));
                }
                Err(e) => {
                    error!("{}: {e}", self.id());
                    media.source = None;
                }
            }
        }
    }

    /// Seeks to `position`, clamped to the duration of the track.
    ///
    /// Returns the position actually seeked to.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if no track is loaded, or if the decoder
    /// cannot seek.
    pub fn seek(&self, position: Duration) -> Result<Duration> {
        let mut media = self.shared.media();
        let duration = media.duration;
        let source = media
            .source
            .as_mut()
            .ok_or_else(|| Error::failed_precondition("no track loaded"))?;

        let position = duration.map_or(position, |duration| position.min(duration));
        source.try_seek(position)?;

        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frames = (position.as_secs_f64() * f64::from(self.shared.sample_rate)).round() as u64;
        self.shared.frames.store(frames, Ordering::Relaxed);
        self.shared.ended.store(false, Ordering::Relaxed);
        self.shared.ended_pending.store(false, Ordering::Relaxed);

        debug!("{}: seeked to {:.1}s", self.id(), position.as_secs_f32());
        Ok(position)
    }

    /// Native gain of the element, applied before any processing.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.shared.volume.load()
    }

    /// Sets the native gain, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.shared.volume.store(volume);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.shared.position()
    }

    /// Duration of the current track, if the container knows it.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.shared.media().duration
    }

    #[must_use]
    pub fn src(&self) -> Option<Url> {
        self.shared.media().src.clone()
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.is_paused()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Relaxed)
    }

    /// Reports the position while playing, and the end of the track once.
    pub fn poll(&self) {
        if self.shared.ended_pending.swap(false, Ordering::Relaxed) {
            debug!("{}: ended", self.id());
            self.shared.emit(Event::Ended);
            return;
        }
        self.poll_time();
    }

    /// Emits `TimeUpdate` while playing, leaving a pending end in place.
    pub fn poll_time(&self) {
        if self.is_playing() {
            self.shared.emit(Event::TimeUpdate {
                current: self.current_time(),
                total: self.duration(),
            });
        }
    }
}

impl fmt::Debug for PlaybackElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackElement")
            .field("id", &self.shared.id)
            .field("paused", &self.is_paused())
            .field("position", &self.current_time())
            .finish_non_exhaustive()
    }
}

/// The audio output of a [`PlaybackElement`].
///
/// Never ends: while paused, between tracks or after the end of a track it
/// plays silence.
pub struct ElementSource {
    shared: Arc<Shared>,
    buffer: Vec<f32>,
    position: usize,
}

impl ElementSource {
    fn refill(&mut self) {
        let shared = &self.shared;
        let channels = usize::from(shared.channels);
        let len = CHUNK_FRAMES * channels;

        self.buffer.clear();
        self.position = 0;

        if !shared.paused.load(Ordering::Relaxed) {
            let mut media = shared.media();
            if let Some(source) = media.source.as_mut() {
                self.buffer.extend(source.by_ref().take(len));
                if self.buffer.len() < len {
                    shared.paused.store(true, Ordering::Relaxed);
                    shared.ended.store(true, Ordering::Relaxed);
                    shared.ended_pending.store(true, Ordering::Relaxed);
                }

                let frames = self.buffer.len() / channels;
                shared.frames.fetch_add(frames as u64, Ordering::Relaxed);
            }
        }

        let gain = if shared.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            shared.volume.load()
        };
        if (gain - 1.0).abs() > f32::EPSILON {
            self.buffer.iter_mut().for_each(|sample| *sample *= gain);
        }

        // Keep whole frames so channels never shift.
        self.buffer.resize(len, 0.0);
    }
}

impl Iterator for ElementSource {
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.buffer.len() {
            self.refill();
        }

        let sample = self.buffer.get(self.position).copied();
        self.position += 1;
        sample
    }
}

impl Source for ElementSource {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.shared.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl fmt::Debug for ElementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementSource")
            .field("element", &self.shared.id)
            .finish_non_exhaustive()
    }
}
