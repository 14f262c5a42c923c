//! Events emitted during playback.
//!
//! The engine forwards the low-level events of whichever element currently
//! plays the primary role, plus its own transition events. Listeners receive
//! them over a tokio channel registered with
//! [`Engine::set_event_handler`](crate::engine::Engine::set_event_handler).
//!
//! # Example
//!
//! ```rust
//! use crossfader::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TimeUpdate { current, .. } => println!("at {current:?}"),
//!         Event::CrossfadeStart => println!("queue the next track"),
//!         _ => {}
//!     }
//! }
//! ```

use std::{fmt, time::Duration};

use tokio::sync::mpsc::UnboundedSender;

/// Events that can be emitted by the playback engine.
///
/// Events fall into two categories:
///
/// Element Events:
/// * [`LoadStart`](Self::LoadStart), [`CanPlay`](Self::CanPlay),
///   [`DurationChange`](Self::DurationChange) - Loading progress
/// * [`Play`](Self::Play), [`Pause`](Self::Pause), [`Ended`](Self::Ended) -
///   Transport state changes
/// * [`TimeUpdate`](Self::TimeUpdate) - Periodic position reports
/// * [`Error`](Self::Error) - The current track failed to load
///
/// Transition Events:
/// * [`CrossfadeStart`](Self::CrossfadeStart) - The next track is due
/// * [`TrackChanged`](Self::TrackChanged) - The secondary took over
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Playback has started.
    Play,

    /// Playback has paused.
    Pause,

    /// The current track played to its end.
    Ended,

    /// Periodic position report while playing.
    TimeUpdate {
        current: Duration,
        total: Option<Duration>,
    },

    /// The duration of the current track became known.
    DurationChange(Duration),

    /// Loading the current track failed.
    ///
    /// Never emitted for superseded loads or expired URLs.
    Error(String),

    /// Fetching a new track has started.
    LoadStart,

    /// The new track is decoded far enough to start playing.
    CanPlay,

    /// The current track is close enough to its end to start the transition.
    ///
    /// Emitted once per track. The listener is expected to answer with
    /// [`Engine::crossfade_to`](crate::engine::Engine::crossfade_to).
    CrossfadeStart,

    /// A transition completed and the next track is now the current one.
    TrackChanged,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Play => write!(f, "play"),
            Event::Pause => write!(f, "pause"),
            Event::Ended => write!(f, "ended"),
            Event::TimeUpdate { current, total } => match total {
                Some(total) => write!(
                    f,
                    "time update {:.1}s/{:.1}s",
                    current.as_secs_f32(),
                    total.as_secs_f32()
                ),
                None => write!(f, "time update {:.1}s", current.as_secs_f32()),
            },
            Event::DurationChange(duration) => {
                write!(f, "duration change {:.1}s", duration.as_secs_f32())
            }
            Event::Error(message) => write!(f, "error: {message}"),
            Event::LoadStart => write!(f, "load start"),
            Event::CanPlay => write!(f, "can play"),
            Event::CrossfadeStart => write!(f, "crossfade start"),
            Event::TrackChanged => write!(f, "track changed"),
        }
    }
}

/// Sends an event to a listener, if one is attached.
///
/// A listener that hung up is not an error: nobody is interested anymore.
pub(crate) fn emit(listener: Option<&UnboundedSender<Event>>, event: Event) {
    if let Some(tx) = listener {
        trace!("emitting {event}");
        if tx.send(event).is_err() {
            trace!("event listener is gone");
        }
    }
}
