//! Streaming audio playback with gapless and crossfaded transitions.
//!
//! Tracks are fetched over HTTP, decoded with Symphonia and played through
//! rodio. Two playback elements take turns: while one plays, the next track
//! loads on the other, and the two are faded into each other along an
//! equal-power curve. Every element's audio passes through a processing
//! graph with a ten-band equalizer, a normalizing compressor and the master
//! volume.
//!
//! # Architecture
//!
//! * [`engine`]: the façade that owns volume, settings and transitions
//! * [`element`]: one decodable track with transport controls
//! * [`graph`]: equalizer, compressor and gain stage per element
//! * [`registry`]: elements, their one-time source bindings and the audio
//!   context, shared across engine instances
//! * [`crossfade`]: trigger policy and gain ramps
//! * [`capture`]: processing for elements the engine does not own
//! * [`context`]: the audio output and its lifecycle
//!
//! Network access goes through the [`http::Fetch`] trait and the audio
//! output through [`context::Backend`], so both can be replaced.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod blob;
pub mod capture;
pub mod config;
pub mod context;
pub mod crossfade;
pub mod decoder;
pub mod element;
pub mod engine;
pub mod equalizer;
pub mod error;
pub mod events;
pub mod graph;
pub mod http;
pub mod normalize;
pub mod registry;
pub mod settings;
pub mod signal;
pub mod track;
pub mod util;
