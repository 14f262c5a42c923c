//! Decoding of fetched blobs into samples.
//!
//! [`Decoder`] probes the container of a [`Blob`], picks its default track
//! and turns packets into interleaved `f32` samples on demand. It is a
//! [`rodio::Source`], so an element can play it, seek it and ask it for the
//! track duration.
//!
//! Containers and codecs are whatever Symphonia is built with: AAC, FLAC, MP3,
//! MP4, Ogg/Vorbis and WAV. A codec that does not report its format is assumed
//! to be 44.1 kHz stereo.

use std::time::Duration;

use rodio::source::SeekError;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{self, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{
    blob::Blob,
    error::{Error, Result},
};

/// Sample type of all decoded audio.
pub type SampleFormat = f32;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: u16 = 2;

/// Malformed packets tolerated in a row before the stream is given up on.
const MAX_BAD_PACKETS: usize = 3;

/// Ring buffer size of the media stream. Symphonia requires at least 64 KiB.
const STREAM_BUFFER_LEN: usize = 64 * 1024;

/// Outcome of pulling one packet from the container.
enum Refill {
    /// New samples are buffered.
    Ready,
    /// The packet held nothing to play; pull the next one.
    Empty,
    /// The packet was malformed and was dropped.
    Malformed,
    /// No more samples will come.
    Done,
}

/// A Symphonia demuxer and codec pair for one track.
pub struct Decoder {
    format: Box<dyn FormatReader>,
    codec: Box<dyn codecs::Decoder>,
    track_id: u32,

    frame: Option<SampleBuffer<SampleFormat>>,
    cursor: usize,
    /// Samples still to drop after a seek landed before its target.
    skip: u64,

    channels: u16,
    sample_rate: u32,
    duration: Option<Duration>,
}

impl Decoder {
    /// Probes `blob` and opens its default track.
    ///
    /// `extension` is the file extension of the URL the blob came from.
    /// Together with the MIME type it only narrows down the probe; the
    /// container is recognized from the bytes.
    ///
    /// # Errors
    ///
    /// `FormatUnsupported` when no demuxer or codec recognizes the stream,
    /// `DecodeFailure` when it is malformed or has no audio track.
    pub fn new(blob: &Blob, extension: Option<&str>) -> Result<Self> {
        let stream = MediaSourceStream::new(
            Box::new(blob.reader()),
            MediaSourceStreamOptions {
                buffer_len: STREAM_BUFFER_LEN,
            },
        );

        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }
        if let Some(mime_type) = blob.mime_type() {
            hint.mime_type(mime_type);
        }

        let options = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let format = symphonia::default::get_probe()
            .format(&hint, stream, &options, &MetadataOptions::default())?
            .format;

        let track = format
            .default_track()
            .ok_or_else(|| Error::decode_failure("no audio track"))?;
        let track_id = track.id;
        let codec =
            symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        // The codec may know more than the container did.
        let params = codec.codec_params();
        let sample_rate = params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = params.channels.map_or(DEFAULT_CHANNELS, |channels| {
            u16::try_from(channels.count()).unwrap_or(u16::MAX)
        });
        let duration = params
            .time_base
            .zip(params.n_frames)
            .map(|(time_base, frames)| time_base.calc_time(frames).into());

        Ok(Self {
            format,
            codec,
            track_id,
            frame: None,
            cursor: 0,
            skip: 0,
            channels,
            sample_rate,
            duration,
        })
    }

    fn is_drained(&self) -> bool {
        self.frame
            .as_ref()
            .is_none_or(|frame| self.cursor >= frame.len())
    }

    fn refill(&mut self) -> Refill {
        let packet = match self.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Refill::Done;
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("dropping malformed packet: {e}");
                return Refill::Malformed;
            }
            Err(SymphoniaError::ResetRequired) => {
                self.codec.reset();
                return Refill::Empty;
            }
            Err(e) => {
                error!("cannot read packet: {e}");
                return Refill::Done;
            }
        };

        if packet.track_id() != self.track_id {
            return Refill::Empty;
        }

        let decoded = match self.codec.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("dropping undecodable packet: {e}");
                return Refill::Malformed;
            }
            Err(e) => {
                error!("cannot decode packet: {e}");
                return Refill::Done;
            }
        };

        let needed = decoded.capacity() * decoded.spec().channels.count();
        let frame = match self.frame.as_mut() {
            Some(frame) if frame.capacity() >= needed => frame,
            _ => self.frame.insert(SampleBuffer::new(
                decoded.capacity() as u64,
                *decoded.spec(),
            )),
        };
        frame.copy_interleaved_ref(decoded);
        self.cursor = 0;

        // Encoder priming and padding decode to nothing.
        if frame.len() == 0 {
            Refill::Empty
        } else {
            Refill::Ready
        }
    }
}

impl rodio::Source for Decoder {
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.frame
            .as_ref()
            .map(|frame| frame.len().saturating_sub(self.cursor))
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.duration
    }

    fn try_seek(&mut self, pos: Duration) -> std::result::Result<(), SeekError> {
        let to = SeekTo::Time {
            track_id: Some(self.track_id),
            time: pos.into(),
        };
        let seeked = self
            .format
            .seek(SeekMode::Accurate, to)
            .map_err(|e| SeekError::Other(Box::new(e)))?;

        // The codec still holds state from before the jump.
        self.codec.reset();
        self.frame = None;
        self.cursor = 0;
        self.skip = seeked.required_ts.saturating_sub(seeked.actual_ts) * u64::from(self.channels);
        Ok(())
    }
}

impl Iterator for Decoder {
    type Item = SampleFormat;

    fn next(&mut self) -> Option<Self::Item> {
        while self.skip > 0 {
            self.skip -= 1;
            self.next_sample()?;
        }
        self.next_sample()
    }
}

impl Decoder {
    fn next_sample(&mut self) -> Option<SampleFormat> {
        let mut bad_packets = 0;
        while self.is_drained() {
            match self.refill() {
                Refill::Ready => break,
                Refill::Empty => {}
                Refill::Malformed => {
                    bad_packets += 1;
                    if bad_packets > MAX_BAD_PACKETS {
                        error!("too many malformed packets in a row, stopping");
                        return None;
                    }
                }
                Refill::Done => return None,
            }
        }

        let sample = self
            .frame
            .as_ref()
            .and_then(|frame| frame.samples().get(self.cursor).copied())?;
        self.cursor += 1;
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rodio::Source;

    use super::*;

    fn wav(channels: u16, sample_rate: u32, frames: u32) -> Blob {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames * u32::from(channels) {
            writer.write_sample((i % 100) as i16 * 100).unwrap();
        }
        writer.finalize().unwrap();
        Blob::new(cursor.into_inner(), Some("audio/wav".to_owned()))
    }

    #[test]
    fn reports_the_stream_format() {
        let decoder = Decoder::new(&wav(2, 8_000, 16_000), Some("wav")).unwrap();
        assert_eq!(decoder.channels(), 2);
        assert_eq!(decoder.sample_rate(), 8_000);
        assert_eq!(decoder.total_duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn yields_every_sample() {
        let decoder = Decoder::new(&wav(1, 8_000, 4_000), None).unwrap();
        assert_eq!(decoder.count(), 4_000);
    }

    #[test]
    fn seeking_skips_ahead() {
        let mut decoder = Decoder::new(&wav(1, 8_000, 8_000), None).unwrap();
        decoder.try_seek(Duration::from_millis(750)).unwrap();
        let remaining = decoder.count();
        assert!((1_990..=2_010).contains(&remaining), "{remaining} samples left");
    }

    #[test]
    fn garbage_is_rejected() {
        let blob = Blob::new(vec![0x42; 4096], None);
        assert!(Decoder::new(&blob, None).is_err());
    }
}
