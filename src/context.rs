//! The audio context: where processed audio ends up.
//!
//! A context owns the output backend and a running flag. It is created
//! lazily on the first user-initiated playback action and starts suspended;
//! only [`AudioContext::resume`] lets audio through. Graphs open their
//! destinations through the context, so every destination of a context plays
//! on the same device.
//!
//! # Backends
//!
//! * [`DeviceBackend`]: a cpal output device, the system default or one
//!   selected by name
//! * [`IdleBackend`]: no device at all, the caller pulls the mixed output

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{queue::SourcesQueueOutput, OutputStream, OutputStreamHandle, Sink};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
};

/// Output backend of an [`AudioContext`].
pub trait Backend: Send + Sync {
    /// Brings up the output.
    ///
    /// Called once per context. Starting an already started backend is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if there is nothing to play on.
    fn start(&self) -> Result<()>;

    /// Opens a new destination on the started output.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the output is not running.
    fn open(&self) -> Result<Sink>;
}

/// Output on a cpal device.
///
/// The `OutputStream` cannot leave the thread it was created on, so it lives
/// on a dedicated thread until the backend is dropped. Only its handle is
/// shared.
pub struct DeviceBackend {
    device: Option<String>,
    handle: Mutex<Option<OutputStreamHandle>>,
    stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl DeviceBackend {
    /// Creates a backend for the device named `device`, or for the system
    /// default output device.
    #[must_use]
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            handle: Mutex::new(None),
            stop: Mutex::new(None),
        }
    }

    /// Names of the output devices of the default host.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the devices cannot be enumerated.
    pub fn devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()?
            .filter_map(|device| device.name().ok())
            .collect();
        Ok(devices)
    }

    fn open_stream(device: Option<&str>) -> Result<(OutputStream, OutputStreamHandle)> {
        let Some(name) = device else {
            return Ok(OutputStream::try_default()?);
        };

        let host = cpal::default_host();
        let device = host
            .output_devices()?
            .find(|device| device.name().is_ok_and(|device| device == name))
            .ok_or_else(|| Error::context_unavailable(format!("audio device {name} not found")))?;

        Ok(OutputStream::try_from_device(&device)?)
    }
}

impl Backend for DeviceBackend {
    fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock()?;
        if handle.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device = self.device.clone();

        thread::Builder::new()
            .name("audio output".to_string())
            .spawn(move || match Self::open_stream(device.as_deref()) {
                Ok((stream, handle)) => {
                    if ready_tx.send(Ok(handle)).is_ok() {
                        // Blocks until the backend hangs up.
                        let _ = stop_rx.recv();
                    }
                    drop(stream);
                    debug!("audio output closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let stream_handle = ready_rx
            .recv()
            .map_err(|e| Error::context_unavailable(format!("audio output thread died: {e}")))??;

        info!(
            "audio output started on {}",
            self.device.as_deref().unwrap_or("default device")
        );
        *handle = Some(stream_handle);
        *self.stop.lock()? = Some(stop_tx);

        Ok(())
    }

    fn open(&self) -> Result<Sink> {
        let handle = self.handle.lock()?;
        let handle = handle
            .as_ref()
            .ok_or_else(|| Error::context_unavailable("audio output not started"))?;
        Ok(Sink::try_new(handle)?)
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        // Dropping the sender wakes up and ends the output thread.
        self.stop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Output without a device.
///
/// Every destination is an idle sink whose mixed output is kept until
/// [`take_outputs`](Self::take_outputs) hands it to whoever drives playback,
/// like a test pulling samples or an offline renderer.
#[derive(Default)]
pub struct IdleBackend {
    outputs: Mutex<Vec<SourcesQueueOutput<f32>>>,
    unavailable: bool,
}

impl IdleBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that fails to start, like a machine without audio devices.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Takes the outputs of all destinations opened since the last call.
    pub fn take_outputs(&self) -> Vec<SourcesQueueOutput<f32>> {
        std::mem::take(&mut *self.outputs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Backend for IdleBackend {
    fn start(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::context_unavailable("no audio output"));
        }
        Ok(())
    }

    fn open(&self) -> Result<Sink> {
        let (sink, output) = Sink::new_idle();
        self.outputs.lock()?.push(output);
        Ok(sink)
    }
}

/// Whether a context lets audio through.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ContextState {
    Suspended,
    Running,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspended => write!(f, "suspended"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// A started output with a fixed sample format.
pub struct AudioContext {
    id: Uuid,
    backend: Arc<dyn Backend>,
    running: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
}

impl AudioContext {
    /// Starts `backend` and creates a suspended context on it.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the backend fails to start.
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Result<Self> {
        if let Err(e) = backend.start() {
            return Err(match e.kind {
                ErrorKind::ContextUnavailable => e,
                _ => Error::context_unavailable(e),
            });
        }

        let id = Uuid::new_v4();
        debug!("created audio context {id}");

        Ok(Self {
            id,
            backend,
            running: Arc::new(AtomicBool::new(false)),
            sample_rate: config.sample_rate,
            channels: config.channels,
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        if self.running.load(Ordering::Relaxed) {
            ContextState::Running
        } else {
            ContextState::Suspended
        }
    }

    /// Lets audio through. Only call from a user-initiated action.
    pub fn resume(&self) {
        if !self.running.swap(true, Ordering::Relaxed) {
            debug!("audio context {} resumed", self.id);
        }
    }

    /// Silences every destination of this context.
    pub fn suspend(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            debug!("audio context {} suspended", self.id);
        }
    }

    /// Opens a new destination.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the backend cannot open one.
    pub fn open_destination(&self) -> Result<Sink> {
        self.backend.open()
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_suspended() {
        let context = AudioContext::new(Arc::new(IdleBackend::new()), &Config::default()).unwrap();
        assert_eq!(context.state(), ContextState::Suspended);
        context.resume();
        assert_eq!(context.state(), ContextState::Running);
    }

    #[test]
    fn unavailable_backend() {
        let err = AudioContext::new(Arc::new(IdleBackend::unavailable()), &Config::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextUnavailable);
    }

    #[test]
    fn idle_destinations_hand_out_their_output() {
        let backend = Arc::new(IdleBackend::new());
        let context = AudioContext::new(backend.clone(), &Config::default()).unwrap();
        let _first = context.open_destination().unwrap();
        let _second = context.open_destination().unwrap();
        assert_eq!(backend.take_outputs().len(), 2);
        assert!(backend.take_outputs().is_empty());
    }
}
