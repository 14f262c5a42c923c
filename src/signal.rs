//! Process signals for the command line player.
//!
//! * Unix: Ctrl-C (SIGINT) and SIGTERM stop playback, SIGHUP re-reads the
//!   audio and equalizer settings from the configuration file
//! * Windows: Ctrl-C only
//!
//! # Example
//!
//! ```no_run
//! use crossfader::signal::{Handler, Signal};
//!
//! async fn example() -> crossfader::error::Result<()> {
//!     let mut signals = Handler::new()?;
//!
//!     match signals.recv().await {
//!         Signal::Interrupt | Signal::Terminate => println!("stopping"),
//!         Signal::Reload => println!("reloading settings"),
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// A signal the player acts on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Signal {
    /// Ctrl-C or SIGINT: stop playing and exit.
    Interrupt,
    /// SIGTERM: stop playing and exit.
    Terminate,
    /// SIGHUP: re-read the settings.
    Reload,
}

/// Listens for [`Signal`]s.
pub struct Handler {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sighup: tokio::signal::unix::Signal,
}

impl Handler {
    /// Registers the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    ///
    /// On Windows this only waits for Ctrl-C.
    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => Signal::Interrupt,
                _ = self.sigterm.recv() => Signal::Terminate,
                _ = self.sighup.recv() => Signal::Reload,
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for Ctrl-C: {e}");
            }
            Signal::Interrupt
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "Ctrl+C"),
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Reload => write!(f, "SIGHUP"),
        }
    }
}
