//! Process-wide shutdown requests.
//!
//! [`listen_for_signals`] installs the SIGINT/SIGTERM handlers once, at
//! startup. Everything that owns a child process waits on a [`Shutdown`]
//! clone so the child is torn down before the process exits.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

/// Read side: resolves once a shutdown signal has arrived
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<Option<i32>>,
}

/// Write side, held by the signal listeners
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<Option<i32>>>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    /// Record `signal`; only the first request is kept.
    pub fn fire(&self, signal: i32) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }
}

impl Shutdown {
    /// A handle that never fires
    pub fn never() -> Self {
        channel().1
    }

    /// Signal number of the request, if one arrived
    pub fn signal(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    pub fn is_requested(&self) -> bool {
        self.signal().is_some()
    }

    /// Wait for a request and return its signal number. Pends forever once
    /// every trigger is gone without firing.
    pub async fn requested(&self) -> i32 {
        let mut rx = self.rx.clone();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::never()
    }
}

/// Install SIGINT and SIGTERM handlers and return the handle they fire.
///
/// Handlers are registered before this returns, so a signal arriving right
/// after startup is not lost. A second signal exits immediately.
pub fn listen_for_signals() -> Shutdown {
    let (trigger, shutdown) = channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, number) in [(SignalKind::interrupt(), SIGINT), (SignalKind::terminate(), SIGTERM)] {
            match signal(kind) {
                Ok(mut stream) => {
                    let trigger = trigger.clone();
                    tokio::spawn(async move {
                        if stream.recv().await.is_none() {
                            return;
                        }
                        warn!(signal = number, "shutdown requested, stopping child processes");
                        trigger.fire(number);
                        if stream.recv().await.is_some() {
                            warn!(signal = number, "second signal, exiting immediately");
                            std::process::exit(128 + number);
                        }
                    });
                }
                Err(e) => warn!(signal = number, "cannot install signal handler: {e}"),
            }
        }
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => trigger.fire(SIGINT),
            Err(e) => warn!("failed to listen for Ctrl+C: {e}"),
        }
    });

    shutdown
}
