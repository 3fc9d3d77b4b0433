//! Shutdown and leave signalling for worker processes.
//!
//! OS signals are turned into a `watch` channel once per process. The
//! receiving half, [`Shutdown`], is handed to every loop and wait in the
//! worker, which checks it at each loop head and selects on it while idle.

use nix::sys::signal::{signal, SigHandler, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{self as unix_signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors raised while wiring signal handlers.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to set up signal handler: {0}")]
    HandlerFailed(#[from] std::io::Error),

    #[error("failed to ignore {signal}: {source}")]
    Ignore {
        signal: Signal,
        #[source]
        source: nix::errno::Errno,
    },
}

/// Receiving half of the shutdown channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// If every trigger is dropped without firing, this never resolves.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sending half of the shutdown channel.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create an untriggered shutdown channel.
#[must_use]
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Background signal listeners, aborted on drop.
#[derive(Debug, Default)]
pub struct SignalGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Request shutdown on the first of `kinds` to arrive.
///
/// Must be called from inside a tokio runtime.
pub fn on_signals(kinds: &[SignalKind]) -> Result<(Shutdown, SignalGuard), SignalError> {
    let (trigger, shutdown) = channel();
    let trigger = Arc::new(trigger);
    let mut guard = SignalGuard::default();

    for kind in kinds {
        let mut stream = unix_signal::signal(*kind)?;
        let trigger = Arc::clone(&trigger);
        guard.tasks.push(tokio::spawn(async move {
            if stream.recv().await.is_some() {
                trigger.trigger();
            }
        }));
    }

    Ok((shutdown, guard))
}

/// Shutdown wiring used by every worker process: SIGUSR2 from the director,
/// SIGTERM from anyone else.
pub fn worker_shutdown() -> Result<(Shutdown, SignalGuard), SignalError> {
    on_signals(&[SignalKind::user_defined2(), SignalKind::terminate()])
}

/// Ignore SIGINT so only the director reacts to Ctrl+C in the terminal.
pub fn ignore_interrupt() -> Result<(), SignalError> {
    // SAFETY: installing SIG_IGN does not run any handler code.
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }
        .map(drop)
        .map_err(|source| SignalError::Ignore {
            signal: Signal::SIGINT,
            source,
        })
}

/// Pending temporary-leave request for a specialist (SIGUSR1).
#[derive(Debug, Clone, Default)]
pub struct LeaveRequests {
    pending: Arc<AtomicBool>,
}

impl LeaveRequests {
    pub fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    /// Consume the pending request, if any.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Mark a request on every SIGUSR1.
    pub fn listen(&self) -> Result<SignalGuard, SignalError> {
        let mut stream = unix_signal::signal(SignalKind::user_defined1())?;
        let requests = self.clone();
        let task = tokio::spawn(async move {
            while stream.recv().await.is_some() {
                requests.request();
            }
        });
        Ok(SignalGuard { tasks: vec![task] })
    }
}
