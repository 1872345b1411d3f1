//! Wake signal for the orchestrator loop.
//!
//! In-process producers hold a [`Waker`]; other processes touch the wake
//! file, which a polling watcher turns into the same signal. The loop blocks
//! on [`WakeSignal::wait`] with a timeout, so it reacts at once to submissions
//! and cancellations but still polls when nobody signals.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Config, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signalled,
    TimedOut,
    /// Every waker is gone; nothing can signal again.
    Closed,
}

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Waker {
    tx: Sender<()>,
}

impl Waker {
    pub fn wake(&self) {
        // A closed receiver means the loop has exited; nothing to wake.
        let _ = self.tx.send(());
    }
}

/// Receiving half owned by the loop.
pub struct WakeSignal {
    rx: Receiver<()>,
    // Keeps the file watcher alive for as long as the signal is used.
    _watcher: Option<PollWatcher>,
}

impl WakeSignal {
    pub fn new() -> (Waker, WakeSignal) {
        let (tx, rx) = mpsc::channel();
        (
            Waker { tx },
            WakeSignal {
                rx,
                _watcher: None,
            },
        )
    }

    /// Also wake whenever another process touches `wake_path`.
    pub fn watching(wake_path: &Path, poll: Duration) -> Result<(Waker, WakeSignal)> {
        touch(wake_path)?;
        let (waker, mut signal) = Self::new();
        let file_waker = waker.clone();
        let mut watcher = PollWatcher::new(
            move |event: notify::Result<notify::Event>| match event {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    debug!(paths = ?event.paths, "wake file touched");
                    file_waker.wake();
                }
                Ok(_) => {}
                Err(err) => warn!(err = %err, "wake file watcher error"),
            },
            Config::default().with_poll_interval(poll),
        )
        .context("create wake file watcher")?;
        watcher
            .watch(wake_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", wake_path.display()))?;
        signal._watcher = Some(watcher);
        Ok((waker, signal))
    }

    /// Block until signalled or `timeout` passes. Pending signals that piled
    /// up meanwhile are drained so one burst causes one wake.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let wake = match self.rx.recv_timeout(timeout) {
            Ok(()) => Wake::Signalled,
            Err(RecvTimeoutError::Timeout) => Wake::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Wake::Closed,
        };
        while self.rx.try_recv().is_ok() {}
        wake
    }
}

/// Cross-process wake: update the wake file's contents so pollers see a change.
pub fn touch(wake_path: &Path) -> Result<()> {
    if let Some(parent) = wake_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let stamp = crate::io::db::now_ms().to_string();
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(wake_path)
        .with_context(|| format!("open {}", wake_path.display()))?;
    std::io::Write::write_all(&mut file, stamp.as_bytes())
        .with_context(|| format!("write {}", wake_path.display()))?;
    Ok(())
}
