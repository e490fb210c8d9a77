//! Background flusher and the write-lock fairness hint.
//!
//! The flusher sleeps until either a commit asks for a flush or the idle
//! timeout passes with unflushed pages, then applies the journal to the data
//! file. Queued data file syncs and shutdown wake it through the same
//! condition variable.

use crate::env::EnvInner;
use crate::error::{Result, StorageError};
use crate::journal::{apply_logs_to_data_file, ApplyOutcome};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one background pass waits for writers to let go of the flush lock
const FLUSH_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause taken by threads that are not preferred before contending for the
/// write lock
const YIELD_PAUSE: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SignalState {
    requested: bool,
    sync: bool,
    shutdown: bool,
}

/// Why the flusher woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    Requested,
    SyncRequested,
    IdleTimeout,
    Shutdown,
}

/// Flush requests and shutdown, delivered through one condition variable
#[derive(Default)]
pub(crate) struct FlushSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl FlushSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ask the flusher to run as soon as possible
    pub(crate) fn request(&self) {
        self.state.lock().requested = true;
        self.condvar.notify_all();
    }

    /// Ask the flusher to fsync the data file on its next wakeup
    pub(crate) fn request_sync(&self) {
        self.state.lock().sync = true;
        self.condvar.notify_all();
    }

    /// Consume a queued sync request
    pub(crate) fn take_sync_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().sync)
    }

    #[cfg(test)]
    pub(crate) fn sync_pending(&self) -> bool {
        self.state.lock().sync
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.condvar.notify_all();
    }

    /// Block until a request, shutdown, or `idle` elapses
    pub(crate) fn wait(&self, idle: Duration) -> Wakeup {
        let mut state = self.state.lock();
        if !state.requested && !state.sync && !state.shutdown {
            self.condvar.wait_for(&mut state, idle);
        }
        if state.shutdown {
            Wakeup::Shutdown
        } else if std::mem::take(&mut state.requested) {
            Wakeup::Requested
        } else if state.sync {
            Wakeup::SyncRequested
        } else {
            Wakeup::IdleTimeout
        }
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Advisory hint letting one thread (the flusher) get ahead of writers
///
/// While a thread is preferred, every other thread pauses briefly before
/// taking the write lock. Nothing is enforced.
#[derive(Default)]
pub(crate) struct FairnessHint {
    preferred: AtomicU64,
}

impl FairnessHint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn prefer_current_thread(&self) {
        self.preferred
            .store(current_thread_token(), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.preferred.store(0, Ordering::Release);
    }

    pub(crate) fn yield_if_not_preferred(&self) {
        let preferred = self.preferred.load(Ordering::Acquire);
        if preferred != 0 && preferred != current_thread_token() {
            thread::sleep(YIELD_PAUSE);
        }
    }
}

/// Start the background flusher thread
pub(crate) fn spawn_flusher(env: Arc<EnvInner>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pagestore-flusher".to_string())
        .spawn(move || run(&env))
        .map_err(StorageError::Io)
}

fn run(env: &EnvInner) {
    info!(path = %env.options.path.display(), "flusher.start");
    loop {
        let wakeup = env.signal.wait(env.options.idle_flush_timeout_duration());
        if wakeup == Wakeup::Shutdown {
            break;
        }
        if env.signal.take_sync_request() {
            sync_data_file(env);
        }
        match wakeup {
            Wakeup::SyncRequested => continue,
            Wakeup::IdleTimeout if env.unflushed_pages.load(Ordering::Acquire) == 0 => continue,
            _ => {}
        }
        if env.options.manual_flushing || env.is_out_of_disk_space() {
            continue;
        }

        match apply_logs_to_data_file(env, FLUSH_LOCK_TIMEOUT) {
            Ok(ApplyOutcome::LockTimeout) => debug!("flusher.retry_later"),
            Ok(ApplyOutcome::Applied { up_to, pages }) => debug!(up_to, pages, "flusher.applied"),
            Ok(ApplyOutcome::NothingToApply) => {}
            Err(err) if err.is_disk_full() => {
                warn!(error = %err, "flusher.disk_full");
            }
            Err(err) => {
                error!(error = %err, "flusher.failed");
                *env.flushing_error.lock() = Some(err);
            }
        }
    }
    info!("flusher.stop");
}

fn sync_data_file(env: &EnvInner) {
    let _flushing = env.flushing.lock();
    match env.pager.sync() {
        Ok(()) => debug!("flusher.synced"),
        Err(err) => {
            error!(error = %err, "flusher.sync_failed");
            *env.flushing_error.lock() = Some(err);
        }
    }
}
