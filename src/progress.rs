// src/progress.rs

//! Progress reporting for transfers.
//!
//! The transfer pipeline reports raw and decompressed byte counters
//! through a [`ProgressTracker`]. Unlike a plain observer, the tracker
//! can veto the transfer: returning `true` from [`ProgressTracker::update`]
//! aborts the download with an abort error.

use std::sync::atomic::{AtomicU64, Ordering};

/// One progress sample. Totals are unknown until (and unless) the
/// transport or the gzip header provides them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressUpdate {
    /// Bytes consumed from the transport so far.
    pub raw_now: u64,
    pub raw_total: Option<u64>,
    /// Bytes written to the destination (after decompression, if any).
    pub dec_now: u64,
    pub dec_total: Option<u64>,
    /// Percent complete when any total is known. Monotonic, capped at 100.
    pub percent: Option<u8>,
}

pub trait ProgressTracker: Send + Sync {
    fn start(&self, label: &str);

    /// Report a sample. Return `true` to abort the transfer.
    fn update(&self, update: &ProgressUpdate) -> bool;

    fn done(&self, ok: bool);
}

/// No-op tracker.
pub struct SilentProgress;

impl ProgressTracker for SilentProgress {
    fn start(&self, _label: &str) {}

    fn update(&self, _update: &ProgressUpdate) -> bool {
        false
    }

    fn done(&self, _ok: bool) {}
}

/// Logs coarse progress via tracing, at most one line per percent step
/// (or per MiB when no total is known).
pub struct LogProgress {
    last: AtomicU64,
}

impl LogProgress {
    pub fn new() -> Self {
        LogProgress {
            last: AtomicU64::new(u64::MAX),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker for LogProgress {
    fn start(&self, label: &str) {
        self.last.store(u64::MAX, Ordering::Relaxed);
        tracing::info!("loading {label}");
    }

    fn update(&self, update: &ProgressUpdate) -> bool {
        let step = match update.percent {
            Some(pct) => pct as u64,
            // fall back to a kB counter, one line per MiB
            None => update.raw_now >> 20,
        };
        if self.last.swap(step, Ordering::Relaxed) != step {
            match update.percent {
                Some(pct) => tracing::info!("{pct}%"),
                None => tracing::info!("{} kB", update.raw_now >> 10),
            }
        }
        false
    }

    fn done(&self, ok: bool) {
        if ok {
            tracing::info!("done");
        } else {
            tracing::info!("failed");
        }
    }
}

/// Forwards every sample to a closure; the closure's return value is the
/// abort veto.
pub struct CallbackProgress<F>
where
    F: Fn(&ProgressUpdate) -> bool + Send + Sync,
{
    callback: F,
}

impl<F> CallbackProgress<F>
where
    F: Fn(&ProgressUpdate) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        CallbackProgress { callback }
    }
}

impl<F> ProgressTracker for CallbackProgress<F>
where
    F: Fn(&ProgressUpdate) -> bool + Send + Sync,
{
    fn start(&self, _label: &str) {}

    fn update(&self, update: &ProgressUpdate) -> bool {
        (self.callback)(update)
    }

    fn done(&self, _ok: bool) {}
}
