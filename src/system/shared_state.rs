//! State shared by the workers of one densification run.
//!
//! Everything here is touched from several threads: the work cursor and the
//! cancellation token through atomics, the stage board through one mutex.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Hands out local image indices `0..total`, each exactly once.
#[derive(Debug)]
pub struct WorkCursor {
    next: AtomicUsize,
    total: usize,
}

impl WorkCursor {
    pub fn new(total: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            total,
        }
    }

    /// Claim the next unclaimed index, or None once all are handed out.
    pub fn claim(&self) -> Option<usize> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        (idx < self.total).then_some(idx)
    }

    /// Number of indices handed out so far.
    pub fn claimed(&self) -> usize {
        self.next.load(Ordering::SeqCst).min(self.total)
    }
}

/// Cooperative cancellation flag, cheap to clone across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress updates; `done` never decreases within a run.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, done: usize, total: usize);
}

/// Images completed (finalized or skipped) out of the working set.
pub struct Progress {
    done: AtomicUsize,
    total: AtomicUsize,
    /// Last value handed to the sink.
    reported: Mutex<usize>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Progress {
    pub fn new(sink: Option<Arc<dyn ProgressSink>>) -> Arc<Self> {
        Arc::new(Self {
            done: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            reported: Mutex::new(0),
            sink,
        })
    }

    /// Reset for a run over `total` images.
    pub fn start(&self, total: usize) {
        self.done.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        *self.reported.lock() = 0;
    }

    /// Count one more completed image and notify the sink.
    pub fn advance(&self) -> usize {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(sink) = self.sink.as_ref() {
            let mut reported = self.reported.lock();
            if done > *reported {
                *reported = done;
                sink.on_progress(done, self.total());
            }
        }
        done
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Completed fraction in `[0, 1]`; 1 for an empty run.
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        self.done() as f64 / total as f64
    }
}

/// Where an image stands in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    /// Estimated map published; filtering may still be outstanding.
    Estimated,
    Finalized,
    Skipped,
}

impl ImageState {
    /// Neighbors may filter against this image (or ignore it).
    fn is_resolved(self) -> bool {
        !matches!(self, ImageState::Pending)
    }
}

/// Per-image stages and filter tasks waiting on their neighbors.
///
/// Check-and-park and complete-and-release both happen under the caller's
/// single lock, so a parked task is always released by the last dependency
/// to resolve.
///
/// The board also tracks which published estimates are still needed: the
/// estimate of an image stays held until every image that may filter
/// against it is finalized or skipped.
#[derive(Debug)]
pub struct StageBoard {
    states: Vec<ImageState>,
    /// Filter tasks with the neighbors they wait for.
    parked: Vec<(usize, Vec<usize>)>,
    /// Images whose filter may read the estimate of each image.
    readers: Vec<Vec<usize>>,
    held: Vec<bool>,
}

impl StageBoard {
    /// `candidates[i]` lists the images `i` may filter against.
    pub fn new(candidates: &[Vec<usize>]) -> Self {
        let total = candidates.len();
        let mut readers = vec![Vec::new(); total];
        for (idx, list) in candidates.iter().enumerate() {
            for &c in list {
                if c != idx {
                    if let Some(r) = readers.get_mut(c) {
                        r.push(idx);
                    }
                }
            }
        }
        Self {
            states: vec![ImageState::Pending; total],
            parked: Vec::new(),
            readers,
            held: vec![false; total],
        }
    }

    fn is_ready(&self, deps: &[usize]) -> bool {
        deps.iter()
            .all(|&d| self.states.get(d).map_or(true, |s| s.is_resolved()))
    }

    /// True if the filter task of `idx` can run now; otherwise it is parked.
    pub fn request_filter(&mut self, idx: usize, deps: Vec<usize>) -> bool {
        if self.is_ready(&deps) {
            return true;
        }
        self.parked.push((idx, deps));
        false
    }

    /// Record a published estimate. Returns the filter tasks it releases.
    pub fn mark_estimated(&mut self, idx: usize) -> Vec<usize> {
        self.set(idx, ImageState::Estimated);
        if let Some(h) = self.held.get_mut(idx) {
            *h = true;
        }
        self.release()
    }

    /// Record a skipped image. Returns the filter tasks it releases.
    pub fn mark_skipped(&mut self, idx: usize) -> Vec<usize> {
        self.set(idx, ImageState::Skipped);
        // A skipped image never filters, drop its own parked task.
        self.parked.retain(|(task, _)| *task != idx);
        self.release()
    }

    pub fn mark_finalized(&mut self, idx: usize) {
        self.set(idx, ImageState::Finalized);
    }

    fn set(&mut self, idx: usize, state: ImageState) {
        if let Some(s) = self.states.get_mut(idx) {
            *s = state;
        }
    }

    fn release(&mut self) -> Vec<usize> {
        let parked = std::mem::take(&mut self.parked);
        let mut released = Vec::new();
        for (task, deps) in parked {
            if self.is_ready(&deps) {
                released.push(task);
            } else {
                self.parked.push((task, deps));
            }
        }
        released
    }

    /// Held estimates no remaining filter task can read. Each is returned once.
    pub fn take_unused_estimates(&mut self) -> Vec<usize> {
        let mut unused = Vec::new();
        for idx in 0..self.held.len() {
            if !self.held[idx] {
                continue;
            }
            let in_use = self.readers[idx]
                .iter()
                .any(|&r| !matches!(self.states[r], ImageState::Finalized | ImageState::Skipped));
            if !in_use {
                self.held[idx] = false;
                unused.push(idx);
            }
        }
        unused
    }

    pub fn held_count(&self) -> usize {
        self.held.iter().filter(|&&h| h).count()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn count(&self, state: ImageState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }

    /// Every image is finalized or skipped.
    pub fn is_complete(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s, ImageState::Finalized | ImageState::Skipped))
    }
}
