// Playback queue and consumer loop
//
// The dispatcher is the only producer and the playback worker the only
// consumer. All mutation happens under one mutex, so a flush can never race an
// enqueue: frames pushed after the flush released the lock survive it.
//
// Device writes happen under a second lock that flush also takes (always
// before the queue lock). Once flush returns, no frame taken before it can
// still reach the device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::backend::{AudioFrame, AudioOutput};
use crate::error::Result;

/// How long the consumer waits for a frame before re-checking the stop flag
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

struct QueueState {
    frames: VecDeque<AudioFrame>,
    /// Bumped by every flush
    epoch: u64,
    /// Frames handed to the consumer and not yet completed
    in_flight: usize,
}

/// A frame taken from the queue, tagged with the flush epoch it was taken in
#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: AudioFrame,
    epoch: u64,
}

/// Ordered, thread-safe queue of frames waiting to be played
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    writing: Mutex<()>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                epoch: 0,
                in_flight: 0,
            }),
            available: Condvar::new(),
            writing: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }

    fn write_gate(&self) -> MutexGuard<'_, ()> {
        match self.writing.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Append a frame at the back of the queue
    pub fn enqueue(&self, frame: AudioFrame) {
        let mut state = self.lock();
        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();
    }

    /// Take the oldest frame, waiting up to `timeout` for one to arrive
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<QueuedFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(frame) = state.frames.pop_front() {
                state.in_flight += 1;
                return Some(QueuedFrame {
                    frame,
                    epoch: state.epoch,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            state = match self.available.wait_timeout(state, deadline - now) {
                Ok((s, _)) => s,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// Mark a dequeued frame as finished (played or discarded)
    pub fn complete(&self, _frame: QueuedFrame) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Whether a dequeued frame was taken before a flush that has since happened
    pub fn is_stale(&self, frame: &QueuedFrame) -> bool {
        self.lock().epoch != frame.epoch
    }

    /// Hand a dequeued frame to `write` unless a flush has superseded it
    ///
    /// Returns `None` for a stale frame. The frame is completed either way.
    pub fn write_with<F>(&self, queued: QueuedFrame, write: F) -> Option<Result<()>>
    where
        F: FnOnce(&AudioFrame) -> Result<()>,
    {
        let gate = self.write_gate();
        let written = if self.is_stale(&queued) {
            None
        } else {
            Some(write(&queued.frame))
        };
        drop(gate);

        self.complete(queued);
        written
    }

    /// Drop every pending frame atomically, returning how many were dropped
    ///
    /// Waits for a device write already in progress.
    pub fn flush(&self) -> usize {
        let _gate = self.write_gate();
        let mut state = self.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        state.epoch += 1;
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Nothing pending and nothing being written to the device
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.frames.is_empty() && state.in_flight == 0
    }

    /// Remove and return all pending frames without playing them
    pub fn drain(&self) -> Vec<AudioFrame> {
        self.lock().frames.drain(..).collect()
    }
}

/// Run the playback consumer until `stop` is set
///
/// Returns the number of frames written. The output device is closed on every
/// exit path.
pub fn run_playback(
    queue: Arc<PlaybackQueue>,
    mut output: Box<dyn AudioOutput>,
    stop: Arc<AtomicBool>,
) -> Result<usize> {
    info!("Playback consumer started");

    let mut played = 0usize;
    let mut result = Ok(());

    while !stop.load(Ordering::SeqCst) {
        let Some(queued) = queue.dequeue_timeout(DEQUEUE_TIMEOUT) else {
            continue;
        };

        let written = queue.write_with(queued, |frame| {
            if frame.is_empty() {
                Ok(())
            } else {
                output.write(frame)
            }
        });

        match written {
            None => debug!("Dropping frame flushed while in flight"),
            Some(Ok(())) => played += 1,
            Some(Err(e)) => {
                error!("Playback error: {}", e);
                result = Err(e);
                break;
            }
        }
    }

    if let Err(e) = output.close() {
        error!("Failed to close output device: {}", e);
    }

    info!("Playback consumer stopped ({} frames played)", played);

    result.map(|()| played)
}

/// Start the playback consumer on the blocking thread pool
pub fn spawn_playback(
    queue: Arc<PlaybackQueue>,
    output: Box<dyn AudioOutput>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<Result<usize>> {
    tokio::task::spawn_blocking(move || run_playback(queue, output, stop))
}
