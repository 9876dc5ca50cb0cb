//! Buffering stage between the pipe source and the audio sink.
//!
//! [`PcmQueue`] carries interleaved `f32` samples:
//! - pipe source thread → queue (blocking push, bounded)
//! - sink drains the queue (non-blocking from a real-time callback)
//!
//! `close()` is the shutdown signal in both directions: the producer closes it at
//! end-of-stream, and teardown closes it to release a producer blocked on a full queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// The `done` flag lives under the same mutex as the samples so a consumer can never
/// miss the transition between "empty" and "empty and finished".
pub struct PcmQueue {
    channels: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct QueueInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Queue capacity in **samples** for `seconds` of audio at `rate_hz`.
///
/// Non-finite or non-positive `buffer_seconds` falls back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl PcmQueue {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        Self {
            channels,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buffered frames right now (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.inner.lock().queue.len() / self.channels
    }

    /// Mark the queue finished and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.inner.lock().done = true;
        self.cv.notify_all();
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before every sample was accepted; the
    /// rest are dropped.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.inner.lock();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                self.cv.wait(&mut g);
            }
            if g.done {
                return false;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop up to `max_frames` whole interleaved frames without blocking.
    ///
    /// Returns `None` when no whole frame is buffered.
    pub fn try_pop(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock();

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait up to `timeout` for at least one frame to be buffered.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let mut g = self.inner.lock();
        if g.queue.len() >= self.channels {
            return true;
        }
        if !g.done {
            let _ = self.cv.wait_for(&mut g, timeout);
        }
        g.queue.len() >= self.channels
    }

    /// Discard any partial trailing frame so a closed queue can report drained.
    pub fn drop_partial_frame(&self) {
        let mut g = self.inner.lock();
        let extra = g.queue.len() % self.channels;
        for _ in 0..extra {
            g.queue.pop_back();
        }
        drop(g);
        self.cv.notify_all();
    }
}

/// Block until `q` is closed and drained, or `cancel` becomes true.
///
/// Returns `true` if the queue drained normally, `false` if cancelled.
pub fn wait_until_done_and_empty_or_cancel(q: &PcmQueue, cancel: &AtomicBool) -> bool {
    let mut g = q.inner.lock();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if g.done && g.queue.is_empty() {
            return true;
        }
        let _ = q.cv.wait_for(&mut g, Duration::from_millis(50));
    }
}
