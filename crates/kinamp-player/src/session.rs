//! Playback session: one decoder and one render pipeline run as a single lifecycle.
//!
//! The session is the only thing that starts or stops either half. Every transition
//! happens under one lock; the lifecycle flags live in [`SessionStatus`] so other threads
//! can observe them (notably the Stopping guard) without waiting for that lock.
//!
//! Pipeline messages are not handled on pipeline threads. The owner's event loop takes
//! them from [`Session::messages`] and hands them back through [`Session::dispatch`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::config::PlayerConfig;
use crate::decode::{DecodeConfig, Decoder};
use crate::fifo::PipeChannel;
use crate::output::{AudioOutput, CpalOutput};
use crate::pipeline::RenderPipeline;
use crate::pipeline::bus::{Bus, BusMessage, MessageKind};
use crate::status::{SessionState, SessionStatus};

/// Observer invoked with the finished track's path after a genuine end of stream.
pub type CompletionCallback = Box<dyn FnMut(&Path) + Send>;

struct Inner {
    pipe: Option<Arc<PipeChannel>>,
    pipeline: RenderPipeline,
    decoder: Decoder,
    current: Option<PathBuf>,
}

pub struct Session {
    config: PlayerConfig,
    status: SessionStatus,
    bus: Bus,
    inner: Mutex<Inner>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Session {
    /// Create a session rendering through `output`.
    ///
    /// The pipe is created here. If that fails the error is logged and creation is retried
    /// by the next [`Session::play`].
    pub fn new(config: PlayerConfig, output: Arc<dyn AudioOutput>) -> Self {
        let pipe = match PipeChannel::create(&config.pipe_path) {
            Ok(p) => Some(Arc::new(p)),
            Err(e) => {
                tracing::error!(path = %config.pipe_path.display(), "create pipe: {e:#}");
                None
            }
        };
        let decoder = Decoder::new(DecodeConfig {
            chunk_samples: config.playback.decode_chunk_samples,
            resample_chunk_frames: config.playback.resample_chunk_frames,
        });
        let pipeline = RenderPipeline::new(output, config.playback.clone());

        Self {
            config,
            status: SessionStatus::new(),
            bus: Bus::new(),
            inner: Mutex::new(Inner {
                pipe,
                pipeline,
                decoder,
                current: None,
            }),
            on_complete: Mutex::new(None),
        }
    }

    /// Session rendering to the CPAL device named by `config.device`.
    pub fn with_device_output(config: PlayerConfig) -> Self {
        let output = Arc::new(CpalOutput::new(config.device.clone()));
        Self::new(config, output)
    }

    /// Start playing `path`, stopping whatever played before.
    ///
    /// Rejected while a stop is in flight. Returns `false` if the pipeline could not be
    /// built or started; the session is Idle afterwards.
    pub fn play(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.status.is_stopping() {
            tracing::warn!(path = %path.display(), "play rejected: stop in progress");
            return false;
        }

        let mut inner = self.inner.lock();
        if self.status.state() != SessionState::Idle {
            self.stop_locked(&mut inner);
        }

        let channel = match self.ensure_pipe(&mut inner) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(path = %self.config.pipe_path.display(), "create pipe: {e:#}");
                return false;
            }
        };

        self.status.set_playing();
        inner.current = Some(path.to_path_buf());

        let duration_ms = Arc::new(AtomicU64::new(0));
        if let Err(e) = inner
            .pipeline
            .build(channel.clone(), &self.bus, duration_ms.clone())
        {
            tracing::error!(path = %path.display(), "build pipeline: {e:#}");
            inner.current = None;
            self.status.set_idle();
            return false;
        }
        if let Err(e) = inner.decoder.start(path, channel, duration_ms) {
            tracing::error!(path = %path.display(), "start decoder: {e:#}");
            self.stop_locked(&mut inner);
            return false;
        }
        if let Err(e) = inner.pipeline.play() {
            tracing::error!(path = %path.display(), "start pipeline: {e:#}");
            self.stop_locked(&mut inner);
            return false;
        }

        tracing::info!(path = %path.display(), "playing");
        true
    }

    /// Toggle between Playing and Paused. No-op in any other state.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        match self.status.state() {
            SessionState::Playing => {
                inner.pipeline.pause();
                self.status.set_paused(true);
                tracing::info!("paused");
            }
            SessionState::Paused => {
                inner.pipeline.resume();
                self.status.set_paused(false);
                tracing::info!("resumed");
            }
            SessionState::Idle | SessionState::Stopping => {}
        }
    }

    /// Stop playback and wait for the decoder to exit. Idempotent.
    pub fn stop(&self) {
        if self.status.is_stopping() {
            return;
        }
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    fn stop_locked(&self, inner: &mut Inner) {
        if !self.status.begin_stop() {
            return;
        }
        if let Some(path) = inner.current.take() {
            tracing::info!(path = %path.display(), "stopping");
        }
        // Read side first: a decoder blocked in write only wakes on a broken pipe.
        inner.pipeline.teardown();
        inner.decoder.stop();
        inner.pipeline.release();
        self.status.finish_stop();
    }

    fn ensure_pipe(&self, inner: &mut Inner) -> Result<Arc<PipeChannel>> {
        if let Some(pipe) = &inner.pipe {
            return Ok(pipe.clone());
        }
        let pipe = Arc::new(PipeChannel::create(&self.config.pipe_path)?);
        inner.pipe = Some(pipe.clone());
        Ok(pipe)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.status.is_stopping()
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Shared view of the lifecycle flags.
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    pub fn position(&self) -> Duration {
        self.inner.lock().pipeline.position()
    }

    pub fn duration(&self) -> Duration {
        self.inner.lock().pipeline.duration()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.lock().current.clone()
    }

    /// Register the end-of-stream observer, replacing any previous one.
    pub fn set_completion_callback(&self, f: impl FnMut(&Path) + Send + 'static) {
        *self.on_complete.lock() = Some(Box::new(f));
    }

    /// Pipeline messages for the owner's event loop.
    pub fn messages(&self) -> Receiver<BusMessage> {
        self.bus.receiver().clone()
    }

    /// Handle one pipeline message. Messages from torn-down pipelines are dropped.
    pub fn dispatch(&self, msg: BusMessage) {
        if self.status.is_stopping() {
            tracing::debug!(generation = msg.generation, "message during stop dropped");
            return;
        }

        let finished = {
            let mut inner = self.inner.lock();
            if inner.pipeline.generation() != Some(msg.generation) {
                tracing::debug!(generation = msg.generation, "stale pipeline message dropped");
                return;
            }
            let path = inner.current.clone();
            match &msg.kind {
                MessageKind::EndOfStream => {
                    tracing::info!(generation = msg.generation, "track finished");
                }
                MessageKind::Error(e) => {
                    tracing::error!(generation = msg.generation, "pipeline error: {e}");
                }
            }
            self.stop_locked(&mut inner);
            match msg.kind {
                MessageKind::EndOfStream => path,
                MessageKind::Error(_) => None,
            }
        };

        if let Some(path) = finished {
            self.notify_complete(&path);
        }
    }

    /// Dispatch every message already queued. Returns how many were taken.
    pub fn dispatch_pending(&self) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.bus.receiver().try_recv() {
            self.dispatch(msg);
            n += 1;
        }
        n
    }

    fn notify_complete(&self, path: &Path) {
        // Taken out so the observer may call back into the session.
        let mut cb = self.on_complete.lock().take();
        if let Some(f) = cb.as_mut() {
            f(path);
        }
        let mut slot = self.on_complete.lock();
        if slot.is_none() {
            *slot = cb;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;

    fn temp_config(name: &str) -> PlayerConfig {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PlayerConfig {
            pipe_path: std::env::temp_dir().join(format!("kinamp-session-{name}-{nanos}")),
            ..PlayerConfig::default()
        }
    }

    #[test]
    fn new_session_is_idle_with_pipe() {
        let cfg = temp_config("idle");
        let session = Session::new(cfg.clone(), Arc::new(NullOutput::new()));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_shutting_down());
        assert_eq!(session.position(), Duration::ZERO);
        assert_eq!(session.duration(), Duration::ZERO);
        assert!(session.current_path().is_none());
        assert!(cfg.pipe_path.exists());
        drop(session);
        assert!(!cfg.pipe_path.exists());
    }

    #[test]
    fn pause_and_stop_are_noops_when_idle() {
        let session = Session::new(temp_config("noop"), Arc::new(NullOutput::new()));
        session.pause();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn stale_messages_are_ignored() {
        let session = Session::new(temp_config("stale"), Arc::new(NullOutput::new()));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_cb = fired.clone();
        session.set_completion_callback(move |_| {
            fired_cb.store(true, std::sync::atomic::Ordering::Relaxed);
        });
        session.dispatch(BusMessage {
            generation: 999,
            kind: MessageKind::EndOfStream,
        });
        assert!(!fired.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(session.state(), SessionState::Idle);
    }
}
