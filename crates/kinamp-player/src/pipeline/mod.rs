//! Render pipeline controller.
//!
//! A pipeline build wires pipe source → [`PcmQueue`] → [`OutputStream`] and registers a
//! [`BusWatch`] for its messages. Shutdown is two-phase:
//! - [`RenderPipeline::teardown`] silences the watch, cancels every stage and drops the
//!   sink, which closes the pipe's read end once the source thread notices
//! - [`RenderPipeline::release`] joins the source thread and frees what is left
//!
//! The session stops the decoder between the two, so a decoder blocked in `write` is
//! released by the broken read side before anything waits on it.

pub mod bus;
pub mod source;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::config::PlaybackConfig;
use crate::fifo::PipeChannel;
use crate::output::{AudioOutput, OutputRequest, OutputStream};
use crate::queue::{PcmQueue, calc_max_buffered_samples};
use crate::{PCM_CHANNELS, PCM_RATE_HZ};
use bus::{Bus, BusWatch};
use source::PipeSource;

const RELEASE_POLL: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Absent,
    Playing,
    Paused,
}

/// Resources of one build.
struct Graph {
    watch: BusWatch,
    channel: Arc<PipeChannel>,
    buffer: Arc<PcmQueue>,
    cancel: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
    duration_ms: Arc<AtomicU64>,
    stream: Option<Box<dyn OutputStream>>,
    source: Option<thread::JoinHandle<()>>,
    rate: u32,
}

pub struct RenderPipeline {
    output: Arc<dyn AudioOutput>,
    playback: PlaybackConfig,
    state: PipelineState,
    graph: Option<Graph>,
}

impl RenderPipeline {
    pub fn new(output: Arc<dyn AudioOutput>, playback: PlaybackConfig) -> Self {
        Self {
            output,
            playback,
            state: PipelineState::Absent,
            graph: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Generation of the live build, if any.
    pub fn generation(&self) -> Option<u64> {
        match self.state {
            PipelineState::Absent => None,
            _ => self.graph.as_ref().map(|g| g.watch.generation()),
        }
    }

    /// Build a paused graph reading from `channel`.
    ///
    /// `duration_ms` is the cell the decoder fills once the source is probed. On error the
    /// controller stays [`PipelineState::Absent`].
    pub fn build(
        &mut self,
        channel: Arc<PipeChannel>,
        bus: &Bus,
        duration_ms: Arc<AtomicU64>,
    ) -> Result<()> {
        if self.graph.is_some() {
            self.teardown();
            self.release();
        }

        let watch = bus.watch();
        let buffer = Arc::new(PcmQueue::new(
            PCM_CHANNELS,
            calc_max_buffered_samples(PCM_RATE_HZ, PCM_CHANNELS, self.playback.buffer_seconds),
        ));
        let cancel = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(true));
        let played_frames = Arc::new(AtomicU64::new(0));

        let stream = self.output.open(OutputRequest {
            preferred_rate: PCM_RATE_HZ,
            buffer: buffer.clone(),
            paused: paused.clone(),
            played_frames: played_frames.clone(),
            refill_max_frames: self.playback.refill_max_frames,
            errors: watch.clone(),
        });
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                watch.remove();
                return Err(e.context("open audio output"));
            }
        };
        let rate = stream.sample_rate();
        if rate == 0 {
            watch.remove();
            return Err(anyhow!("audio output reported a zero sample rate"));
        }

        let source = PipeSource {
            channel: channel.clone(),
            buffer: buffer.clone(),
            cancel: cancel.clone(),
            watch: watch.clone(),
            out_rate: rate,
            resample_chunk_frames: self.playback.resample_chunk_frames,
        }
        .spawn();
        let source = match source {
            Ok(h) => h,
            Err(e) => {
                watch.remove();
                return Err(e);
            }
        };

        tracing::info!(generation = watch.generation(), rate_hz = rate, "pipeline built");
        self.graph = Some(Graph {
            watch,
            channel,
            buffer,
            cancel,
            paused,
            played_frames,
            duration_ms,
            stream: Some(stream),
            source: Some(source),
            rate,
        });
        self.state = PipelineState::Paused;
        Ok(())
    }

    /// Start rendering. Fails only when the sink refuses to start.
    pub fn play(&mut self) -> Result<()> {
        if self.state == PipelineState::Absent {
            return Ok(());
        }
        let Some(graph) = self.graph.as_mut() else {
            return Ok(());
        };
        graph.paused.store(false, Ordering::Relaxed);
        if let Some(stream) = graph.stream.as_mut() {
            stream.play()?;
        }
        self.state = PipelineState::Playing;
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == PipelineState::Absent {
            return;
        }
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        graph.paused.store(true, Ordering::Relaxed);
        if let Some(stream) = graph.stream.as_mut() {
            if let Err(e) = stream.pause() {
                tracing::warn!("pause output stream: {e:#}");
            }
        }
        self.state = PipelineState::Paused;
    }

    pub fn resume(&mut self) {
        if self.state != PipelineState::Paused {
            return;
        }
        if let Err(e) = self.play() {
            tracing::warn!("resume output stream: {e:#}");
        }
    }

    /// Drive the graph to its null state. Idempotent; does not wait for threads.
    pub fn teardown(&mut self) {
        let Some(graph) = self.graph.as_mut() else {
            self.state = PipelineState::Absent;
            return;
        };
        if self.state != PipelineState::Absent {
            tracing::debug!(generation = graph.watch.generation(), "pipeline teardown");
        }
        graph.watch.remove();
        graph.cancel.store(true, Ordering::Relaxed);
        graph.paused.store(true, Ordering::Relaxed);
        graph.buffer.close();
        graph.stream.take();
        graph.channel.wake_reader();
        self.state = PipelineState::Absent;
    }

    /// Join the source thread and drop the graph. Tears down first if needed.
    pub fn release(&mut self) {
        self.teardown();
        let Some(mut graph) = self.graph.take() else {
            return;
        };
        if let Some(handle) = graph.source.take() {
            while !handle.is_finished() {
                graph.channel.wake_reader();
                thread::sleep(RELEASE_POLL);
            }
            if handle.join().is_err() {
                tracing::error!("pipe source thread panicked");
            }
        }
    }

    /// Rendered time, zero without a live graph.
    pub fn position(&self) -> Duration {
        match (&self.graph, self.state) {
            (Some(g), PipelineState::Playing | PipelineState::Paused) => {
                let frames = g.played_frames.load(Ordering::Relaxed);
                Duration::from_secs_f64(frames as f64 / g.rate as f64)
            }
            _ => Duration::ZERO,
        }
    }

    /// Probed track length, zero while unknown or without a live graph.
    pub fn duration(&self) -> Duration {
        match (&self.graph, self.state) {
            (Some(g), PipelineState::Playing | PipelineState::Paused) => {
                Duration::from_millis(g.duration_ms.load(Ordering::Relaxed))
            }
            _ => Duration::ZERO,
        }
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;

    struct RefusingOutput;

    impl AudioOutput for RefusingOutput {
        fn open(&self, _req: OutputRequest) -> Result<Box<dyn OutputStream>> {
            Err(anyhow!("no device"))
        }
    }

    fn temp_fifo(name: &str) -> Arc<PipeChannel> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("kinamp-pipeline-{name}-{nanos}"));
        Arc::new(PipeChannel::create(path).unwrap())
    }

    #[test]
    fn build_failure_leaves_pipeline_absent() {
        let bus = Bus::new();
        let mut p = RenderPipeline::new(Arc::new(RefusingOutput), PlaybackConfig::default());
        let err = p.build(temp_fifo("refuse"), &bus, Arc::new(AtomicU64::new(0)));
        assert!(err.is_err());
        assert_eq!(p.state(), PipelineState::Absent);
        assert_eq!(p.position(), Duration::ZERO);
    }

    #[test]
    fn build_play_pause_teardown_cycle() {
        let bus = Bus::new();
        let mut p = RenderPipeline::new(Arc::new(NullOutput::new()), PlaybackConfig::default());
        p.build(temp_fifo("cycle"), &bus, Arc::new(AtomicU64::new(1500)))
            .unwrap();
        assert_eq!(p.state(), PipelineState::Paused);
        p.play().unwrap();
        assert_eq!(p.state(), PipelineState::Playing);
        assert_eq!(p.duration(), Duration::from_millis(1500));
        p.pause();
        assert_eq!(p.state(), PipelineState::Paused);
        p.resume();
        assert_eq!(p.state(), PipelineState::Playing);

        p.teardown();
        p.teardown();
        assert_eq!(p.state(), PipelineState::Absent);
        assert_eq!(p.duration(), Duration::ZERO);
        p.release();
        assert!(bus.receiver().try_recv().is_err());
    }

    #[test]
    fn pause_and_play_are_noops_when_absent() {
        let mut p = RenderPipeline::new(Arc::new(NullOutput::new()), PlaybackConfig::default());
        p.pause();
        p.resume();
        p.play().unwrap();
        assert_eq!(p.state(), PipelineState::Absent);
    }
}
