//! Audio sinks.
//!
//! The render pipeline talks to its sink through [`AudioOutput`]; the real implementation
//! is [`CpalOutput`], and [`NullOutput`] drains the buffer without a sound card (tests,
//! headless runs). Every sink follows the same contract:
//! - pull interleaved `f32` frames from the request's [`PcmQueue`] without blocking the
//!   producer longer than a queue lock
//! - output silence and leave the queue untouched while `paused` is set
//! - add every frame handed to the device to `played_frames`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::device;
use crate::pipeline::bus::{BusWatch, MessageKind};
use crate::queue::PcmQueue;

/// Everything a sink needs to start consuming a pipeline buffer.
pub struct OutputRequest {
    /// Rate the sink should try to run at. The actual rate is reported by the stream.
    pub preferred_rate: u32,
    /// Interleaved samples at the stream's rate with `buffer.channels()` channels.
    pub buffer: Arc<PcmQueue>,
    pub paused: Arc<AtomicBool>,
    pub played_frames: Arc<AtomicU64>,
    /// Max frames taken from the buffer per refill.
    pub refill_max_frames: usize,
    /// Where fatal device errors are reported.
    pub errors: BusWatch,
}

/// Factory for output streams; one stream per pipeline build.
pub trait AudioOutput: Send + Sync {
    fn open(&self, req: OutputRequest) -> Result<Box<dyn OutputStream>>;
}

/// A running sink. Dropping it stops output and releases the device.
pub trait OutputStream: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    /// Frames per second the sink consumes from the buffer.
    fn sample_rate(&self) -> u32;
}

/// Sound card output through CPAL.
#[derive(Clone, Debug, Default)]
pub struct CpalOutput {
    /// Output device name substring; `None` picks the host default.
    pub device: Option<String>,
}

impl CpalOutput {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

enum StreamCommand {
    Play(Sender<Result<()>>),
    Pause(Sender<Result<()>>),
    Close,
}

/// Handle to a CPAL stream living on its own thread (CPAL streams are not `Send`).
struct CpalStream {
    rate: u32,
    cmd_tx: Sender<StreamCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AudioOutput for CpalOutput {
    fn open(&self, req: OutputRequest) -> Result<Box<dyn OutputStream>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<StreamCommand>();
        let needle = self.device.clone();

        let handle = thread::Builder::new()
            .name("kinamp-output".to_string())
            .spawn(move || {
                let stream = match build_cpal_stream(needle.as_deref(), req) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                serve_stream_commands(&stream, &cmd_rx);
            })
            .context("spawn output thread")?;

        let rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(anyhow!("output thread exited before the stream was built"));
            }
        };

        Ok(Box::new(CpalStream {
            rate,
            cmd_tx,
            handle: Some(handle),
        }))
    }
}

impl CpalStream {
    fn request(&self, cmd: fn(Sender<Result<()>>) -> StreamCommand) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(cmd(reply_tx))
            .map_err(|_| anyhow!("output thread is gone"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("output thread is gone"))?
    }
}

impl OutputStream for CpalStream {
    fn play(&mut self) -> Result<()> {
        self.request(StreamCommand::Play)
    }

    fn pause(&mut self) -> Result<()> {
        self.request(StreamCommand::Pause)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(StreamCommand::Close);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
    }
}

fn serve_stream_commands(stream: &cpal::Stream, cmd_rx: &Receiver<StreamCommand>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            StreamCommand::Play(reply) => {
                let _ = reply.send(stream.play().context("start output stream"));
            }
            StreamCommand::Pause(reply) => {
                let _ = reply.send(stream.pause().context("pause output stream"));
            }
            StreamCommand::Close => break,
        }
    }
}

fn build_cpal_stream(needle: Option<&str>, req: OutputRequest) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, needle)?;
    let config = device::pick_output_config(&device, req.preferred_rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?config.sample_format(),
        "output stream"
    );

    let rate = stream_config.sample_rate;
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, req)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, req)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, req)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, req)?,
        other => return Err(anyhow!("Unsupported sample format: {other:?}")),
    };
    Ok((stream, rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    req: OutputRequest,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = config.channels as usize;
    let mut feeder = FrameFeeder::new(req.buffer.clone(), req.refill_max_frames);
    let paused = req.paused.clone();
    let played_frames = req.played_frames.clone();
    let errors = req.errors;
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let err_fn = move |err: cpal::StreamError| {
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            tracing::error!("output device lost: {err}");
            errors.post(MessageKind::Error(format!("output device lost: {err}")));
        } else {
            tracing::warn!("stream error: {err}");
        }
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }

            let mut filled = 0usize;
            for frame in data.chunks_exact_mut(channels_out) {
                if !feeder.ensure_frame() {
                    break;
                }
                for (ch, out) in frame.iter_mut().enumerate() {
                    *out = <T as cpal::Sample>::from_sample::<f32>(feeder.sample(ch, channels_out));
                }
                feeder.advance();
                filled += 1;
            }
            data[filled * channels_out..].fill(silence);

            if filled > 0 {
                played_frames.fetch_add(filled as u64, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Local refill buffer between a [`PcmQueue`] and a device callback.
struct FrameFeeder {
    queue: Arc<PcmQueue>,
    src_channels: usize,
    refill_max_frames: usize,
    src: Vec<f32>,
    pos: usize,
}

impl FrameFeeder {
    fn new(queue: Arc<PcmQueue>, refill_max_frames: usize) -> Self {
        Self {
            src_channels: queue.channels().max(1),
            queue,
            refill_max_frames: refill_max_frames.max(1),
            src: Vec::new(),
            pos: 0,
        }
    }

    /// Make sure a full source frame is available; refill from the queue without blocking.
    fn ensure_frame(&mut self) -> bool {
        if self.pos + self.src_channels <= self.src.len() {
            return true;
        }
        self.pos = 0;
        self.src.clear();
        match self.queue.try_pop(self.refill_max_frames) {
            Some(v) => {
                self.src = v;
                self.src.len() >= self.src_channels
            }
            None => false,
        }
    }

    /// Output sample for `dst_ch` of a `dst_channels`-wide frame.
    ///
    /// Mono is duplicated, stereo to mono averages, wider outputs repeat the last source
    /// channel.
    fn sample(&self, dst_ch: usize, dst_channels: usize) -> f32 {
        let frame = &self.src[self.pos..self.pos + self.src_channels];
        match (self.src_channels, dst_channels) {
            (2, 1) => 0.5 * (frame[0] + frame[1]),
            (n, _) => frame[dst_ch.min(n - 1)],
        }
    }

    fn advance(&mut self) {
        self.pos += self.src_channels;
    }
}

/// Sink that consumes the buffer on a plain thread instead of a sound card.
#[derive(Clone, Debug)]
pub struct NullOutput {
    rate: u32,
    realtime: bool,
}

impl NullOutput {
    /// Drain as fast as the producer fills.
    pub fn new() -> Self {
        Self {
            rate: crate::PCM_RATE_HZ,
            realtime: false,
        }
    }

    /// Drain at `rate` frames per second, like a device would.
    pub fn realtime(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            realtime: true,
        }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

struct NullStream {
    rate: u32,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

const NULL_TICK: Duration = Duration::from_millis(10);

impl AudioOutput for NullOutput {
    fn open(&self, req: OutputRequest) -> Result<Box<dyn OutputStream>> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let rate = self.rate;
        let realtime = self.realtime;
        let frames_per_tick = ((rate as u64 * NULL_TICK.as_millis() as u64) / 1000).max(1) as usize;

        let handle = thread::Builder::new()
            .name("kinamp-null-output".to_string())
            .spawn(move || {
                let mut started = Instant::now();
                let mut consumed: u64 = 0;
                while !stop_thread.load(Ordering::Relaxed) {
                    if req.paused.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(2));
                        // Pacing restarts after a pause.
                        started = Instant::now();
                        consumed = 0;
                        continue;
                    }
                    let max_frames = if realtime {
                        frames_per_tick.min(req.refill_max_frames.max(1))
                    } else {
                        req.refill_max_frames.max(1)
                    };
                    if !req.buffer.wait_for_any(NULL_TICK) {
                        continue;
                    }
                    let Some(v) = req.buffer.try_pop(max_frames) else {
                        continue;
                    };
                    let frames = (v.len() / req.buffer.channels().max(1)) as u64;
                    req.played_frames.fetch_add(frames, Ordering::Relaxed);
                    consumed += frames;
                    if realtime {
                        let due = Duration::from_secs_f64(consumed as f64 / rate as f64);
                        if let Some(ahead) = due.checked_sub(started.elapsed()) {
                            thread::sleep(ahead);
                        }
                    }
                }
            })
            .context("spawn null output thread")?;

        Ok(Box::new(NullStream {
            rate,
            stop,
            handle: Some(handle),
        }))
    }
}

impl OutputStream for NullStream {
    fn play(&mut self) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::Bus;

    fn request(bus: &Bus, buffer: Arc<PcmQueue>) -> OutputRequest {
        OutputRequest {
            preferred_rate: 44_100,
            buffer,
            paused: Arc::new(AtomicBool::new(false)),
            played_frames: Arc::new(AtomicU64::new(0)),
            refill_max_frames: 64,
            errors: bus.watch(),
        }
    }

    fn filled_feeder(channels: usize, samples: &[f32]) -> FrameFeeder {
        let q = Arc::new(PcmQueue::new(channels, 1024));
        q.push_interleaved_blocking(samples);
        FrameFeeder::new(q, 16)
    }

    #[test]
    fn feeder_duplicates_mono_to_stereo() {
        let mut f = filled_feeder(1, &[0.25, 0.5]);
        assert!(f.ensure_frame());
        assert_eq!((f.sample(0, 2), f.sample(1, 2)), (0.25, 0.25));
        f.advance();
        assert!(f.ensure_frame());
        assert_eq!(f.sample(1, 2), 0.5);
        f.advance();
        assert!(!f.ensure_frame());
    }

    #[test]
    fn feeder_downmixes_stereo_to_mono() {
        let mut f = filled_feeder(2, &[1.0, 0.0]);
        assert!(f.ensure_frame());
        assert_eq!(f.sample(0, 1), 0.5);
    }

    #[test]
    fn feeder_repeats_last_channel_for_wider_outputs() {
        let mut f = filled_feeder(2, &[0.1, 0.2]);
        assert!(f.ensure_frame());
        assert_eq!(f.sample(3, 4), 0.2);
    }

    #[test]
    fn null_output_drains_and_counts_frames() {
        let bus = Bus::new();
        let buffer = Arc::new(PcmQueue::new(2, 4096));
        let req = request(&bus, buffer.clone());
        let played = req.played_frames.clone();
        let _stream = NullOutput::new().open(req).unwrap();

        buffer.push_interleaved_blocking(&[0.0; 200]);
        let deadline = Instant::now() + Duration::from_secs(2);
        while played.load(Ordering::Relaxed) < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(played.load(Ordering::Relaxed), 100);
        assert_eq!(buffer.len_frames(), 0);
    }

    #[test]
    fn null_output_leaves_buffer_alone_while_paused() {
        let bus = Bus::new();
        let buffer = Arc::new(PcmQueue::new(2, 4096));
        let req = request(&bus, buffer.clone());
        req.paused.store(true, Ordering::Relaxed);
        let played = req.played_frames.clone();
        let _stream = NullOutput::new().open(req).unwrap();

        buffer.push_interleaved_blocking(&[0.0; 200]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(played.load(Ordering::Relaxed), 0);
        assert_eq!(buffer.len_frames(), 100);
    }
}
