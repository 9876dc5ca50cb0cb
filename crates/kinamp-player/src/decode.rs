//! Decode stage.
//!
//! [`Decoder`] owns at most one background job. The job uses Symphonia to:
//! - probe the input container/codec
//! - decode packets into interleaved `f32`
//! - map channels to stereo and resample to 44.1 kHz when needed
//! - quantize to `i16` little-endian and write bounded chunks into the pipe
//!
//! The decoder knows nothing about playback state. A stop sets the job's stop flag and
//! joins it; the render pipeline is expected to have closed the pipe's read end first,
//! so a job blocked in `write` wakes up with `BrokenPipe`.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::fifo::PipeChannel;
use crate::resample::StreamResampler;
use crate::{PCM_CHANNELS, PCM_RATE_HZ};

const STOP_POLL: Duration = Duration::from_millis(2);

/// Decoder knobs taken from [`crate::config::PlaybackConfig`].
#[derive(Clone, Copy, Debug)]
pub struct DecodeConfig {
    /// Samples per pipe write (rounded down to whole stereo frames).
    pub chunk_samples: usize,
    /// Resampler input chunk in frames.
    pub resample_chunk_frames: usize,
}

/// The job currently decoding, if any.
struct DecodeJob {
    track: PathBuf,
    stop: Arc<AtomicBool>,
    channel: Arc<PipeChannel>,
    handle: thread::JoinHandle<()>,
}

/// Owner of the single decode worker.
pub struct Decoder {
    cfg: DecodeConfig,
    job: Option<DecodeJob>,
}

impl Decoder {
    pub fn new(cfg: DecodeConfig) -> Self {
        Self { cfg, job: None }
    }

    /// Spawn a worker decoding `track` into `channel`.
    ///
    /// Any previous job is stopped and joined first. `duration_ms` receives the probed
    /// track length (0 when the container does not say).
    pub fn start(
        &mut self,
        track: &Path,
        channel: Arc<PipeChannel>,
        duration_ms: Arc<AtomicU64>,
    ) -> Result<()> {
        self.stop();

        let stop = Arc::new(AtomicBool::new(false));
        let track_for_thread = track.to_path_buf();
        let channel_for_thread = channel.clone();
        let stop_for_thread = stop.clone();
        let cfg = self.cfg;

        let handle = thread::Builder::new()
            .name("kinamp-decode".to_string())
            .spawn(move || {
                tracing::info!(path = %track_for_thread.display(), "decoder starting");
                match decode_into_pipe(
                    &track_for_thread,
                    &channel_for_thread,
                    &stop_for_thread,
                    &duration_ms,
                    cfg,
                ) {
                    Ok(()) => tracing::info!("decoder thread exiting"),
                    Err(e) => tracing::error!(
                        path = %track_for_thread.display(),
                        "decoder thread error: {e:#}"
                    ),
                }
            })
            .context("spawn decoder thread")?;

        self.job = Some(DecodeJob {
            track: track.to_path_buf(),
            stop,
            channel,
            handle,
        });
        Ok(())
    }

    /// Request cancellation and block until the worker has exited. No-op without a job.
    ///
    /// While waiting, the pipe's write side is nudged so a worker still blocked in
    /// `open` returns and sees the stop flag.
    pub fn stop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        job.stop.store(true, Ordering::Relaxed);
        while !job.handle.is_finished() {
            job.channel.wake_writer();
            thread::sleep(STOP_POLL);
        }
        if job.handle.join().is_err() {
            tracing::error!(path = %job.track.display(), "decoder thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.job.as_ref().is_some_and(|job| !job.handle.is_finished())
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opened and probed source ready to produce interleaved `f32` blocks.
struct SourceStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
}

impl SourceStream {
    fn open(path: &Path) -> Result<(Self, Option<u64>)> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .with_context(|| format!("probe {:?}", path))?;
        let format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("make codec decoder")?;

        let duration_ms = duration_ms_from_codec_params(&codec_params);
        Ok((
            Self {
                format,
                decoder,
                track_id,
                sample_rate,
                channels,
            },
            duration_ms,
        ))
    }

    /// Next decoded block as interleaved `f32` in source layout; `None` at end of stream.
    fn next_block(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(anyhow!("read packet: {e}")),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(anyhow!("decode packet: {e}")),
            };

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            return Ok(Some(sample_buf.samples().to_vec()));
        }
    }
}

/// Outcome of one pipe write.
#[derive(Debug, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    ReaderGone,
}

/// Worker body: open, probe, then stream PCM until EOF, stop, or reader gone.
fn decode_into_pipe(
    track: &Path,
    channel: &PipeChannel,
    stop: &AtomicBool,
    duration_ms: &AtomicU64,
    cfg: DecodeConfig,
) -> Result<()> {
    let (mut source, duration) = SourceStream::open(track)?;
    duration_ms.store(duration.unwrap_or(0), Ordering::Relaxed);
    tracing::info!(
        channels = source.channels,
        rate_hz = source.sample_rate,
        duration_ms = ?duration,
        "source (local file)"
    );

    if stop.load(Ordering::Relaxed) {
        return Ok(());
    }
    let mut pipe = channel.open_writer()?;
    if stop.load(Ordering::Relaxed) {
        return Ok(());
    }

    let mut resampler = if source.sample_rate == PCM_RATE_HZ {
        None
    } else {
        tracing::info!(from_hz = source.sample_rate, to_hz = PCM_RATE_HZ, "resampling");
        Some(StreamResampler::new(
            source.sample_rate,
            PCM_RATE_HZ,
            PCM_CHANNELS,
            cfg.resample_chunk_frames,
        )?)
    };

    let chunk_samples = (cfg.chunk_samples / PCM_CHANNELS).max(1) * PCM_CHANNELS;
    let mut stereo = Vec::new();
    let mut resampled = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        let Some(block) = source.next_block()? else {
            break;
        };

        stereo.clear();
        map_to_stereo(&block, source.channels, &mut stereo);
        let out = match resampler.as_mut() {
            Some(rs) => {
                resampled.clear();
                rs.process(&stereo, &mut resampled)?;
                &resampled
            }
            None => &stereo,
        };

        if write_pcm(&mut pipe, out, chunk_samples)? == WriteOutcome::ReaderGone {
            return Ok(());
        }
    }

    if stop.load(Ordering::Relaxed) {
        return Ok(());
    }
    if let Some(rs) = resampler.as_mut() {
        resampled.clear();
        rs.flush(&mut resampled)?;
        write_pcm(&mut pipe, &resampled, chunk_samples)?;
    }
    Ok(())
}

/// Write `samples` as `i16` LE in chunks of at most `chunk_samples`.
///
/// A closed reader is the normal end of a deliberate stop and is reported as
/// [`WriteOutcome::ReaderGone`], not as an error.
fn write_pcm<W: Write>(pipe: &mut W, samples: &[f32], chunk_samples: usize) -> Result<WriteOutcome> {
    let mut bytes = Vec::with_capacity(chunk_samples * 2);
    for chunk in samples.chunks(chunk_samples.max(1)) {
        bytes.clear();
        for &s in chunk {
            bytes.extend_from_slice(&f32_to_i16(s).to_le_bytes());
        }
        match pipe.write_all(&bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!("pipe reader closed; decoder stopping");
                return Ok(WriteOutcome::ReaderGone);
            }
            Err(e) => return Err(e).context("write pcm to pipe"),
        }
    }
    Ok(WriteOutcome::Written)
}

/// Append `input` (interleaved, `channels` wide) to `out` as interleaved stereo.
///
/// Mono is duplicated; wider layouts keep their first two channels.
fn map_to_stereo(input: &[f32], channels: usize, out: &mut Vec<f32>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(input.len() * 2);
            for &s in input {
                out.push(s);
                out.push(s);
            }
        }
        2 => out.extend_from_slice(input),
        n => {
            out.reserve(input.len() / n * 2);
            for frame in input.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingPipe;

    impl Write for FailingPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(44_100);
        params.n_frames = Some(88_200);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn map_to_stereo_duplicates_mono() {
        let mut out = Vec::new();
        map_to_stereo(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn map_to_stereo_keeps_front_pair_of_wide_layouts() {
        let mut out = Vec::new();
        map_to_stereo(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn f32_to_i16_clamps_and_scales() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(4.0), i16::MAX);
        assert_eq!(f32_to_i16(-4.0), -i16::MAX);
    }

    #[test]
    fn write_pcm_emits_little_endian_in_bounded_chunks() {
        let mut sink: Vec<u8> = Vec::new();
        let outcome = write_pcm(&mut sink, &[1.0, -1.0, 0.0, 0.0, 1.0], 4).unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(sink.len(), 10);
        assert_eq!(&sink[..4], &[0xff, 0x7f, 0x01, 0x80]);
    }

    #[test]
    fn write_pcm_treats_broken_pipe_as_reader_gone() {
        let outcome = write_pcm(&mut ClosedPipe, &[0.0; 8], 4).unwrap();
        assert_eq!(outcome, WriteOutcome::ReaderGone);
    }

    #[test]
    fn write_pcm_propagates_other_errors() {
        assert!(write_pcm(&mut FailingPipe, &[0.0; 8], 4).is_err());
    }

    #[test]
    fn stop_without_job_is_noop() {
        let mut decoder = Decoder::new(DecodeConfig {
            chunk_samples: 4096,
            resample_chunk_frames: 1024,
        });
        decoder.stop();
        assert!(!decoder.is_running());
    }
}
