//! Pipe source: raw PCM from the FIFO into the buffering queue.
//!
//! The thread blocks in `open()` until a decoder opens the write side, then reads
//! `i16` little-endian stereo at 44.1 kHz, converts to `f32`, resamples to the sink rate
//! when they differ, and pushes into the queue. End of data (all writers closed) closes the
//! queue; once the sink has drained it, `EndOfStream` is posted.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::fifo::PipeChannel;
use crate::pipeline::bus::{BusWatch, MessageKind};
use crate::queue::{self, PcmQueue};
use crate::resample::StreamResampler;
use crate::{PCM_BYTES_PER_FRAME, PCM_CHANNELS, PCM_RATE_HZ};

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Grace period after the queue drains so the device plays out its own buffer.
const DRAIN_TAIL: Duration = Duration::from_millis(100);

pub struct PipeSource {
    pub channel: Arc<PipeChannel>,
    pub buffer: Arc<PcmQueue>,
    pub cancel: Arc<AtomicBool>,
    pub watch: BusWatch,
    /// Rate the sink consumes at.
    pub out_rate: u32,
    pub resample_chunk_frames: usize,
}

/// How the read loop ended.
#[derive(Debug, PartialEq, Eq)]
enum ReadEnd {
    WriterClosed,
    Cancelled,
}

impl PipeSource {
    pub fn spawn(self) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("kinamp-pipe-source".to_string())
            .spawn(move || self.run())
            .context("spawn pipe source thread")
    }

    fn run(self) {
        let generation = self.watch.generation();
        match self.pump() {
            Ok(ReadEnd::Cancelled) => {
                tracing::debug!(generation, "pipe source cancelled");
            }
            Ok(ReadEnd::WriterClosed) => {
                if !queue::wait_until_done_and_empty_or_cancel(&self.buffer, &self.cancel) {
                    tracing::debug!(generation, "pipe source cancelled while draining");
                    return;
                }
                thread::sleep(DRAIN_TAIL);
                if self.cancel.load(Ordering::Relaxed) {
                    return;
                }
                tracing::info!(generation, "end of stream");
                self.watch.post(MessageKind::EndOfStream);
            }
            Err(e) => {
                self.buffer.close();
                if self.cancel.load(Ordering::Relaxed) {
                    tracing::debug!(generation, "pipe source error after cancel: {e:#}");
                    return;
                }
                tracing::error!(generation, "pipe source error: {e:#}");
                self.watch.post(MessageKind::Error(format!("{e:#}")));
            }
        }
    }

    /// Read until the writer closes or the pipeline is cancelled.
    fn pump(&self) -> Result<ReadEnd> {
        let mut pipe = self.channel.open_reader()?;
        if self.cancel.load(Ordering::Relaxed) {
            return Ok(ReadEnd::Cancelled);
        }

        let mut resampler = if self.out_rate == PCM_RATE_HZ {
            None
        } else {
            tracing::info!(from_hz = PCM_RATE_HZ, to_hz = self.out_rate, "resampling");
            Some(StreamResampler::new(
                PCM_RATE_HZ,
                self.out_rate,
                PCM_CHANNELS,
                self.resample_chunk_frames,
            )?)
        };

        let mut decoder = FrameDecoder::default();
        let mut bytes = vec![0u8; READ_CHUNK_BYTES];
        let mut samples = Vec::new();
        let mut resampled = Vec::new();

        loop {
            let n = match pipe.read(&mut bytes) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read pcm from pipe"),
            };
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(ReadEnd::Cancelled);
            }

            samples.clear();
            decoder.decode(&bytes[..n], &mut samples);
            if !self.push(&mut resampler, &samples, &mut resampled)? {
                return Ok(ReadEnd::Cancelled);
            }
        }

        if let Some(rs) = resampler.as_mut() {
            resampled.clear();
            rs.flush(&mut resampled)?;
            if !self.buffer.push_interleaved_blocking(&resampled) {
                return Ok(ReadEnd::Cancelled);
            }
        }
        if decoder.pending() > 0 {
            tracing::debug!(bytes = decoder.pending(), "dropping partial frame at end of stream");
        }
        self.buffer.drop_partial_frame();
        self.buffer.close();
        Ok(ReadEnd::WriterClosed)
    }

    /// Returns `false` once the queue was closed under us.
    fn push(
        &self,
        resampler: &mut Option<StreamResampler>,
        samples: &[f32],
        scratch: &mut Vec<f32>,
    ) -> Result<bool> {
        match resampler {
            Some(rs) => {
                scratch.clear();
                rs.process(samples, scratch)?;
                Ok(self.buffer.push_interleaved_blocking(scratch))
            }
            None => Ok(self.buffer.push_interleaved_blocking(samples)),
        }
    }
}

/// `i16` LE byte stream to `f32`, carrying bytes of an incomplete frame between reads.
#[derive(Default)]
struct FrameDecoder {
    carry: Vec<u8>,
}

impl FrameDecoder {
    fn decode(&mut self, input: &[u8], out: &mut Vec<f32>) {
        let mut data = input;
        if !self.carry.is_empty() {
            let need = PCM_BYTES_PER_FRAME - self.carry.len();
            let take = need.min(data.len());
            self.carry.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.carry.len() < PCM_BYTES_PER_FRAME {
                return;
            }
            push_frames(&self.carry, out);
            self.carry.clear();
        }

        let whole = data.len() - data.len() % PCM_BYTES_PER_FRAME;
        push_frames(&data[..whole], out);
        self.carry.extend_from_slice(&data[whole..]);
    }

    fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn push_frames(bytes: &[u8], out: &mut Vec<f32>) {
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0),
    );
}
