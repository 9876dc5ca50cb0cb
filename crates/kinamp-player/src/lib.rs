//! Single-track audio player backend.
//!
//! A decode thread turns one file at a time into fixed-format PCM and writes it into a
//! named pipe; a render pipeline reads the pipe, buffers it and plays it on an output
//! device. [`session::Session`] ties both into one lifecycle and [`navigator`] picks the
//! next track.

pub mod config;
pub mod decode;
pub mod device;
pub mod fifo;
pub mod navigator;
pub mod output;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod resample;
pub mod session;
pub mod status;

/// Sample rate of the PCM stream carried by the pipe.
pub const PCM_RATE_HZ: u32 = 44_100;
/// Channel count of the PCM stream carried by the pipe.
pub const PCM_CHANNELS: usize = 2;
/// Bytes per interleaved frame (`i16` little-endian, stereo).
pub const PCM_BYTES_PER_FRAME: usize = PCM_CHANNELS * 2;
