use std::path::PathBuf;

/// Default location of the pipe shared by the decoder and the render pipeline.
pub const DEFAULT_PIPE_PATH: &str = "/tmp/kinamp_audio_pipe";

/// Playback tuning parameters shared by decode/resample/output stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Samples (not frames) the decoder writes into the pipe per write call.
    pub decode_chunk_samples: usize,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target duration held by the buffering stage between pipe and sink.
    pub buffer_seconds: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            decode_chunk_samples: 4096,
            resample_chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
        }
    }
}

/// Everything a [`crate::session::Session`] needs at construction.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Filesystem path of the named pipe.
    pub pipe_path: PathBuf,
    /// Output device substring match; `None` picks the host default.
    pub device: Option<String>,
    pub playback: PlaybackConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            pipe_path: PathBuf::from(DEFAULT_PIPE_PATH),
            device: None,
            playback: PlaybackConfig::default(),
        }
    }
}
