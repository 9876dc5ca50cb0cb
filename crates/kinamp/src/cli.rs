use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kinamp", version, about = "Play a playlist of local audio files")]
pub struct Args {
    /// Playlist file (one path per line) or music folder. Without it the saved playlist is resumed.
    pub playlist: Option<PathBuf>,

    /// Loop the playlist
    #[arg(long, conflicts_with = "shuffle")]
    pub repeat: bool,

    /// Pick tracks at random
    #[arg(long)]
    pub shuffle: bool,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Named pipe between decoder and renderer
    #[arg(long, default_value = kinamp_player::config::DEFAULT_PIPE_PATH)]
    pub pipe: PathBuf,

    /// Render buffer target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Discard audio instead of opening a device (paced in real time)
    #[arg(long)]
    pub null_output: bool,

    /// Directory holding the saved playlist and config (default: $HOME)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Do not save playlist/position on exit
    #[arg(long)]
    pub no_save: bool,
}
