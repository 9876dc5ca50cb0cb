use std::path::PathBuf;

use kinamp_player::config::{PlaybackConfig, PlayerConfig};
use kinamp_player::navigator::PlaybackStrategy;
use kinamp_player::persist::StateStore;

use crate::cli::Args;

/// Where the first playlist comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaylistSource {
    /// A playlist file or music folder named on the command line; playback starts at its first track.
    Explicit(PathBuf),
    /// The saved playlist, resumed at the saved index.
    Saved,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub player: PlayerConfig,
    pub source: PlaylistSource,
    /// Strategy forced by `--repeat`/`--shuffle`.
    pub strategy_override: Option<PlaybackStrategy>,
    pub store: StateStore,
    pub save_on_exit: bool,
    pub null_output: bool,
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Self {
        let strategy_override = if args.shuffle {
            Some(PlaybackStrategy::Shuffled)
        } else if args.repeat {
            Some(PlaybackStrategy::Looping)
        } else {
            None
        };
        let source = match &args.playlist {
            Some(path) => PlaylistSource::Explicit(path.clone()),
            None => PlaylistSource::Saved,
        };
        let store = match &args.state_dir {
            Some(dir) => StateStore::new(dir.clone()),
            None => StateStore::in_home(),
        };

        Self {
            player: PlayerConfig {
                pipe_path: args.pipe.clone(),
                device: normalize_device_name(args.device.clone()),
                playback: PlaybackConfig {
                    buffer_seconds: args.buffer_seconds,
                    refill_max_frames: args.refill_max_frames,
                    ..PlaybackConfig::default()
                },
            },
            source,
            strategy_override,
            store,
            save_on_exit: !args.no_save,
            null_output: args.null_output,
        }
    }
}

fn normalize_device_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(argv: &[&str]) -> RunConfig {
        RunConfig::from_args(&Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn flags_map_to_strategy_override() {
        assert_eq!(config(&["kinamp"]).strategy_override, None);
        assert_eq!(
            config(&["kinamp", "--repeat"]).strategy_override,
            Some(PlaybackStrategy::Looping)
        );
        assert_eq!(
            config(&["kinamp", "--shuffle"]).strategy_override,
            Some(PlaybackStrategy::Shuffled)
        );
    }

    #[test]
    fn positional_playlist_is_explicit_source() {
        let cfg = config(&["kinamp", "list.m3u"]);
        assert_eq!(cfg.source, PlaylistSource::Explicit(PathBuf::from("list.m3u")));
        assert_eq!(config(&["kinamp"]).source, PlaylistSource::Saved);
    }

    #[test]
    fn playback_knobs_and_state_dir_are_carried() {
        let cfg = config(&[
            "kinamp",
            "--buffer-seconds",
            "0.5",
            "--refill-max-frames",
            "512",
            "--state-dir",
            "/srv/state",
            "--no-save",
            "--device",
            "  ",
        ]);
        assert_eq!(cfg.player.playback.buffer_seconds, 0.5);
        assert_eq!(cfg.player.playback.refill_max_frames, 512);
        assert_eq!(cfg.player.playback.decode_chunk_samples, 4096);
        assert_eq!(cfg.store.config_path(), PathBuf::from("/srv/state/.kinamp.conf"));
        assert!(!cfg.save_on_exit);
        assert!(cfg.player.device.is_none());
    }
}
