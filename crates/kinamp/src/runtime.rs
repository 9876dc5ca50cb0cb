//! Shell runtime: load the playlist, drive the session from one event loop, save state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};

use crate::config::{PlaylistSource, RunConfig};
use crate::cursor::PlaylistCursor;
use kinamp_player::navigator::PlaybackStrategy;
use kinamp_player::output::NullOutput;
use kinamp_player::persist;
use kinamp_player::session::Session;
use kinamp_player::status::SessionState;
use kinamp_player::{PCM_RATE_HZ, device};

const POSITION_TICK: Duration = Duration::from_secs(5);

/// Commands delivered to the event loop from outside it.
#[derive(Debug)]
enum LoopCommand {
    TrackFinished(PathBuf),
    Shutdown,
}

/// Print output device names to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for (i, name) in device::list_devices(&host)?.iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

/// Build the cursor the run starts from. Fails when no usable playlist exists.
pub fn load_cursor(cfg: &RunConfig) -> Result<PlaylistCursor> {
    let cursor = match &cfg.source {
        PlaylistSource::Explicit(path) => {
            let tracks = if path.is_dir() {
                persist::scan_directory(path)
                    .with_context(|| format!("could not scan music folder {:?}", path))?
            } else {
                persist::read_playlist(path)
                    .with_context(|| format!("could not load playlist {:?}", path))?
            };
            let strategy = cfg.strategy_override.unwrap_or_default();
            PlaylistCursor::new(tracks, strategy)
        }
        PlaylistSource::Saved => {
            let path = cfg.store.playlist_path();
            let tracks = persist::read_playlist(&path)
                .with_context(|| format!("could not load saved playlist {:?}", path))?;
            let (index, saved_strategy) = cfg.store.load_position();
            let strategy = cfg.strategy_override.unwrap_or(saved_strategy);
            PlaylistCursor::resume(tracks, index, strategy)
        }
    };
    if cursor.is_empty() {
        bail!("playlist is empty");
    }
    Ok(cursor)
}

/// Play through `cursor` until the playlist ends or Ctrl-C.
pub fn run(cfg: RunConfig, mut cursor: PlaylistCursor) -> Result<()> {
    let session = if cfg.null_output {
        Session::new(
            cfg.player.clone(),
            Arc::new(NullOutput::realtime(PCM_RATE_HZ)),
        )
    } else {
        Session::with_device_output(cfg.player.clone())
    };

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<LoopCommand>();
    install_ctrlc(cmd_tx.clone())?;
    {
        let cmd_tx = cmd_tx.clone();
        session.set_completion_callback(move |path| {
            let _ = cmd_tx.send(LoopCommand::TrackFinished(path.to_path_buf()));
        });
    }
    drop(cmd_tx);

    tracing::info!(
        tracks = cursor.len(),
        strategy = strategy_name(cursor.strategy()),
        "kinamp started"
    );

    if start_next(&session, &mut cursor) {
        event_loop(&session, &mut cursor, &cmd_rx);
    } else {
        tracing::info!("nothing playable");
    }

    session.stop();
    if cfg.save_on_exit {
        if let Err(e) = cfg
            .store
            .save(cursor.tracks(), cursor.index(), cursor.strategy())
        {
            tracing::warn!("save state: {e:#}");
        }
    }
    Ok(())
}

fn event_loop(session: &Session, cursor: &mut PlaylistCursor, cmd_rx: &Receiver<LoopCommand>) {
    let bus = session.messages();
    let status = session.status();
    let ticker = crossbeam_channel::tick(POSITION_TICK);

    loop {
        crossbeam_channel::select! {
            recv(bus) -> msg => {
                if let Ok(msg) = msg {
                    session.dispatch(msg);
                }
            }
            recv(cmd_rx) -> cmd => match cmd {
                Ok(LoopCommand::TrackFinished(path)) => {
                    tracing::debug!(path = %path.display(), "completion");
                    if !start_next(session, cursor) {
                        tracing::info!("end of playlist reached");
                        return;
                    }
                }
                Ok(LoopCommand::Shutdown) | Err(_) => {
                    tracing::info!("stopping");
                    return;
                }
            },
            recv(ticker) -> _ => {
                if status.state() == SessionState::Playing {
                    tracing::debug!(
                        position_s = session.position().as_secs(),
                        duration_s = session.duration().as_secs(),
                        "progress"
                    );
                }
            }
        }
    }
}

/// Advance the cursor and play. Tracks that fail to start are skipped, up to one full
/// pass of consecutive failures.
fn start_next(session: &Session, cursor: &mut PlaylistCursor) -> bool {
    let total = cursor.len();
    for _ in 0..total {
        let Some((index, path)) = cursor.advance() else {
            return false;
        };
        let path = path.to_path_buf();
        tracing::info!(
            track = index + 1,
            of = total,
            path = %path.display(),
            "next track"
        );
        if session.play(&path) {
            return true;
        }
        tracing::warn!(path = %path.display(), "track failed to start; skipping");
    }
    tracing::error!("no track in the playlist could be started");
    false
}

fn install_ctrlc(tx: Sender<LoopCommand>) -> Result<()> {
    ctrlc::set_handler(move || {
        let _ = tx.send(LoopCommand::Shutdown);
    })
    .context("install Ctrl-C handler")
}

fn strategy_name(strategy: PlaybackStrategy) -> &'static str {
    match strategy {
        PlaybackStrategy::Sequential => "normal",
        PlaybackStrategy::Looping => "repeat",
        PlaybackStrategy::Shuffled => "shuffle",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;

    use crate::cli::Args;
    use anyhow::anyhow;
    use kinamp_player::config::PlayerConfig;
    use kinamp_player::output::{AudioOutput, OutputRequest, OutputStream};

    struct RefusingOutput;

    impl AudioOutput for RefusingOutput {
        fn open(&self, _req: OutputRequest) -> Result<Box<dyn OutputStream>> {
            Err(anyhow!("no device"))
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("kinamp-runtime-{name}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(argv: &[&str]) -> RunConfig {
        RunConfig::from_args(&Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn missing_saved_playlist_is_an_error() {
        let dir = temp_dir("missing");
        let cfg = config(&["kinamp", "--state-dir", dir.to_str().unwrap()]);
        assert!(load_cursor(&cfg).is_err());
    }

    #[test]
    fn empty_playlist_is_an_error() {
        let dir = temp_dir("empty");
        let list = dir.join("empty.m3u");
        fs::write(&list, "\n\n").unwrap();
        let cfg = config(&["kinamp", list.to_str().unwrap()]);
        let err = load_cursor(&cfg).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn saved_state_resumes_index_and_strategy() {
        let dir = temp_dir("resume");
        let cfg = config(&["kinamp", "--state-dir", dir.to_str().unwrap()]);
        let tracks = vec![
            PathBuf::from("/a.mp3"),
            PathBuf::from("/b.flac"),
            PathBuf::from("/c.ogg"),
        ];
        cfg.store
            .save(&tracks, Some(1), PlaybackStrategy::Looping)
            .unwrap();

        let mut cursor = load_cursor(&cfg).unwrap();
        assert_eq!(cursor.strategy(), PlaybackStrategy::Looping);
        assert_eq!(cursor.advance().map(|(i, _)| i), Some(1));
    }

    #[test]
    fn explicit_playlist_starts_at_first_track_and_honours_flags() {
        let dir = temp_dir("explicit");
        let list = dir.join("mix.m3u");
        fs::write(&list, "/x.wav\n/y.wav\n").unwrap();
        let cfg = config(&["kinamp", "--repeat", list.to_str().unwrap()]);
        let mut cursor = load_cursor(&cfg).unwrap();
        assert_eq!(cursor.strategy(), PlaybackStrategy::Looping);
        assert_eq!(cursor.advance().map(|(i, _)| i), Some(0));
    }

    #[test]
    fn flag_overrides_saved_strategy() {
        let dir = temp_dir("override");
        let cfg = config(&["kinamp", "--shuffle", "--state-dir", dir.to_str().unwrap()]);
        cfg.store
            .save(&[PathBuf::from("/a.mp3")], Some(0), PlaybackStrategy::Looping)
            .unwrap();
        let cursor = load_cursor(&cfg).unwrap();
        assert_eq!(cursor.strategy(), PlaybackStrategy::Shuffled);
    }

    #[test]
    fn music_folder_argument_builds_cursor_from_scan() {
        let dir = temp_dir("folder");
        fs::create_dir_all(dir.join("album")).unwrap();
        fs::write(dir.join("album/01.flac"), b"").unwrap();
        fs::write(dir.join("b.mp3"), b"").unwrap();
        fs::write(dir.join("readme.txt"), b"").unwrap();

        let cfg = config(&["kinamp", dir.to_str().unwrap()]);
        let cursor = load_cursor(&cfg).unwrap();
        assert_eq!(
            cursor.tracks(),
            &[dir.join("album/01.flac"), dir.join("b.mp3")]
        );
    }

    #[test]
    fn empty_music_folder_is_an_error() {
        let dir = temp_dir("empty-folder");
        fs::write(dir.join("cover.jpg"), b"").unwrap();
        let cfg = config(&["kinamp", dir.to_str().unwrap()]);
        let err = load_cursor(&cfg).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn start_next_gives_up_after_one_failed_pass() {
        let dir = temp_dir("refuse");
        let player = PlayerConfig {
            pipe_path: dir.join("pcm.fifo"),
            ..PlayerConfig::default()
        };
        let session = Session::new(player, Arc::new(RefusingOutput));
        let tracks = vec![
            dir.join("a.wav"),
            dir.join("b.wav"),
            dir.join("c.wav"),
        ];
        let mut cursor = PlaylistCursor::new(tracks, PlaybackStrategy::Looping);

        assert!(!start_next(&session, &mut cursor));
        assert_eq!(cursor.index(), Some(2));
        assert_eq!(session.state(), SessionState::Idle);
        session.stop();
    }
}
