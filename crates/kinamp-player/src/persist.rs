//! Persisted resumption state.
//!
//! Two plain-text files in one directory:
//! - the playlist, one path per line (`.m3u` compatible, no escaping)
//! - a `key=value` config with `current_index` (-1 for none) and `playback_strategy`
//!
//! Paths are kept as raw bytes end to end; a track name need not be UTF-8.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::navigator::PlaybackStrategy;

pub const PLAYLIST_FILE: &str = ".kinamp_playlist.m3u";
pub const CONFIG_FILE: &str = ".kinamp.conf";

const KEY_INDEX: &str = "current_index";
const KEY_STRATEGY: &str = "playback_strategy";

/// File extensions picked up by [`scan_directory`].
const AUDIO_EXTENSIONS: [&str; 3] = ["mp3", "flac", "wav"];

/// What [`StateStore::load`] recovered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedState {
    pub playlist: Vec<PathBuf>,
    pub index: Option<usize>,
    pub strategy: PlaybackStrategy,
}

#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `$HOME`, or the current directory when it is unset.
    pub fn in_home() -> Self {
        let dir = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir)
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn save(
        &self,
        playlist: &[PathBuf],
        index: Option<usize>,
        strategy: PlaybackStrategy,
    ) -> Result<()> {
        write_playlist(&self.playlist_path(), playlist)?;
        let index = index.map_or(-1, |i| i as i64);
        let body = format!(
            "{KEY_INDEX}={index}\n{KEY_STRATEGY}={}\n",
            strategy.code()
        );
        let path = self.config_path();
        fs::write(&path, body).with_context(|| format!("write {:?}", path))?;
        tracing::info!(dir = %self.dir.display(), tracks = playlist.len(), "state saved");
        Ok(())
    }

    /// Never fails: missing or unreadable files produce defaults.
    pub fn load(&self) -> SavedState {
        let playlist = match read_playlist(&self.playlist_path()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("no saved playlist: {e:#}");
                Vec::new()
            }
        };
        let (index, strategy) = self.load_position();

        SavedState {
            playlist,
            index,
            strategy,
        }
    }

    /// Saved index and strategy only; defaults when the config is missing or unreadable.
    pub fn load_position(&self) -> (Option<usize>, PlaybackStrategy) {
        match fs::read_to_string(self.config_path()) {
            Ok(text) => parse_config(&text),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("read saved config: {e}");
                }
                (None, PlaybackStrategy::Sequential)
            }
        }
    }
}

/// Read a one-path-per-line playlist. Blank lines are skipped, trailing CR is trimmed.
pub fn read_playlist(path: &Path) -> Result<Vec<PathBuf>> {
    let bytes = fs::read(path).with_context(|| format!("read playlist {:?}", path))?;
    Ok(bytes
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.trim_ascii().is_empty())
        .map(|line| PathBuf::from(OsStr::from_bytes(line)))
        .collect())
}

pub fn write_playlist(path: &Path, playlist: &[PathBuf]) -> Result<()> {
    let mut body = Vec::new();
    for track in playlist {
        body.extend_from_slice(track.as_os_str().as_bytes());
        body.push(b'\n');
    }
    fs::write(path, body).with_context(|| format!("write playlist {:?}", path))
}

/// Collect audio files under `dir`, recursively.
///
/// Within a directory, subdirectories come first (in name order), then that directory's
/// own `.mp3`/`.flac`/`.wav` files sorted by name. Unreadable subdirectories are skipped.
pub fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    scan_into(dir, &mut out).with_context(|| format!("scan directory {:?}", dir))?;
    Ok(out)
}

fn scan_into(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut subdirs = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            subdirs.push(path);
        } else if is_audio_file(&path) {
            files.push(path);
        }
    }
    subdirs.sort();
    files.sort();

    for sub in subdirs {
        if let Err(e) = scan_into(&sub, out) {
            tracing::warn!(path = %sub.display(), "skipping directory: {e}");
        }
    }
    out.extend(files);
    Ok(())
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e))
}

fn parse_config(text: &str) -> (Option<usize>, PlaybackStrategy) {
    let mut index = None;
    let mut strategy = PlaybackStrategy::Sequential;
    for line in text.lines() {
        let Some((key, value)) = line.trim_end_matches('\r').split_once('=') else {
            continue;
        };
        let value = parse_int(value);
        match key.trim() {
            KEY_INDEX => index = usize::try_from(value).ok(),
            KEY_STRATEGY => strategy = PlaybackStrategy::from_code(value),
            _ => {}
        }
    }
    (index, strategy)
}

fn parse_int(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> StateStore {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("kinamp-persist-{name}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        StateStore::new(dir)
    }

    #[test]
    fn save_then_load_restores_everything() {
        let store = temp_store("roundtrip");
        let playlist = vec![PathBuf::from("/a.mp3"), PathBuf::from("/b.flac")];
        store
            .save(&playlist, Some(1), PlaybackStrategy::Looping)
            .unwrap();
        let saved = store.load();
        assert_eq!(saved.playlist, playlist);
        assert_eq!(saved.index, Some(1));
        assert_eq!(saved.strategy, PlaybackStrategy::Looping);
    }

    #[test]
    fn missing_strategy_defaults_to_sequential() {
        let store = temp_store("index-only");
        fs::write(store.config_path(), "current_index=3\n").unwrap();
        let saved = store.load();
        assert_eq!(saved.index, Some(3));
        assert_eq!(saved.strategy, PlaybackStrategy::Sequential);
        assert!(saved.playlist.is_empty());
    }

    #[test]
    fn missing_files_give_defaults() {
        let store = temp_store("empty");
        assert_eq!(store.load(), SavedState::default());
    }

    #[test]
    fn no_selection_roundtrips_as_minus_one() {
        let store = temp_store("none");
        store
            .save(&[PathBuf::from("/x.wav")], None, PlaybackStrategy::Shuffled)
            .unwrap();
        let text = fs::read_to_string(store.config_path()).unwrap();
        assert!(text.contains("current_index=-1"));
        let saved = store.load();
        assert_eq!(saved.index, None);
        assert_eq!(saved.strategy, PlaybackStrategy::Shuffled);
    }

    #[test]
    fn config_parsing_skips_noise_and_defaults_bad_numbers() {
        let (index, strategy) =
            parse_config("# comment\nvolume=7\ncurrent_index=abc\r\nplayback_strategy=2\r\n");
        assert_eq!(index, Some(0));
        assert_eq!(strategy, PlaybackStrategy::Shuffled);
    }

    #[test]
    fn non_utf8_track_paths_survive_save_and_load() {
        let store = temp_store("bytes");
        let odd = PathBuf::from(OsStr::from_bytes(b"/music/caf\xE9.flac"));
        let playlist = vec![odd.clone(), PathBuf::from("/music/plain.mp3")];
        store
            .save(&playlist, Some(0), PlaybackStrategy::Sequential)
            .unwrap();
        assert_eq!(store.load().playlist, playlist);

        let external = store.playlist_path().with_file_name("external.m3u");
        fs::write(&external, b"/music/caf\xE9.flac\r\n").unwrap();
        assert_eq!(read_playlist(&external).unwrap(), vec![odd]);
    }

    #[test]
    fn load_position_ignores_playlist_file() {
        let store = temp_store("position");
        fs::write(store.config_path(), "current_index=2\nplayback_strategy=1\n").unwrap();
        assert_eq!(
            store.load_position(),
            (Some(2), PlaybackStrategy::Looping)
        );
    }

    #[test]
    fn scan_directory_recurses_and_sorts_audio_files() {
        let store = temp_store("scan");
        let root = store.playlist_path().with_file_name("library");
        fs::create_dir_all(root.join("b_album")).unwrap();
        fs::create_dir_all(root.join("a_album/disc2")).unwrap();
        for f in [
            "z.mp3",
            "cover.jpg",
            "a.wav",
            "a_album/02.flac",
            "a_album/01.flac",
            "a_album/notes.txt",
            "a_album/disc2/01.mp3",
            "b_album/track.ogg",
            "b_album/track.FLAC",
            "b_album/song.flac",
        ] {
            fs::write(root.join(f), b"").unwrap();
        }

        let found = scan_directory(&root).unwrap();
        let rel: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("a_album/disc2/01.mp3"),
                PathBuf::from("a_album/01.flac"),
                PathBuf::from("a_album/02.flac"),
                PathBuf::from("b_album/song.flac"),
                PathBuf::from("a.wav"),
                PathBuf::from("z.mp3"),
            ]
        );
    }

    #[test]
    fn scan_directory_fails_for_missing_root() {
        let store = temp_store("scan-missing");
        let missing = store.playlist_path().with_file_name("nope");
        assert!(scan_directory(&missing).is_err());
    }

    #[test]
    fn playlist_reader_trims_cr_and_skips_blank_lines() {
        let store = temp_store("crlf");
        let path = store.playlist_path();
        fs::write(&path, "/one.mp3\r\n\r\n  \n/two three.flac\n").unwrap();
        let list = read_playlist(&path).unwrap();
        assert_eq!(
            list,
            vec![PathBuf::from("/one.mp3"), PathBuf::from("/two three.flac")]
        );
    }
}
