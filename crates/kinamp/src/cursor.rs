//! Playlist position owned by the shell.

use std::path::{Path, PathBuf};

use kinamp_player::navigator::PlaybackStrategy;

#[derive(Clone, Debug)]
pub struct PlaylistCursor {
    tracks: Vec<PathBuf>,
    index: Option<usize>,
    strategy: PlaybackStrategy,
}

impl PlaylistCursor {
    /// Cursor before the first track.
    pub fn new(tracks: Vec<PathBuf>, strategy: PlaybackStrategy) -> Self {
        Self {
            tracks,
            index: None,
            strategy,
        }
    }

    /// Cursor whose next ordered step lands on `saved` again.
    ///
    /// A saved index outside the playlist restarts from the first track.
    pub fn resume(tracks: Vec<PathBuf>, saved: Option<usize>, strategy: PlaybackStrategy) -> Self {
        let index = saved
            .filter(|&i| i < tracks.len())
            .and_then(|i| i.checked_sub(1));
        Self {
            tracks,
            index,
            strategy,
        }
    }

    /// Move to the next track chosen by the strategy.
    pub fn advance(&mut self) -> Option<(usize, &Path)> {
        let next = self.strategy.next_index(self.index, self.tracks.len())?;
        self.index = Some(next);
        Some((next, self.tracks[next].as_path()))
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn strategy(&self) -> PlaybackStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
