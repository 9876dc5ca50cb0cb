//! Track selection strategies.
//!
//! The navigator only answers "what plays after `current`"; applying the answer to the
//! playlist cursor is the caller's job.

use rand::Rng;

/// How the next track is chosen. The discriminants are the persisted codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackStrategy {
    #[default]
    Sequential = 0,
    Looping = 1,
    Shuffled = 2,
}

impl PlaybackStrategy {
    /// Next index after `current` in a playlist of `len` tracks.
    ///
    /// `current == None` means nothing has played yet, so ordered strategies start at 0.
    /// `None` is returned at the end of a sequential pass and for an empty playlist.
    pub fn next_index(self, current: Option<usize>, len: usize) -> Option<usize> {
        self.next_index_with(&mut rand::rng(), current, len)
    }

    /// [`PlaybackStrategy::next_index`] with an explicit random source.
    pub fn next_index_with<R: Rng>(
        self,
        rng: &mut R,
        current: Option<usize>,
        len: usize,
    ) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let following = current.map_or(0, |i| i.saturating_add(1));
        match self {
            PlaybackStrategy::Sequential => (following < len).then_some(following),
            PlaybackStrategy::Looping => Some(if following < len { following } else { 0 }),
            PlaybackStrategy::Shuffled => Some(rng.random_range(0..len)),
        }
    }

    /// Shuffled ⇄ Sequential; Looping turns into Shuffled.
    pub fn toggle_shuffle(self) -> Self {
        match self {
            PlaybackStrategy::Shuffled => PlaybackStrategy::Sequential,
            _ => PlaybackStrategy::Shuffled,
        }
    }

    /// Looping ⇄ Sequential; Shuffled turns into Looping.
    pub fn toggle_repeat(self) -> Self {
        match self {
            PlaybackStrategy::Looping => PlaybackStrategy::Sequential,
            _ => PlaybackStrategy::Looping,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    /// Unknown codes fall back to Sequential.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => PlaybackStrategy::Looping,
            2 => PlaybackStrategy::Shuffled,
            _ => PlaybackStrategy::Sequential,
        }
    }
}
