//! Pipeline message bus.
//!
//! Every pipeline build gets a fresh generation number. Messages carry the generation of
//! the build that posted them, so a consumer can drop anything left over from a torn-down
//! pipeline. A [`BusWatch`] is the posting handle held by pipeline threads; removing it
//! silences that build even if its threads are still winding down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};

/// What happened inside a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// The sink has played the last sample of the stream.
    EndOfStream,
    /// A pipeline stage failed; the string is a human-readable cause.
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub generation: u64,
    pub kind: MessageKind,
}

/// Multi-producer, single-consumer channel of [`BusMessage`]s.
pub struct Bus {
    tx: Sender<BusMessage>,
    rx: Receiver<BusMessage>,
    next_generation: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Allocate a watch for a new pipeline build.
    pub fn watch(&self) -> BusWatch {
        BusWatch {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Receiver side, usable in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<BusMessage> {
        &self.rx
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Posting handle for one pipeline generation.
#[derive(Clone, Debug)]
pub struct BusWatch {
    generation: u64,
    tx: Sender<BusMessage>,
    active: Arc<AtomicBool>,
}

impl BusWatch {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post `kind` unless the watch was removed. Returns whether the message was queued.
    pub fn post(&self, kind: MessageKind) -> bool {
        if !self.is_active() {
            tracing::debug!(generation = self.generation, ?kind, "dropping message from removed watch");
            return false;
        }
        self.tx
            .send(BusMessage {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    /// Stop delivering messages for this generation. Shared by all clones.
    pub fn remove(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}
