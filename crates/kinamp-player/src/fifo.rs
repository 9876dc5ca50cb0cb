//! Pipe bridge between the decode thread and the render pipeline.
//!
//! One named FIFO at a fixed path, created once per [`crate::session::Session`] and reused
//! for every track. Opening either end blocks until the other end is present, which is
//! what lets the decoder and the pipeline start in any order. Closing the read end makes
//! the writer's next `write` fail with `BrokenPipe`; that is how a stop unblocks the
//! decoder.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

/// Owner of the FIFO node on disk. Dropping it removes the node.
#[derive(Debug)]
pub struct PipeChannel {
    path: PathBuf,
}

impl PipeChannel {
    /// Create the FIFO at `path`, replacing whatever file was left there.
    ///
    /// Also switches `SIGPIPE` to ignored so a write without a reader returns an error
    /// instead of killing the process.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ignore_sigpipe();

        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale pipe node"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove stale pipe {:?}", path)),
        }

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| anyhow!("pipe path contains a NUL byte: {:?}", path))?;
        // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666 as libc::mode_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).with_context(|| format!("mkfifo {:?}", path));
        }

        tracing::info!(path = %path.display(), "pipe created");
        Ok(Self { path })
    }

    /// Open the write end. Blocks until a reader opens the pipe.
    pub fn open_writer(&self) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open pipe for write {:?}", self.path))
    }

    /// Open the read end. Blocks until a writer opens the pipe.
    pub fn open_reader(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .open(&self.path)
            .with_context(|| format!("open pipe for read {:?}", self.path))
    }

    /// Release a reader stuck in [`Self::open_reader`].
    ///
    /// Opens and immediately closes a non-blocking write end; the reader returns from
    /// `open` and sees end-of-file. No-op when nobody is waiting.
    pub fn wake_reader(&self) {
        let _ = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
    }

    /// Release a writer stuck in [`Self::open_writer`].
    ///
    /// Opens and immediately closes a non-blocking read end; the writer returns from
    /// `open` and its first write fails with `BrokenPipe`.
    pub fn wake_writer(&self) {
        let _ = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "pipe removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "pipe cleanup warning: {e}"),
        }
    }
}

/// Turn `SIGPIPE` into an `EPIPE` error return for the whole process.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions and touches no Rust state.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
