//! Consumer-side stand-ins for producer-owned chunks.
//!
//! A [Proxy] does not carry data. It references, by sequence number, a chunk
//! the beam keeps in its hold queue, and reads go through the beam lock. The
//! reference cycle beam -> proxy -> chunk -> beam is broken by a weak
//! backpointer plus a `detached` flag the beam raises when the chunk can no
//! longer be read.

use crate::{beam::Shared, Error};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

pub(crate) struct ProxyCore {
    beam: Weak<Shared>,
    seq: u64,
    detached: AtomicBool,
}

impl ProxyCore {
    pub(crate) fn new(beam: Weak<Shared>, seq: u64) -> Self {
        Self {
            beam,
            seq,
            detached: AtomicBool::new(false),
        }
    }

    /// Sever the link to the source chunk; subsequent reads observe
    /// [Error::Reset] and the final drop no longer reaches into the beam.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        // Even when a proxy has been split or cloned, only the handle where
        // the shared count drops to zero lands here.
        if self.is_detached() {
            return;
        }
        if let Some(beam) = self.beam.upgrade() {
            beam.emitted(self.seq);
        }
    }
}

/// A reference-counted window onto a producer chunk held by a beam.
///
/// Clones and splits share the underlying reference; the beam is notified
/// when the last handle drops, releasing the producer chunk for purging.
pub struct Proxy {
    core: Arc<ProxyCore>,
    start: usize,
    len: usize,
}

impl Proxy {
    pub(crate) fn new(core: Arc<ProxyCore>, len: usize) -> Self {
        Self {
            core,
            start: 0,
            len,
        }
    }

    /// Window length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the window `[start, start + len)` of the referenced chunk.
    ///
    /// Fails with [Error::Reset] when the source chunk is gone: the beam was
    /// destroyed, the producer arena died, or bookkeeping already purged it.
    pub fn read(&self) -> Result<Bytes, Error> {
        if self.core.is_detached() {
            return Err(Error::Reset);
        }
        let beam = self.core.beam.upgrade().ok_or(Error::Reset)?;
        beam.read_window(self.core.seq, self.start, self.len)
    }

    /// Keep `[0, at)` in `self`, return `[at, len)` as an independent window
    /// over the same reference.
    pub fn split_off(&mut self, at: usize) -> Proxy {
        assert!(at <= self.len, "split past end of proxy window");
        let tail = Proxy {
            core: self.core.clone(),
            start: self.start + at,
            len: self.len - at,
        };
        self.len = at;
        tail
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            start: self.start,
            len: self.len,
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proxy(seq={}, {}+{})",
            self.core.seq, self.start, self.len
        )
    }
}
