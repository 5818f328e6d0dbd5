//! Transportable units: byte chunks, file references, and stream markers.
//!
//! A [Chunk] is tagged by the residency of its backing storage. Only
//! [Chunk::Owned] content is safe to observe from any thread; the beam's
//! send-side normalization converts everything else into owned storage (or,
//! for authorized files, re-homes the handle) before a consumer can see it.

use crate::arena::{Arena, ArenaBytes, FileRef};
use bytes::Bytes;
use std::{fmt, io};

/// Stream markers carrying no user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meta {
    /// End of stream.
    End,
    /// Flush request.
    Flush,
    /// Error marker with a status code.
    Error(u32),
}

/// Lazily produced chunk content, read on the producer thread only.
///
/// Implementations must not call back into the beam, including from `drop`
/// (sources may be dropped while the beam lock is held).
pub trait Source: Send + 'static {
    /// Remaining length, if known. `None` means indeterminate: the beam will
    /// pull once to materialize content before applying backpressure.
    fn remaining(&self) -> Option<u64>;

    /// Produce up to `max` bytes. `Ok(None)` signals exhaustion.
    fn pull(&mut self, max: usize) -> io::Result<Option<Bytes>>;
}

/// A [Source] wrapped for transport.
pub struct Deferred {
    source: Box<dyn Source>,
}

impl Deferred {
    pub fn new(source: impl Source) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.source.remaining()
    }

    pub(crate) fn pull(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        self.source.pull(max)
    }
}

/// A window `[offset, offset + len)` onto an open file adopted by an arena.
#[derive(Clone, Debug)]
pub struct FileSlice {
    file: FileRef,
    offset: u64,
    len: u64,
}

impl FileSlice {
    pub fn new(file: FileRef, offset: u64, len: u64) -> Self {
        Self { file, offset, len }
    }

    /// Byte length of the window.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Identity of the underlying handle.
    pub fn file_id(&self) -> u64 {
        self.file.id()
    }

    /// The underlying handle.
    pub fn file(&self) -> &FileRef {
        &self.file
    }

    /// Whether the handle's strong reference lives in `arena`.
    pub fn homed_in(&self, arena: &Arena) -> bool {
        self.file.homed_in(arena)
    }

    /// Re-home the underlying handle into `arena`.
    pub fn setaside(&self, arena: &Arena) -> io::Result<()> {
        self.file.setaside(arena)
    }

    /// Read the first `min(max, len)` bytes of the window.
    pub(crate) fn read_head(&self, max: u64) -> io::Result<Bytes> {
        let want = self.len.min(max) as usize;
        self.file.read_at(self.offset, want)
    }

    /// Read the whole window.
    pub fn read(&self) -> io::Result<Bytes> {
        self.read_head(self.len)
    }

    /// Drop `n` bytes from the front of the window.
    pub(crate) fn advance(&mut self, n: u64) {
        debug_assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Keep `[0, at)`, return `[at, len)`.
    pub(crate) fn split_off(&mut self, at: u64) -> FileSlice {
        debug_assert!(at <= self.len);
        let tail = FileSlice {
            file: self.file.clone(),
            offset: self.offset + at,
            len: self.len - at,
        };
        self.len = at;
        tail
    }
}

/// A producer-side transport unit, tagged by storage residency.
pub enum Chunk {
    /// Heap-owned bytes, readable from any thread.
    Owned(Bytes),
    /// Bytes in producer-arena storage; copied out during send.
    Arena(ArenaBytes),
    /// Open file window; re-homed between arenas via setaside.
    File(FileSlice),
    /// Lazily produced content of possibly unknown length.
    Deferred(Deferred),
    /// Stream marker.
    Meta(Meta),
}

impl Chunk {
    /// Construct an owned chunk by copying `data`.
    pub fn copy(data: &[u8]) -> Self {
        Chunk::Owned(Bytes::copy_from_slice(data))
    }

    /// Length in bytes, if determinate.
    pub fn len(&self) -> Option<u64> {
        match self {
            Chunk::Owned(b) => Some(b.len() as u64),
            Chunk::Arena(b) => Some(b.len() as u64),
            Chunk::File(f) => Some(f.len()),
            Chunk::Deferred(d) => d.remaining(),
            Chunk::Meta(_) => Some(0),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Chunk::Meta(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Chunk::File(_))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Owned(b) => write!(f, "Owned({})", b.len()),
            Chunk::Arena(b) => write!(f, "Arena({})", b.len()),
            Chunk::File(s) => write!(f, "File({}@{}+{})", s.file_id(), s.offset, s.len),
            Chunk::Deferred(d) => match d.remaining() {
                Some(n) => write!(f, "Deferred({n})"),
                None => write!(f, "Deferred(?)"),
            },
            Chunk::Meta(m) => write!(f, "Meta({m:?})"),
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Owned(bytes)
    }
}

impl From<Meta> for Chunk {
    fn from(meta: Meta) -> Self {
        Chunk::Meta(meta)
    }
}

impl From<FileSlice> for Chunk {
    fn from(slice: FileSlice) -> Self {
        Chunk::File(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        left: u64,
    }

    impl Source for Counting {
        fn remaining(&self) -> Option<u64> {
            Some(self.left)
        }

        fn pull(&mut self, max: usize) -> io::Result<Option<Bytes>> {
            if self.left == 0 {
                return Ok(None);
            }
            let n = (max as u64).min(self.left);
            self.left -= n;
            Ok(Some(Bytes::from(vec![b'x'; n as usize])))
        }
    }

    #[test]
    fn test_chunk_lengths() {
        assert_eq!(Chunk::copy(b"abc").len(), Some(3));
        assert_eq!(Chunk::Meta(Meta::Flush).len(), Some(0));
        assert_eq!(
            Chunk::Deferred(Deferred::new(Counting { left: 10 })).len(),
            Some(10)
        );
    }

    #[test]
    fn test_source_pull_respects_max() {
        let mut d = Deferred::new(Counting { left: 10 });
        assert_eq!(d.pull(4).unwrap().unwrap().len(), 4);
        assert_eq!(d.remaining(), Some(6));
        assert_eq!(d.pull(100).unwrap().unwrap().len(), 6);
        assert!(d.pull(1).unwrap().is_none());
    }
}
