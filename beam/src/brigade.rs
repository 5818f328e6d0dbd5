//! Ordered chunk containers for the two ends of a beam.
//!
//! A [Brigade] is the producer's batch: chunks bound to the producer arena,
//! consumed front-to-back by [Beam::send](crate::Beam::send). Chunks the
//! engine could not admit (backpressure, errors) remain in the brigade and
//! may be retried. A [Delivery] is the consumer's destination, filled by
//! [Beam::receive](crate::Beam::receive) with [Received] chunks bound to the
//! consumer arena.

use crate::{
    arena::Arena,
    chunk::{Chunk, FileSlice, Meta},
    proxy::Proxy,
    Error,
};
use bytes::Bytes;
use std::collections::VecDeque;

/// A producer-side batch of chunks bound to an arena.
pub struct Brigade {
    arena: Arena,
    chunks: VecDeque<Chunk>,
}

impl Brigade {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            chunks: VecDeque::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn push(&mut self, chunk: impl Into<Chunk>) {
        self.chunks.push_back(chunk.into());
    }

    /// Append heap-owned bytes.
    pub fn push_bytes(&mut self, bytes: Bytes) {
        self.push(Chunk::Owned(bytes));
    }

    /// Copy ephemeral (stack or otherwise short-lived) data into heap-owned
    /// storage and append it.
    pub fn push_slice(&mut self, data: &[u8]) {
        self.push(Chunk::copy(data));
    }

    /// Append an end-of-stream marker.
    pub fn push_end(&mut self) {
        self.push(Chunk::Meta(Meta::End));
    }

    /// Append a flush marker.
    pub fn push_flush(&mut self) {
        self.push(Chunk::Meta(Meta::Flush));
    }

    /// Append an error marker with a status code.
    pub fn push_error(&mut self, status: u32) {
        self.push(Chunk::Meta(Meta::Error(status)));
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn pop(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    pub(crate) fn push_front(&mut self, chunk: Chunk) {
        self.chunks.push_front(chunk);
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.chunks.drain(..)
    }
}

/// A consumer-side chunk.
#[derive(Debug)]
pub enum Received {
    /// Window onto a producer chunk still held by the beam.
    Data(Proxy),
    /// Materialized bytes (beamer output or defensive copies).
    Bytes(Bytes),
    /// File window re-homed into the consumer arena.
    File(FileSlice),
    /// Stream marker.
    Meta(Meta),
}

impl Received {
    /// Byte length.
    pub fn len(&self) -> u64 {
        match self {
            Received::Data(p) => p.len() as u64,
            Received::Bytes(b) => b.len() as u64,
            Received::File(f) => f.len(),
            Received::Meta(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Received::Meta(_))
    }

    /// Read the content. Markers read as empty; proxies fail with
    /// [Error::Reset] once their source chunk is gone.
    pub fn read(&self) -> Result<Bytes, Error> {
        match self {
            Received::Data(p) => p.read(),
            Received::Bytes(b) => Ok(b.clone()),
            Received::File(f) => Ok(f.read()?),
            Received::Meta(_) => Ok(Bytes::new()),
        }
    }

    /// Keep `[0, at)` in `self`, return `[at, len)`.
    pub(crate) fn split_off(&mut self, at: u64) -> Received {
        match self {
            Received::Data(p) => Received::Data(p.split_off(at as usize)),
            Received::Bytes(b) => Received::Bytes(b.split_off(at as usize)),
            Received::File(f) => Received::File(f.split_off(at)),
            Received::Meta(_) => unreachable!("markers are never split"),
        }
    }
}

/// A consumer-side destination bound to an arena.
pub struct Delivery {
    arena: Arena,
    chunks: VecDeque<Received>,
}

impl Delivery {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            chunks: VecDeque::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn pop(&mut self) -> Option<Received> {
        self.chunks.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Received> {
        self.chunks.iter()
    }

    /// Concatenate the readable content of every chunk, in order. Intended
    /// for tests and small consumers; markers contribute nothing.
    pub fn read_all(&self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.read()?);
        }
        Ok(Bytes::from(out))
    }

    pub(crate) fn push(&mut self, chunk: Received) {
        self.chunks.push_back(chunk);
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Received> {
        self.chunks.get_mut(index)
    }

    pub(crate) fn split_to_back(&mut self, from: usize) -> Vec<Received> {
        self.chunks.drain(from..).collect()
    }
}
