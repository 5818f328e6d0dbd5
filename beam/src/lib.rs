//! Transport byte chunks between a producer thread and a consumer thread
//! over a bounded, flow-controlled pipe.
//!
//! A [Beam] carries a heterogeneous stream — owned bytes, arena-resident
//! bytes, open file windows, and stream markers — from one thread's arena to
//! another's without ever letting either side read memory the other side may
//! free. Large chunks cross by reference: the consumer gets a refcounted
//! [Proxy] whose final drop hands the producer its storage back.
//!
//! # Example
//!
//! ```rust
//! use beam::{Arena, Beam, BlockMode, Brigade, Config, Delivery, Error, Owner};
//!
//! let producer = Arena::new("producer");
//! let consumer = Arena::new("consumer");
//! let beam = Beam::new(&consumer, Config::new("example", Owner::Consumer));
//!
//! // Producer side.
//! let mut brigade = Brigade::new(producer);
//! brigade.push_slice(b"hello");
//! beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
//! beam.close().unwrap();
//!
//! // Consumer side.
//! let mut delivery = Delivery::new(consumer.clone());
//! beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
//! assert_eq!(delivery.read_all().unwrap().as_ref(), b"hello");
//! assert!(matches!(
//!     beam.receive(&mut delivery, BlockMode::NonBlocking, 0),
//!     Err(Error::Eof)
//! ));
//! ```

mod arena;
mod beam;
mod beamer;
mod brigade;
mod chunk;
mod metrics;
mod proxy;

pub use arena::{Arena, ArenaBytes, FileRef, HookId};
pub use beam::{no_files, Beam, Condition, Config};
pub use beamer::{register_beamer, Beamer};
pub use brigade::{Brigade, Delivery, Received};
pub use chunk::{Chunk, Deferred, FileSlice, Meta, Source};
pub use metrics::Metrics;
pub use proxy::Proxy;

use thiserror::Error as ThisError;

/// Errors surfaced by beam operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Try again later: non-blocking backpressure, or nothing to receive.
    #[error("again")]
    Again,
    /// A blocking wait exceeded the configured timeout.
    #[error("timed out")]
    Timeout,
    /// The beam was aborted.
    #[error("connection aborted")]
    Aborted,
    /// The referenced content is gone (beam destroyed or producer arena
    /// died).
    #[error("connection reset")]
    Reset,
    /// The beam is closed and fully drained.
    #[error("end of file")]
    Eof,
    /// An I/O error from file re-homing or producer-side reads.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether an operation may park the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Park on the beam's condition until progress is possible (requires a
    /// [Condition]; degrades to [BlockMode::NonBlocking] without one).
    Blocking,
    /// Never park; report [Error::Again] instead.
    NonBlocking,
}

/// Which role's arena death destroys the beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The producer owns the beam; the consumer arena is monitored.
    Producer,
    /// The consumer owns the beam; the producer arena is monitored.
    Consumer,
}
