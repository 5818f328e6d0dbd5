//! Process-wide registry of receive-side chunk transforms.
//!
//! A beamer can replace the default chunk-to-proxy transform with a custom
//! consumer-side representation. The registry is append-only and consulted
//! in registration order; the first beamer to claim a chunk wins. All
//! registrations are expected to complete during start-up, before any beam
//! carries traffic.

use crate::{arena::Arena, brigade::Received, chunk::Chunk};
use parking_lot::RwLock;

/// A pluggable receive-side transform.
pub trait Beamer: Send + Sync + 'static {
    /// Offer `chunk`, about to be handed to a consumer bound to `arena`.
    /// Return `Some` to replace the default proxy representation.
    fn beam(&self, arena: &Arena, chunk: &Chunk) -> Option<Received>;
}

static BEAMERS: RwLock<Vec<Box<dyn Beamer>>> = RwLock::new(Vec::new());

/// Append a beamer to the process-wide registry.
pub fn register_beamer(beamer: Box<dyn Beamer>) {
    BEAMERS.write().push(beamer);
}

/// Consult registered beamers in order; first claim wins.
pub(crate) fn transform(arena: &Arena, chunk: &Chunk) -> Option<Received> {
    for beamer in BEAMERS.read().iter() {
        if let Some(replacement) = beamer.beam(arena, chunk) {
            return Some(replacement);
        }
    }
    None
}
