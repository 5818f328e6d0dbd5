//! A bounded, flow-controlled pipe that transports chunks from a producer
//! thread to a consumer thread.
//!
//! The beam keeps three ordered queues of producer chunks: `send` (admitted,
//! available to receive), `hold` (observed by the consumer but still
//! referenced through a [Proxy]), and `purge` (released by the consumer,
//! awaiting a producer-side free). Send-side normalization guarantees that
//! everything entering `send` is safe for later consumer observation: bytes
//! in arena storage are copied out, lazy sources are read on the producer
//! thread, and file handles are either re-homed (when authorized) or copied
//! through memory.
//!
//! # Concurrency
//!
//! Exactly two roles run concurrently: the producer (calling [Beam::send])
//! and the consumer (calling [Beam::receive] / [Beam::wait_empty]). All beam
//! state sits behind one mutex. Blocking behavior is opt-in: install a
//! [Condition] via [Beam::set_condition] and the two suspension points park
//! on it, honoring the configured timeout. Without a condition the beam is
//! effectively single-threaded and blocking calls fall through to their
//! non-blocking results.
//!
//! # Lifecycle
//!
//! A beam is born on an arena and registers a pre-cleanup hook there: arena
//! death destroys the beam. The opposite side's arena (selected by [Owner])
//! is monitored the same way so that whichever side dies first, references
//! into its memory are dropped before they dangle. Proxies outlive all of
//! this gracefully: once detached they answer reads with [Error::Reset].

use crate::{
    arena::{self, Arena, FileRef, HookId},
    beamer,
    brigade::{Brigade, Delivery, Received},
    chunk::{Chunk, Deferred, FileSlice, Meta},
    metrics::Metrics,
    proxy::{Proxy, ProxyCore},
    BlockMode, Error, Owner,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::{debug, warn};

/// Read granularity for content that must be pulled through memory on the
/// producer thread (lazy sources, files refused by the authorization
/// callback).
const SMALL_BUFFER: u64 = 8 * 1024;

/// Condition variable parking the beam's suspension points. Owned by the
/// embedder and installed with [Beam::set_condition]; intended for one beam.
#[derive(Default)]
pub struct Condition {
    cond: Condvar,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every thread parked on this condition.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

/// Default file-beam authorization callback: refuse every handle, forcing
/// the read-and-copy fallback. Useful to cap open-handle counts.
pub fn no_files(_: &FileRef) -> bool {
    false
}

/// Beam configuration.
pub struct Config {
    tag: String,
    owner: Owner,
    max_buf_size: u64,
    timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

impl Config {
    pub fn new(tag: impl Into<String>, owner: Owner) -> Self {
        Self {
            tag: tag.into(),
            owner,
            max_buf_size: 0,
            timeout: None,
            metrics: None,
        }
    }

    /// Returns a copy of this config with the given send-buffer bound.
    /// Zero means unbounded.
    pub fn with_max_buf_size(mut self, max_buf_size: u64) -> Self {
        self.max_buf_size = max_buf_size;
        self
    }

    /// Returns a copy of this config with a timeout applied to every
    /// blocking wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns a copy of this config with metrics attached.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Monitored opposite-side arena: a weak handle plus the registration token
/// of our pre-cleanup hook there (when the owner role requires monitoring).
struct Monitor {
    arena: Weak<arena::Core>,
    hook: Option<HookId>,
}

impl Monitor {
    fn is_alive(&self) -> bool {
        self.arena.upgrade().is_some_and(|core| core.is_alive())
    }

    fn kill(&mut self) {
        if let (Some(core), Some(id)) = (self.arena.upgrade(), self.hook.take()) {
            core.pre_cleanup_kill(id);
        }
    }
}

/// A chunk parked in `hold`, tagged with its proxy sequence number (data
/// chunks only; markers and files carry no proxy).
struct Held {
    seq: Option<u64>,
    chunk: Chunk,
}

type IoCallback = Box<dyn FnMut(u64) + Send>;
type FileBeamCallback = Box<dyn FnMut(&FileRef) -> bool + Send>;

struct State {
    send: VecDeque<Chunk>,
    hold: VecDeque<Held>,
    purge: VecDeque<Chunk>,
    recv_buffer: VecDeque<Received>,
    proxies: Vec<(u64, Weak<ProxyCore>)>,

    sent_bytes: u64,
    received_bytes: u64,
    reported_produced: u64,
    reported_consumed: u64,
    proxies_issued: u64,
    files_beamed: u64,
    last_beamed: Option<u64>,

    max_buf_size: u64,
    timeout: Option<Duration>,

    closed: bool,
    aborted: bool,
    close_sent: bool,
    destroyed: bool,

    consumed_fn: Option<IoCallback>,
    produced_fn: Option<IoCallback>,
    can_beam_fn: Option<FileBeamCallback>,

    send_arena: Option<Monitor>,
    recv_arena: Option<Monitor>,
}

impl State {
    fn new(max_buf_size: u64, timeout: Option<Duration>) -> Self {
        Self {
            send: VecDeque::new(),
            hold: VecDeque::new(),
            purge: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            proxies: Vec::new(),
            sent_bytes: 0,
            received_bytes: 0,
            reported_produced: 0,
            reported_consumed: 0,
            proxies_issued: 0,
            files_beamed: 0,
            last_beamed: None,
            max_buf_size,
            timeout,
            closed: false,
            aborted: false,
            close_sent: false,
            destroyed: false,
            consumed_fn: None,
            produced_fn: None,
            can_beam_fn: None,
            send_arena: None,
            recv_arena: None,
        }
    }

    /// Buffered size per flow control: send-queue lengths, excluding files
    /// (no real memory footprint) and indeterminate chunks.
    fn buffered_countable(&self) -> u64 {
        self.send
            .iter()
            .map(|chunk| match chunk {
                Chunk::File(_) => 0,
                other => other.len().unwrap_or(0),
            })
            .sum()
    }

    fn space_left(&self) -> u64 {
        if self.max_buf_size == 0 {
            return u64::MAX;
        }
        self.max_buf_size.saturating_sub(self.buffered_countable())
    }

    /// Free everything the consumer released. Producer-thread duty.
    fn drain_purge(&mut self) {
        self.purge.clear();
    }

    fn prune_proxies(&mut self) {
        self.proxies.retain(|(_, weak)| weak.strong_count() > 0);
    }
}

pub(crate) struct Shared {
    tag: String,
    owner: Owner,
    metrics: Option<Arc<Metrics>>,
    cond: RwLock<Option<Arc<Condition>>>,
    state: Mutex<State>,
    own: Mutex<Monitor>,
}

impl Shared {
    fn cond_handle(&self) -> Option<Arc<Condition>> {
        self.cond.read().clone()
    }

    fn notify(&self) {
        if let Some(cond) = self.cond_handle() {
            cond.notify_all();
        }
    }

    fn wait(&self, cond: &Condition, state: &mut MutexGuard<'_, State>) -> Result<(), Error> {
        match state.timeout {
            Some(timeout) => {
                if cond.cond.wait_for(state, timeout).timed_out() {
                    return Err(Error::Timeout);
                }
            }
            None => cond.cond.wait(state),
        }
        Ok(())
    }

    fn report_produced(&self, state: &mut State, force: bool) {
        let delta = state.sent_bytes - state.reported_produced;
        if force || delta != 0 {
            if let Some(metrics) = &self.metrics {
                metrics.sent_bytes.inc_by(delta);
            }
            if let Some(cb) = state.produced_fn.as_mut() {
                cb(delta);
            }
            state.reported_produced = state.sent_bytes;
        }
    }

    fn report_consumed(&self, state: &mut State, force: bool) {
        let delta = state.received_bytes - state.reported_consumed;
        if force || delta != 0 {
            if let Some(metrics) = &self.metrics {
                metrics.received_bytes.inc_by(delta);
            }
            if let Some(cb) = state.consumed_fn.as_mut() {
                cb(delta);
            }
            state.reported_consumed = state.received_bytes;
        }
    }

    fn update_buffered_gauge(&self, state: &State) {
        if let Some(metrics) = &self.metrics {
            let buffered: u64 = state.send.iter().map(|c| c.len().unwrap_or(0)).sum();
            metrics.buffered_bytes.set(buffered as i64);
        }
    }

    /// (Re)bind the producer arena; monitored when the consumer owns the
    /// beam, so a dying producer cannot leave dangling references behind.
    fn bind_send_arena(this: &Arc<Self>, state: &mut State, arena: &Arena) {
        if let Some(monitor) = &state.send_arena {
            if arena.ptr_eq(&monitor.arena) {
                return;
            }
        }
        if let Some(mut old) = state.send_arena.take() {
            old.kill();
        }
        let hook = (this.owner == Owner::Consumer).then(|| {
            let weak = Arc::downgrade(this);
            arena.pre_cleanup_register(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_send_arena_death();
                }
            })
        });
        state.send_arena = Some(Monitor {
            arena: arena.downgrade(),
            hook,
        });
    }

    /// (Re)bind the consumer arena; monitored when the producer owns the
    /// beam.
    fn bind_recv_arena(this: &Arc<Self>, state: &mut State, arena: &Arena) {
        if let Some(monitor) = &state.recv_arena {
            if arena.ptr_eq(&monitor.arena) {
                return;
            }
        }
        if let Some(mut old) = state.recv_arena.take() {
            old.kill();
        }
        let hook = (this.owner == Owner::Producer).then(|| {
            let weak = Arc::downgrade(this);
            arena.pre_cleanup_register(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_recv_arena_death();
                }
            })
        });
        state.recv_arena = Some(Monitor {
            arena: arena.downgrade(),
            hook,
        });
    }

    /// The producer arena died: drop every reference into its memory and
    /// detach all proxies so consumer reads observe [Error::Reset].
    fn on_send_arena_death(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        debug!(beam = %self.tag, "producer arena died, clearing send side");
        let junk = self.producer_cleanup(&mut state);
        drop(state);
        drop(junk);
    }

    /// The consumer arena died: drop the receive buffer and its binding.
    fn on_recv_arena_death(&self) {
        let mut state = self.state.lock();
        debug!(beam = %self.tag, "consumer arena died, clearing receive side");
        let spill: Vec<Received> = state.recv_buffer.drain(..).collect();
        state.recv_arena = None;
        drop(state);
        // Proxy drops re-enter the beam; the lock is free now.
        drop(spill);
    }

    /// Free all producer-side queues and detach every live proxy. Returns
    /// the released chunks so the caller can drop them outside the lock.
    fn producer_cleanup(&self, state: &mut State) -> Vec<Chunk> {
        let mut junk: Vec<Chunk> = state.purge.drain(..).collect();
        junk.extend(state.send.drain(..));
        self.report_consumed(state, false);
        for (_, weak) in state.proxies.drain(..) {
            if let Some(core) = weak.upgrade() {
                core.detach();
            }
        }
        junk.extend(state.hold.drain(..).map(|held| held.chunk));
        if let Some(mut monitor) = state.send_arena.take() {
            monitor.kill();
        }
        junk
    }

    /// Owner-specific teardown, shared by [Beam::destroy] and the birth
    /// arena's pre-cleanup hook. Idempotent.
    fn cleanup(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.closed = true;
        let mut junk = Vec::new();
        let spill: Vec<Received>;
        match self.owner {
            Owner::Producer => {
                junk = self.producer_cleanup(&mut state);
                spill = state.recv_buffer.drain(..).collect();
                if let Some(mut monitor) = state.recv_arena.take() {
                    monitor.kill();
                }
            }
            Owner::Consumer => {
                spill = state.recv_buffer.drain(..).collect();
                if state.send_arena.is_some() {
                    // The producer side is no longer running concurrently
                    // (its arena outlived the beam only because teardown is
                    // single-threaded at this point), so its queues can be
                    // cleared synchronously.
                    junk = self.producer_cleanup(&mut state);
                }
                debug_assert!(state.proxies.is_empty());
                debug_assert!(state.send.is_empty());
                debug_assert!(state.hold.is_empty());
                debug_assert!(state.purge.is_empty());
            }
        }
        drop(state);
        self.notify();
        debug!(beam = %self.tag, "destroyed");
        drop(spill);
        drop(junk);
    }

    /// Resolve a proxy read: the window `[start, start + len)` of the hold
    /// entry carrying `seq`.
    pub(crate) fn read_window(&self, seq: u64, start: usize, len: usize) -> Result<Bytes, Error> {
        let state = self.state.lock();
        for held in &state.hold {
            if held.seq == Some(seq) {
                if let Chunk::Owned(bytes) = &held.chunk {
                    let end = (start + len).min(bytes.len());
                    let start = start.min(end);
                    return Ok(bytes.slice(start..end));
                }
                break;
            }
        }
        Err(Error::Reset)
    }

    /// The last proxy handle for `seq` dropped on the consumer side: release
    /// the source chunk (and neighboring markers) into `purge`.
    pub(crate) fn emitted(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.proxies.retain(|(s, _)| *s != seq);
        match state.hold.iter().position(|held| held.seq == Some(seq)) {
            Some(mut target) => {
                // Markers waiting in front of the source chunk have no proxy
                // of their own; release them together with it. Data chunks
                // stay: proxies need not drop in order.
                let mut i = 0;
                while i <= target {
                    if i == target {
                        let held = state.hold.remove(i).expect("target in range");
                        state.purge.push_back(held.chunk);
                        break;
                    } else if state.hold[i].chunk.is_meta() {
                        let held = state.hold.remove(i).expect("marker in range");
                        state.purge.push_back(held.chunk);
                        target -= 1;
                    } else {
                        i += 1;
                    }
                }
                // Markers trailing the source chunk were delivered with it;
                // sweep them as well so they do not outlive their stream
                // position.
                while i < state.hold.len() && state.hold[i].chunk.is_meta() {
                    let held = state.hold.remove(i).expect("marker in range");
                    state.purge.push_back(held.chunk);
                }
            }
            None => {
                warn!(beam = %self.tag, seq, "emitted chunk not in hold");
                if let Some(metrics) = &self.metrics {
                    metrics.emitted_orphans.inc();
                }
                debug_assert!(false, "emitted chunk {seq} not in hold");
            }
        }
        if state.send_arena.as_ref().is_some_and(Monitor::is_alive) {
            // The producer may be waiting on space.
            self.notify();
        } else {
            // No producer left to run the purge; self-clean.
            state.drain_purge();
        }
    }

    /// Admit one chunk into `send`. `Ok(Some(tail))` asks the caller to
    /// requeue a remainder at the front of the brigade; errors hand the
    /// chunk back for retry where that is meaningful.
    #[allow(clippy::type_complexity)]
    fn admit(
        &self,
        state: &mut MutexGuard<'_, State>,
        send_arena: &Arena,
        chunk: Chunk,
        mode: BlockMode,
    ) -> Result<Option<Chunk>, (Option<Chunk>, Error)> {
        match chunk {
            Chunk::Meta(meta) => {
                if meta == Meta::End {
                    state.closed = true;
                }
                state.send.push_back(Chunk::Meta(meta));
                Ok(None)
            }
            Chunk::File(slice) => self.admit_file(state, send_arena, slice),
            Chunk::Arena(bytes) => {
                // Arena storage may vanish at cleanup; copy out while still
                // on the producer thread.
                let owned = match bytes.read() {
                    Ok(owned) => owned,
                    Err(e) => return Err((Some(Chunk::Arena(bytes)), e)),
                };
                self.admit_owned(state, owned, mode)
            }
            Chunk::Owned(bytes) => self.admit_owned(state, bytes, mode),
            Chunk::Deferred(deferred) => self.admit_deferred(state, deferred, mode),
        }
    }

    fn admit_owned(
        &self,
        state: &mut MutexGuard<'_, State>,
        mut bytes: Bytes,
        mode: BlockMode,
    ) -> Result<Option<Chunk>, (Option<Chunk>, Error)> {
        let len = bytes.len() as u64;
        if len == 0 {
            state.send.push_back(Chunk::Owned(bytes));
            return Ok(None);
        }
        let mut space = state.space_left();
        if space < len {
            match self.wait_space(state, mode) {
                Ok(s) => space = s,
                Err(e) => return Err((Some(Chunk::Owned(bytes)), e)),
            }
        }
        let tail = (space < len).then(|| bytes.split_off(space as usize));
        state.sent_bytes += bytes.len() as u64;
        state.send.push_back(Chunk::Owned(bytes));
        Ok(tail.map(Chunk::Owned))
    }

    fn admit_deferred(
        &self,
        state: &mut MutexGuard<'_, State>,
        mut deferred: Deferred,
        mode: BlockMode,
    ) -> Result<Option<Chunk>, (Option<Chunk>, Error)> {
        let known = deferred.remaining();
        if known == Some(0) {
            return Ok(None);
        }
        let mut space = state.space_left();
        // An indeterminate source needs at least a byte of space before we
        // pull content to learn its length.
        if space < known.unwrap_or(1) {
            match self.wait_space(state, mode) {
                Ok(s) => space = s,
                Err(e) => return Err((Some(Chunk::Deferred(deferred)), e)),
            }
        }
        let max = space.max(SMALL_BUFFER);
        let max = known.map_or(max, |n| max.min(n)).min(usize::MAX as u64) as usize;
        match deferred.pull(max) {
            Ok(Some(bytes)) => {
                state.sent_bytes += bytes.len() as u64;
                state.send.push_back(Chunk::Owned(bytes));
                Ok(Some(Chunk::Deferred(deferred)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err((Some(Chunk::Deferred(deferred)), e.into())),
        }
    }

    fn admit_file(
        &self,
        state: &mut MutexGuard<'_, State>,
        send_arena: &Arena,
        mut slice: FileSlice,
    ) -> Result<Option<Chunk>, (Option<Chunk>, Error)> {
        let id = slice.file_id();
        let authorized = state.last_beamed == Some(id)
            || match state.can_beam_fn.as_mut() {
                Some(cb) => cb(slice.file()),
                None => true,
            };
        if authorized {
            if let Err(e) = slice.setaside(send_arena) {
                return Err((Some(Chunk::File(slice)), e.into()));
            }
            state.last_beamed = Some(id);
            state.sent_bytes += slice.len();
            state.send.push_back(Chunk::File(slice));
            return Ok(None);
        }
        // Fallback: copy through memory in small steps. File lengths do not
        // count toward the buffer, so no space check applies.
        let head = match slice.read_head(SMALL_BUFFER) {
            Ok(head) => head,
            Err(e) => return Err((Some(Chunk::File(slice)), e.into())),
        };
        let n = head.len() as u64;
        state.sent_bytes += n;
        state.send.push_back(Chunk::Owned(head));
        slice.advance(n);
        if slice.len() > 0 && n > 0 {
            Ok(Some(Chunk::File(slice)))
        } else {
            Ok(None)
        }
    }

    /// Park the producer until space frees up (blocking mode with a
    /// condition installed), then report what is left.
    fn wait_space(
        &self,
        state: &mut MutexGuard<'_, State>,
        mode: BlockMode,
    ) -> Result<u64, Error> {
        let mut space = state.space_left();
        if mode == BlockMode::Blocking {
            if let Some(cond) = self.cond_handle() {
                while !state.aborted && space == 0 {
                    self.report_produced(state, true);
                    self.wait(&cond, state)?;
                    state.drain_purge();
                    space = state.space_left();
                }
            }
        }
        if state.aborted {
            return Err(Error::Aborted);
        }
        if space == 0 {
            return Err(Error::Again);
        }
        Ok(space)
    }
}

/// A bounded pipe carrying chunks from a producer thread to a consumer
/// thread. Cheap to clone; all clones drive the same beam.
#[derive(Clone)]
pub struct Beam {
    shared: Arc<Shared>,
}

impl Beam {
    /// Create a beam on `arena`. The arena's pre-cleanup destroys the beam.
    pub fn new(arena: &Arena, config: Config) -> Self {
        let shared = Arc::new(Shared {
            tag: config.tag,
            owner: config.owner,
            metrics: config.metrics,
            cond: RwLock::new(None),
            state: Mutex::new(State::new(config.max_buf_size, config.timeout)),
            own: Mutex::new(Monitor {
                arena: arena.downgrade(),
                hook: None,
            }),
        });
        let weak = Arc::downgrade(&shared);
        let hook = arena.pre_cleanup_register(move || {
            if let Some(shared) = weak.upgrade() {
                shared.cleanup();
            }
        });
        shared.own.lock().hook = Some(hook);
        Self { shared }
    }

    /// The tag supplied at construction.
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Which side's arena death destroys the beam.
    pub fn owner(&self) -> Owner {
        self.shared.owner
    }

    /// Install (or remove) the condition variable enabling blocking sends
    /// and receives. Without one, blocking calls degrade to non-blocking
    /// behavior.
    pub fn set_condition(&self, cond: Option<Arc<Condition>>) {
        *self.shared.cond.write() = cond;
    }

    /// Bound on buffered send bytes; zero means unbounded.
    pub fn set_buffer_size(&self, max_buf_size: u64) {
        self.shared.state.lock().max_buf_size = max_buf_size;
    }

    pub fn buffer_size(&self) -> u64 {
        self.shared.state.lock().max_buf_size
    }

    /// Timeout applied to every blocking wait; `None` waits untimed.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.state.lock().timeout
    }

    /// Callback fired with byte deltas as the consumer observes content
    /// (at the end of sends, on close, and on abort).
    pub fn on_consumed(&self, cb: impl FnMut(u64) + Send + 'static) {
        self.shared.state.lock().consumed_fn = Some(Box::new(cb));
    }

    /// Callback fired with byte deltas as the producer admits content
    /// (at the end of sends and before every backpressure wait).
    pub fn on_produced(&self, cb: impl FnMut(u64) + Send + 'static) {
        self.shared.state.lock().produced_fn = Some(Box::new(cb));
    }

    /// Authorization callback consulted before a file handle is transferred
    /// by reference; refusal forces the read-and-copy fallback. Consulted at
    /// most once per distinct handle per send stream. See [no_files].
    pub fn on_file_beam(&self, cb: impl FnMut(&FileRef) -> bool + Send + 'static) {
        self.shared.state.lock().can_beam_fn = Some(Box::new(cb));
    }

    /// Admit the brigade's chunks into the send queue, in order.
    ///
    /// Chunks are normalized for later consumer observation; data beyond the
    /// buffer bound blocks (with a condition installed), or fails with
    /// [Error::Again]. Whatever was not admitted stays in the brigade.
    pub fn send(&self, brigade: &mut Brigade, mode: BlockMode) -> Result<(), Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.drain_purge();
        Shared::bind_send_arena(shared, &mut state, brigade.arena());
        let mut result = Ok(());
        if state.aborted {
            // Parked unnormalized; released at cleanup.
            for chunk in brigade.drain() {
                state.send.push_back(chunk);
            }
            result = Err(Error::Aborted);
        } else {
            let force = !brigade.is_empty();
            while let Some(chunk) = brigade.pop() {
                match shared.admit(&mut state, brigade.arena(), chunk, mode) {
                    Ok(Some(tail)) => brigade.push_front(tail),
                    Ok(None) => {}
                    Err((returned, e)) => {
                        if let Some(chunk) = returned {
                            brigade.push_front(chunk);
                        }
                        result = Err(e);
                        break;
                    }
                }
            }
            shared.report_produced(&mut state, force);
            shared.notify();
        }
        shared.report_consumed(&mut state, false);
        shared.update_buffered_gauge(&state);
        result
    }

    /// Move up to `readbytes` bytes (zero: unlimited) into `dest`,
    /// converting producer chunks into consumer representations.
    ///
    /// Returns [Error::Eof] once the beam is closed and drained,
    /// [Error::Again] when nothing is available in non-blocking mode, and
    /// [Error::Aborted] after an abort.
    pub fn receive(
        &self,
        dest: &mut Delivery,
        mode: BlockMode,
        readbytes: u64,
    ) -> Result<(), Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        Shared::bind_recv_arena(shared, &mut state, dest.arena());
        let unlimited = readbytes == 0;
        loop {
            if state.aborted {
                let spill: Vec<Received> = state.recv_buffer.drain(..).collect();
                drop(state);
                drop(spill);
                return Err(Error::Aborted);
            }

            let mut remain = readbytes as i64;
            let mut transferred = 0usize;
            let dest_start = dest.len();

            // Carry-over from a previous call drains first.
            while unlimited || remain >= 0 {
                let Some(front) = state.recv_buffer.front() else {
                    break;
                };
                if !unlimited && front.len() > 0 && remain <= 0 {
                    break;
                }
                let chunk = state.recv_buffer.pop_front().expect("peeked");
                remain -= chunk.len() as i64;
                transferred += 1;
                dest.push(chunk);
            }

            // Drain the send queue, transforming each head chunk.
            let mut io_failed = None;
            while unlimited || remain >= 0 {
                let Some(front) = state.send.front() else {
                    break;
                };
                let front_len = front.len().unwrap_or(0);
                if !unlimited && front_len > 0 && remain <= 0 {
                    break;
                }
                let chunk = state.send.pop_front().expect("peeked");
                match chunk {
                    Chunk::Meta(meta) => {
                        if meta == Meta::End {
                            state.close_sent = true;
                        }
                        dest.push(Received::Meta(meta));
                        transferred += 1;
                        state.hold.push_back(Held {
                            seq: None,
                            chunk: Chunk::Meta(meta),
                        });
                    }
                    Chunk::File(slice) => {
                        if !slice.homed_in(dest.arena()) {
                            if let Err(e) = slice.setaside(dest.arena()) {
                                // Leave the chunk in place; the call is
                                // retryable.
                                state.send.push_front(Chunk::File(slice));
                                io_failed = Some(Error::from(e));
                                break;
                            }
                            state.files_beamed += 1;
                            if let Some(metrics) = &shared.metrics {
                                metrics.files_beamed.inc();
                            }
                        }
                        remain -= slice.len() as i64;
                        transferred += 1;
                        dest.push(Received::File(slice.clone()));
                        state.hold.push_back(Held {
                            seq: None,
                            chunk: Chunk::File(slice),
                        });
                    }
                    data => {
                        let len = data.len().unwrap_or(0);
                        if let Some(replacement) = beamer::transform(dest.arena(), &data) {
                            remain -= replacement.len() as i64;
                            transferred += 1;
                            dest.push(replacement);
                            state.received_bytes += len;
                            state.hold.push_back(Held {
                                seq: None,
                                chunk: data,
                            });
                        } else if let Chunk::Owned(ref bytes) = data {
                            let seq = state.proxies_issued;
                            state.proxies_issued += 1;
                            let core =
                                Arc::new(ProxyCore::new(Arc::downgrade(&self.shared), seq));
                            state.proxies.push((seq, Arc::downgrade(&core)));
                            let proxy = Proxy::new(core, bytes.len());
                            remain -= proxy.len() as i64;
                            transferred += 1;
                            state.received_bytes += bytes.len() as u64;
                            dest.push(Received::Data(proxy));
                            state.hold.push_back(Held {
                                seq: Some(seq),
                                chunk: data,
                            });
                        } else {
                            // Send-side normalization makes this unreachable.
                            debug_assert!(false, "unnormalized chunk in send queue: {data:?}");
                            state.hold.push_back(Held {
                                seq: None,
                                chunk: data,
                            });
                        }
                    }
                }
            }
            if let Some(e) = io_failed {
                return Err(e);
            }

            // Budget overshoot: split the overshooting chunk and spill the
            // tail back for the next call.
            if !unlimited && remain < 0 {
                let mut budget = readbytes as i64;
                let mut split_at = None;
                for (i, chunk) in dest.iter().enumerate().skip(dest_start) {
                    budget -= chunk.len() as i64;
                    if budget < 0 {
                        split_at = Some((i, (chunk.len() as i64 + budget) as u64));
                        break;
                    }
                }
                if let Some((index, keep)) = split_at {
                    let tail = dest.get_mut(index).expect("in range").split_off(keep);
                    let mut spill = dest.split_to_back(index + 1);
                    spill.insert(0, tail);
                    for chunk in spill.into_iter().rev() {
                        state.recv_buffer.push_front(chunk);
                    }
                }
            }

            if state.closed
                && state.recv_buffer.is_empty()
                && state.send.is_empty()
                && !state.close_sent
            {
                dest.push(Received::Meta(Meta::End));
                state.close_sent = true;
                transferred += 1;
            }

            if transferred > 0 {
                shared.notify();
                shared.update_buffered_gauge(&state);
                return Ok(());
            }
            if state.closed {
                return Err(Error::Eof);
            }
            if mode == BlockMode::Blocking {
                if let Some(cond) = shared.cond_handle() {
                    shared.wait(&cond, &mut state)?;
                    continue;
                }
            }
            shared.notify();
            return Err(Error::Again);
        }
    }

    /// Mark the stream closed. Idempotent; does not discard queued content.
    pub fn close(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.drain_purge();
        if !state.closed {
            state.closed = true;
            debug!(beam = %shared.tag, "closed");
            shared.notify();
        }
        shared.report_consumed(&mut state, false);
        if state.aborted {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Abort the beam: discard queued content and fail every subsequent
    /// send and receive with [Error::Aborted]. Idempotent; producer-side.
    pub fn abort(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.aborted {
            state.aborted = true;
            debug!(beam = %shared.tag, "aborted");
            if let Some(metrics) = &shared.metrics {
                metrics.aborts.inc();
            }
            state.drain_purge();
            state.send.clear();
            shared.report_consumed(&mut state, false);
        }
        shared.notify();
    }

    /// Block until the send queue is empty and no proxies are live, or
    /// return [Error::Again] in non-blocking mode.
    pub fn wait_empty(&self, mode: BlockMode) -> Result<(), Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            state.prune_proxies();
            if state.send.is_empty() && state.proxies.is_empty() {
                return Ok(());
            }
            let cond = match (mode, shared.cond_handle()) {
                (BlockMode::Blocking, Some(cond)) => cond,
                _ => return Err(Error::Again),
            };
            shared.notify();
            shared.wait(&cond, &mut state)?;
        }
    }

    /// Tear the beam down according to its owner role. Idempotent; also
    /// invoked by the birth arena's pre-cleanup.
    pub fn destroy(&self) {
        self.shared.own.lock().kill();
        self.shared.cleanup();
    }

    /// Total length queued in `send`, files included.
    pub fn buffered(&self) -> u64 {
        let state = self.shared.state.lock();
        state.send.iter().map(|c| c.len().unwrap_or(0)).sum()
    }

    /// Memory footprint of `send`: like [Beam::buffered] but excluding
    /// files.
    pub fn mem_used(&self) -> u64 {
        self.shared.state.lock().buffered_countable()
    }

    /// Whether nothing is queued for the consumer (send queue and carry-over
    /// buffer both empty).
    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.send.is_empty() && state.recv_buffer.is_empty()
    }

    /// Whether consumer-side proxies are still live.
    pub fn holds_proxies(&self) -> bool {
        let mut state = self.shared.state.lock();
        state.prune_proxies();
        !state.proxies.is_empty()
    }

    /// Whether the consumer has observed any content.
    pub fn was_received(&self) -> bool {
        self.shared.state.lock().received_bytes > 0
    }

    /// Number of file handles re-homed into consumer arenas.
    pub fn files_beamed(&self) -> u64 {
        self.shared.state.lock().files_beamed
    }

    #[cfg(test)]
    fn queue_lens(&self) -> (usize, usize, usize) {
        let state = self.shared.state.lock();
        (state.send.len(), state.hold.len(), state.purge.len())
    }
}

impl std::fmt::Debug for Beam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Beam")
            .field("tag", &self.shared.tag)
            .field("send", &state.send.len())
            .field("hold", &state.hold.len())
            .field("purge", &state.purge.len())
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        fs::File,
        io::Write,
        sync::atomic::{AtomicU64, Ordering},
        thread,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// A beam owned by the consumer side, plus a producer and consumer arena.
    fn test_beam(tag: &str, max_buf_size: u64) -> (Beam, Arena, Arena) {
        let producer = Arena::new("producer");
        let consumer = Arena::new("consumer");
        let beam = Beam::new(
            &consumer,
            Config::new(tag, Owner::Consumer)
                .with_max_buf_size(max_buf_size)
                .with_timeout(TEST_TIMEOUT),
        );
        (beam, producer, consumer)
    }

    fn threaded(beam: &Beam) -> Arc<Condition> {
        let cond = Arc::new(Condition::new());
        beam.set_condition(Some(cond.clone()));
        cond
    }

    fn temp_file_with(content: &[u8]) -> File {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "beam-test-{}-{}",
            std::process::id(),
            FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).ok();
        file.write_all(content).unwrap();
        file
    }

    fn send_slice(beam: &Beam, arena: &Arena, data: &[u8]) {
        let mut brigade = Brigade::new(arena.clone());
        brigade.push_slice(data);
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
        assert!(brigade.is_empty());
    }

    #[test]
    fn test_basic_roundtrip() {
        let (beam, producer, consumer) = test_beam("s1", 0);
        send_slice(&beam, &producer, b"hello");
        beam.close().unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(delivery.read_all().unwrap().as_ref(), b"hello");
        assert!(matches!(
            delivery.iter().last(),
            Some(Received::Meta(Meta::End))
        ));

        let mut next = Delivery::new(consumer.clone());
        assert!(matches!(
            beam.receive(&mut next, BlockMode::NonBlocking, 0),
            Err(Error::Eof)
        ));
    }

    #[test]
    fn test_end_marker_closes_stream() {
        let (beam, producer, consumer) = test_beam("end-marker", 0);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"tail");
        brigade.push_end();
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        let markers = delivery
            .iter()
            .filter(|c| matches!(c, Received::Meta(Meta::End)))
            .count();
        assert_eq!(markers, 1);
        assert!(matches!(
            beam.receive(&mut delivery, BlockMode::NonBlocking, 0),
            Err(Error::Eof)
        ));
    }

    #[test]
    fn test_blocking_send_splits_across_threads() {
        let (beam, producer, consumer) = test_beam("s2", 4);
        threaded(&beam);

        let sender = {
            let beam = beam.clone();
            thread::spawn(move || {
                let mut brigade = Brigade::new(producer);
                brigade.push_slice(b"abcdef");
                beam.send(&mut brigade, BlockMode::Blocking).unwrap();
                assert!(brigade.is_empty());
            })
        };

        let mut first = Delivery::new(consumer.clone());
        beam.receive(&mut first, BlockMode::Blocking, 3).unwrap();
        assert_eq!(first.read_all().unwrap().as_ref(), b"abc");
        sender.join().unwrap();

        let mut rest = Delivery::new(consumer.clone());
        beam.receive(&mut rest, BlockMode::Blocking, 0).unwrap();
        assert_eq!(rest.read_all().unwrap().as_ref(), b"def");
    }

    #[test]
    fn test_nonblocking_backpressure() {
        let (beam, producer, consumer) = test_beam("s3", 4);
        send_slice(&beam, &producer, b"abcd");

        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"e");
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::NonBlocking),
            Err(Error::Again)
        ));
        assert_eq!(brigade.len(), 1);

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 2).unwrap();
        assert_eq!(delivery.read_all().unwrap().as_ref(), b"ab");

        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
        assert!(brigade.is_empty());
    }

    #[test]
    fn test_abort() {
        let (beam, producer, consumer) = test_beam("s4", 0);
        send_slice(&beam, &producer, b"abc");
        beam.abort();

        let mut delivery = Delivery::new(consumer.clone());
        assert!(matches!(
            beam.receive(&mut delivery, BlockMode::NonBlocking, 0),
            Err(Error::Aborted)
        ));

        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"d");
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::NonBlocking),
            Err(Error::Aborted)
        ));
    }

    #[test]
    fn test_proxy_drop_purges_marker_with_chunk() {
        let (beam, producer, consumer) = test_beam("s5", 0);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"d1");
        brigade.push_flush();
        brigade.push_slice(b"d2");
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
        beam.close().unwrap();

        // Receive d1 and the marker, but not d2.
        let mut first = Delivery::new(consumer.clone());
        beam.receive(&mut first, BlockMode::NonBlocking, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.read_all().unwrap().as_ref(), b"d1");
        assert_eq!(beam.queue_lens(), (1, 2, 0));

        // Dropping the only proxy releases d1 and the marker waiting with
        // it; d2 stays in send.
        drop(first);
        assert_eq!(beam.queue_lens(), (1, 0, 2));

        // The next producer operation frees the purge queue.
        let mut empty = Brigade::new(producer.clone());
        beam.send(&mut empty, BlockMode::NonBlocking).unwrap();
        assert_eq!(beam.queue_lens(), (1, 0, 0));

        let mut rest = Delivery::new(consumer.clone());
        beam.receive(&mut rest, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(rest.read_all().unwrap().as_ref(), b"d2");
        assert!(matches!(
            rest.iter().last(),
            Some(Received::Meta(Meta::End))
        ));
    }

    #[test]
    fn test_file_rehome() {
        let (beam, producer, consumer) = test_beam("s6", 0);
        let file = producer.adopt_file(temp_file_with(b"file content"));
        let mut brigade = Brigade::new(producer.clone());
        brigade.push(FileSlice::new(file, 0, 12));
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(beam.files_beamed(), 1);

        let received = delivery.pop().unwrap();
        match &received {
            Received::File(slice) => assert!(slice.homed_in(&consumer)),
            other => panic!("expected a file, got {other:?}"),
        }

        // The handle was re-homed, so reads survive the producer arena.
        producer.destroy();
        assert_eq!(received.read().unwrap().as_ref(), b"file content");
    }

    #[test]
    fn test_refused_file_copies_through_memory() {
        let (beam, producer, consumer) = test_beam("no-files", 0);
        beam.on_file_beam(no_files);
        let file = producer.adopt_file(temp_file_with(b"copy me"));
        let mut brigade = Brigade::new(producer.clone());
        brigade.push(FileSlice::new(file, 0, 7));
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(beam.files_beamed(), 0);
        assert!(matches!(delivery.iter().next(), Some(Received::Data(_))));
        assert_eq!(delivery.read_all().unwrap().as_ref(), b"copy me");
    }

    #[test]
    fn test_callback_accounting() {
        let (beam, producer, consumer) = test_beam("accounting", 0);
        let produced = Arc::new(Mutex::new(0u64));
        let consumed = Arc::new(Mutex::new(0u64));
        {
            let produced = produced.clone();
            beam.on_produced(move |delta| *produced.lock() += delta);
        }
        {
            let consumed = consumed.clone();
            beam.on_consumed(move |delta| *consumed.lock() += delta);
        }

        send_slice(&beam, &producer, b"hello world");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        beam.close().unwrap();

        assert_eq!(*produced.lock(), 11);
        assert_eq!(*consumed.lock(), 11);
    }

    #[test]
    fn test_consumed_delta_fires_on_abort() {
        let (beam, producer, consumer) = test_beam("abort-delta", 0);
        let consumed = Arc::new(Mutex::new(0u64));
        {
            let consumed = consumed.clone();
            beam.on_consumed(move |delta| *consumed.lock() += delta);
        }
        send_slice(&beam, &producer, b"abcd");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        beam.abort();
        assert_eq!(*consumed.lock(), 4);
    }

    #[test]
    fn test_close_idempotent() {
        let (beam, producer, consumer) = test_beam("close-close", 0);
        send_slice(&beam, &producer, b"x");
        beam.close().unwrap();
        beam.close().unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        let markers = delivery
            .iter()
            .filter(|c| matches!(c, Received::Meta(Meta::End)))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_abort_wins_over_close() {
        // close then abort behaves like abort
        let (beam, producer, consumer) = test_beam("close-abort", 0);
        send_slice(&beam, &producer, b"x");
        beam.close().unwrap();
        beam.abort();
        let mut delivery = Delivery::new(consumer.clone());
        assert!(matches!(
            beam.receive(&mut delivery, BlockMode::NonBlocking, 0),
            Err(Error::Aborted)
        ));

        // abort then close reports the abort
        let (beam, _producer, _consumer) = test_beam("abort-close", 0);
        beam.abort();
        beam.abort();
        assert!(matches!(beam.close(), Err(Error::Aborted)));
    }

    #[test]
    fn test_destroy_detaches_proxies() {
        let (beam, producer, consumer) = test_beam("destroy", 0);
        send_slice(&beam, &producer, b"data");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        let Some(Received::Data(proxy)) = delivery.pop() else {
            panic!("expected a proxy");
        };
        assert_eq!(proxy.read().unwrap().as_ref(), b"data");

        beam.destroy();
        beam.destroy();
        assert!(matches!(proxy.read(), Err(Error::Reset)));
        drop(proxy);
    }

    #[test]
    fn test_producer_arena_death_resets_proxies() {
        let (beam, producer, consumer) = test_beam("send-death", 0);
        send_slice(&beam, &producer, b"data");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        let Some(Received::Data(proxy)) = delivery.pop() else {
            panic!("expected a proxy");
        };

        producer.destroy();
        assert!(matches!(proxy.read(), Err(Error::Reset)));
        assert_eq!(beam.queue_lens(), (0, 0, 0));
    }

    #[test]
    fn test_consumer_arena_death_clears_carry_over() {
        let producer = Arena::new("producer");
        let consumer = Arena::new("consumer");
        let beam = Beam::new(
            &producer,
            Config::new("recv-death", Owner::Producer).with_timeout(TEST_TIMEOUT),
        );
        send_slice(&beam, &producer, b"abcd");

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 2).unwrap();
        assert!(!beam.is_empty());

        consumer.destroy();
        assert!(beam.is_empty());
    }

    #[test]
    fn test_wait_empty() {
        let (beam, producer, consumer) = test_beam("wait-empty", 0);
        send_slice(&beam, &producer, b"x");
        assert!(matches!(
            beam.wait_empty(BlockMode::NonBlocking),
            Err(Error::Again)
        ));

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        // Send queue is drained but a proxy is still live.
        assert!(matches!(
            beam.wait_empty(BlockMode::NonBlocking),
            Err(Error::Again)
        ));
        assert!(beam.holds_proxies());

        drop(delivery);
        assert!(!beam.holds_proxies());
        beam.wait_empty(BlockMode::NonBlocking).unwrap();
    }

    #[test]
    fn test_wait_empty_blocking_across_threads() {
        let (beam, producer, consumer) = test_beam("wait-empty-blocking", 0);
        threaded(&beam);
        send_slice(&beam, &producer, b"payload");

        let receiver = {
            let beam = beam.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let mut delivery = Delivery::new(consumer.clone());
                beam.receive(&mut delivery, BlockMode::Blocking, 0).unwrap();
                assert_eq!(delivery.read_all().unwrap().as_ref(), b"payload");
            })
        };

        beam.wait_empty(BlockMode::Blocking).unwrap();
        receiver.join().unwrap();
    }

    #[test]
    fn test_timeout_on_blocked_receive() {
        let (beam, _producer, consumer) = test_beam("recv-timeout", 0);
        threaded(&beam);
        beam.set_timeout(Some(Duration::from_millis(30)));
        let mut delivery = Delivery::new(consumer.clone());
        assert!(matches!(
            beam.receive(&mut delivery, BlockMode::Blocking, 0),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_timeout_on_blocked_send() {
        let (beam, producer, _consumer) = test_beam("send-timeout", 2);
        threaded(&beam);
        beam.set_timeout(Some(Duration::from_millis(30)));
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"abc");
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::Blocking),
            Err(Error::Timeout)
        ));
        // The head fit; the remainder stays for retry.
        assert_eq!(brigade.len(), 1);
        assert_eq!(beam.buffered(), 2);
    }

    #[test]
    fn test_blocking_without_condition_degrades() {
        let (beam, producer, consumer) = test_beam("no-cond", 2);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"abc");
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::Blocking),
            Err(Error::Again)
        ));
        assert_eq!(brigade.len(), 1);

        // Receive degrades the same way once nothing is queued.
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::Blocking, 0).unwrap();
        assert!(matches!(
            beam.receive(&mut delivery, BlockMode::Blocking, 0),
            Err(Error::Again)
        ));
    }

    #[test]
    fn test_send_after_abort_parks_chunks() {
        let (beam, producer, _consumer) = test_beam("abort-park", 0);
        beam.abort();
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(b"a");
        brigade.push_slice(b"b");
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::NonBlocking),
            Err(Error::Aborted)
        ));
        assert!(brigade.is_empty());
        assert_eq!(beam.queue_lens().0, 2);
    }

    #[test]
    fn test_arena_bytes_are_copied_at_send() {
        let (beam, producer, consumer) = test_beam("pooled", 0);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push(Chunk::Arena(producer.alloc(b"pooled")));
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(delivery.read_all().unwrap().as_ref(), b"pooled");
    }

    #[test]
    fn test_dead_arena_bytes_fail_send() {
        let (beam, _producer, _consumer) = test_beam("dead-pool", 0);
        let stale = Arena::new("stale");
        let bytes = stale.alloc(b"x");
        stale.destroy();
        let mut brigade = Brigade::new(Arena::new("fresh"));
        brigade.push(Chunk::Arena(bytes));
        assert!(matches!(
            beam.send(&mut brigade, BlockMode::NonBlocking),
            Err(Error::Reset)
        ));
        assert_eq!(brigade.len(), 1);
    }

    struct Rows {
        rows: Vec<&'static [u8]>,
    }

    impl crate::Source for Rows {
        fn remaining(&self) -> Option<u64> {
            None
        }

        fn pull(&mut self, _max: usize) -> std::io::Result<Option<Bytes>> {
            if self.rows.is_empty() {
                return Ok(None);
            }
            Ok(Some(Bytes::from_static(self.rows.remove(0))))
        }
    }

    #[test]
    fn test_deferred_source_roundtrip() {
        let (beam, producer, consumer) = test_beam("deferred", 0);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push(Chunk::Deferred(Deferred::new(Rows {
            rows: vec![b"one ", b"two ", b"three"],
        })));
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
        assert!(brigade.is_empty());

        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert_eq!(delivery.read_all().unwrap().as_ref(), b"one two three");
    }

    #[test]
    fn test_buffered_vs_mem_used() {
        let (beam, producer, _consumer) = test_beam("footprint", 0);
        let file = producer.adopt_file(temp_file_with(b"0123456789ab"));
        let mut brigade = Brigade::new(producer.clone());
        brigade.push(FileSlice::new(file, 0, 12));
        brigade.push_slice(b"bytes");
        beam.send(&mut brigade, BlockMode::NonBlocking).unwrap();
        assert_eq!(beam.buffered(), 17);
        assert_eq!(beam.mem_used(), 5);
    }

    #[test]
    fn test_proxy_clone_shares_reference() {
        let (beam, producer, consumer) = test_beam("proxy-clone", 0);
        send_slice(&beam, &producer, b"abcd");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        let Some(Received::Data(mut proxy)) = delivery.pop() else {
            panic!("expected a proxy");
        };

        let clone = proxy.clone();
        let tail = proxy.split_off(2);
        assert_eq!(proxy.read().unwrap().as_ref(), b"ab");
        assert_eq!(tail.read().unwrap().as_ref(), b"cd");
        assert_eq!(clone.read().unwrap().as_ref(), b"abcd");

        drop(proxy);
        drop(tail);
        assert_eq!(beam.queue_lens(), (0, 1, 0));
        drop(clone);
        assert_eq!(beam.queue_lens(), (0, 0, 1));
    }

    #[test]
    fn test_order_preserved_across_random_trims() {
        let mut rng = StdRng::seed_from_u64(42);
        let (beam, producer, consumer) = test_beam("order", 0);

        let mut expected = Vec::new();
        for _ in 0..50 {
            let len = rng.random_range(0..50);
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            expected.extend_from_slice(&payload);
            send_slice(&beam, &producer, &payload);
        }
        beam.close().unwrap();

        let mut out = Vec::new();
        let mut delivery = Delivery::new(consumer.clone());
        loop {
            let readbytes = rng.random_range(0..64);
            match beam.receive(&mut delivery, BlockMode::NonBlocking, readbytes) {
                Ok(()) => {
                    while let Some(chunk) = delivery.pop() {
                        out.extend_from_slice(&chunk.read().unwrap());
                    }
                }
                Err(Error::Eof) => break,
                Err(e) => panic!("unexpected receive error: {e}"),
            }
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn test_bounded_buffer_under_backpressure() {
        let (beam, producer, consumer) = test_beam("bounded", 16);
        let mut brigade = Brigade::new(producer.clone());
        brigade.push_slice(&[b'z'; 64]);

        let mut rounds = 0;
        loop {
            match beam.send(&mut brigade, BlockMode::NonBlocking) {
                Ok(()) => break,
                Err(Error::Again) => {
                    assert!(beam.mem_used() <= 16);
                    let mut delivery = Delivery::new(consumer.clone());
                    beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
                    rounds += 1;
                }
                Err(e) => panic!("unexpected send error: {e}"),
            }
        }
        assert!(rounds >= 3);
    }

    #[test]
    fn test_concurrent_stream() {
        let (beam, producer, consumer) = test_beam("stream", 64);
        threaded(&beam);

        let expected: Vec<u8> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..4096).map(|_| rng.random()).collect()
        };

        let sender = {
            let beam = beam.clone();
            let expected = expected.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(11);
                let mut offset = 0;
                while offset < expected.len() {
                    let len = rng.random_range(1..100).min(expected.len() - offset);
                    let mut brigade = Brigade::new(producer.clone());
                    brigade.push_slice(&expected[offset..offset + len]);
                    beam.send(&mut brigade, BlockMode::Blocking).unwrap();
                    offset += len;
                }
                beam.close().unwrap();
            })
        };

        let mut out = Vec::new();
        let mut delivery = Delivery::new(consumer.clone());
        loop {
            match beam.receive(&mut delivery, BlockMode::Blocking, 48) {
                Ok(()) => {
                    while let Some(chunk) = delivery.pop() {
                        out.extend_from_slice(&chunk.read().unwrap());
                    }
                }
                Err(Error::Eof) => break,
                Err(e) => panic!("unexpected receive error: {e}"),
            }
        }
        sender.join().unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_metrics_account_for_traffic() {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(Metrics::new(&mut registry));
        let producer = Arena::new("producer");
        let consumer = Arena::new("consumer");
        let beam = Beam::new(
            &consumer,
            Config::new("metrics", Owner::Consumer).with_metrics(metrics.clone()),
        );

        send_slice(&beam, &producer, b"hello");
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        beam.close().unwrap();
        beam.abort();

        assert_eq!(metrics.sent_bytes.get(), 5);
        assert_eq!(metrics.received_bytes.get(), 5);
        assert_eq!(metrics.aborts.get(), 1);
        assert_eq!(metrics.emitted_orphans.get(), 0);
    }

    #[test]
    fn test_configuration_roundtrip() {
        let (beam, _producer, _consumer) = test_beam("config", 8);
        assert_eq!(beam.tag(), "config");
        assert_eq!(beam.owner(), Owner::Consumer);
        assert_eq!(beam.buffer_size(), 8);
        beam.set_buffer_size(0);
        assert_eq!(beam.buffer_size(), 0);
        beam.set_timeout(Some(Duration::from_millis(10)));
        assert_eq!(beam.timeout(), Some(Duration::from_millis(10)));
        beam.set_timeout(None);
        assert_eq!(beam.timeout(), None);
    }

    #[test]
    fn test_was_received_tracks_data() {
        let (beam, producer, consumer) = test_beam("observed", 0);
        assert!(!beam.was_received());
        send_slice(&beam, &producer, b"x");
        assert!(!beam.was_received());
        let mut delivery = Delivery::new(consumer.clone());
        beam.receive(&mut delivery, BlockMode::NonBlocking, 0).unwrap();
        assert!(beam.was_received());
    }
}
