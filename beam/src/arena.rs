//! Memory arenas: named regions with a liveness flag, ordered pre-cleanup
//! hooks, and a cleanup list of adopted resources.
//!
//! An [Arena] stands in for the per-thread memory pool of the embedding
//! environment. It does not allocate anything itself; it tracks *lifetime*:
//! byte storage handed out via [Arena::alloc] and files adopted via
//! [Arena::adopt_file] become unreadable once the arena is destroyed, and
//! pre-cleanup hooks let other components (the beam) drain their references
//! before that happens.
//!
//! # Hook Lifecycle
//!
//! Hooks run exactly once, in registration order, when [Arena::destroy] is
//! called or the last handle is dropped. They are detached from the arena
//! before being invoked, so a hook may re-enter the arena (register or kill
//! other hooks) without deadlocking. A killed hook never runs.

use crate::Error;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    fs::File,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::trace;

/// Process-wide identity source for adopted files.
static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Token returned by [Arena::pre_cleanup_register], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    entries: Vec<(u64, Hook)>,
}

pub(crate) struct Core {
    tag: String,
    alive: AtomicBool,
    destroying: AtomicBool,
    hooks: Mutex<Hooks>,
    files: Mutex<Vec<Option<Arc<FileCore>>>>,
}

impl Core {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn pre_cleanup_kill(&self, id: HookId) {
        self.hooks.lock().entries.retain(|(h, _)| *h != id.0);
    }

    fn destroy(&self) {
        // First caller wins; hooks are detached before running so they may
        // re-enter this arena.
        if self.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(arena = %self.tag, "destroying arena");
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (_, hook) in hooks.entries {
            hook();
        }
        self.alive.store(false, Ordering::Release);
        self.files.lock().clear();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A named lifetime region. Cheap to clone; all clones refer to the same
/// underlying arena.
#[derive(Clone)]
pub struct Arena {
    core: Arc<Core>,
}

impl Arena {
    /// Create a live arena.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            core: Arc::new(Core {
                tag: tag.into(),
                alive: AtomicBool::new(true),
                destroying: AtomicBool::new(false),
                hooks: Mutex::new(Hooks::default()),
                files: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The tag supplied at construction.
    pub fn tag(&self) -> &str {
        &self.core.tag
    }

    /// Whether the arena has not yet been destroyed.
    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// Register a hook to run before the arena's resources are released.
    ///
    /// Returns a token that can be passed to [Arena::pre_cleanup_kill] to
    /// deregister the hook. Registration on a destroyed arena is a no-op
    /// (the hook will never run).
    pub fn pre_cleanup_register(&self, hook: impl FnOnce() + Send + 'static) -> HookId {
        let mut hooks = self.core.hooks.lock();
        let id = hooks.next_id;
        hooks.next_id += 1;
        if self.is_alive() {
            hooks.entries.push((id, Box::new(hook)));
        }
        HookId(id)
    }

    /// Deregister a previously registered hook. A hook that already ran (or
    /// was already killed) is ignored.
    pub fn pre_cleanup_kill(&self, id: HookId) {
        self.core.pre_cleanup_kill(id);
    }

    /// Copy `data` into storage owned by this arena. The returned handle is
    /// readable only while the arena is alive.
    pub fn alloc(&self, data: &[u8]) -> ArenaBytes {
        ArenaBytes {
            arena: Arc::downgrade(&self.core),
            bytes: Bytes::copy_from_slice(data),
        }
    }

    /// Adopt an open file: the arena holds the strong handle and closes it at
    /// destruction unless the file is set aside into another arena first.
    pub fn adopt_file(&self, file: File) -> FileRef {
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(FileCore {
            file,
            id,
            home: Mutex::new(Arc::downgrade(&self.core)),
        });
        let weak = Arc::downgrade(&core);
        self.core.files.lock().push(Some(core));
        FileRef { core: weak, id }
    }

    /// Run pre-cleanup hooks and release adopted resources. Idempotent.
    pub fn destroy(&self) {
        self.core.destroy();
    }

    pub(crate) fn downgrade(&self) -> Weak<Core> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn ptr_eq(&self, other: &Weak<Core>) -> bool {
        Weak::ptr_eq(&Arc::downgrade(&self.core), other)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("tag", &self.core.tag)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Bytes backed by arena storage: readable only while the owning arena is
/// alive. Produced by [Arena::alloc], consumed by the beam's send-side
/// normalization (which copies the content into heap-owned storage).
pub struct ArenaBytes {
    arena: Weak<Core>,
    bytes: Bytes,
}

impl ArenaBytes {
    /// Length of the stored bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the content. Fails with [Error::Reset] once the owning arena has
    /// been destroyed.
    pub fn read(&self) -> Result<Bytes, Error> {
        match self.arena.upgrade() {
            Some(core) if core.is_alive() => Ok(self.bytes.clone()),
            _ => Err(Error::Reset),
        }
    }
}

impl std::fmt::Debug for ArenaBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaBytes({})", self.bytes.len())
    }
}

struct FileCore {
    file: File,
    id: u64,
    /// The arena currently holding the strong handle (the "read arena").
    home: Mutex<Weak<Core>>,
}

/// Weak handle to a file adopted by some arena.
///
/// Cloning is cheap and does not extend the file's lifetime: when the owning
/// arena dies without a [setaside](FileRef::setaside), reads fail with
/// [io::ErrorKind::ConnectionReset].
#[derive(Clone)]
pub struct FileRef {
    core: Weak<FileCore>,
    id: u64,
}

impl FileRef {
    /// Stable identity of the underlying handle, used to deduplicate
    /// authorization queries.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the strong handle currently lives in `arena`.
    pub fn homed_in(&self, arena: &Arena) -> bool {
        self.core
            .upgrade()
            .map(|c| arena.ptr_eq(&c.home.lock()))
            .unwrap_or(false)
    }

    /// Move the strong handle from its current arena into `target`,
    /// re-registering cleanup so the file now closes with `target`.
    pub fn setaside(&self, target: &Arena) -> io::Result<()> {
        let core = self.upgrade()?;
        let mut home = core.home.lock();
        if target.ptr_eq(&home) {
            return Ok(());
        }
        // Pull the strong handle out of the old arena, if it still exists.
        let mut strong = None;
        if let Some(old) = home.upgrade() {
            let mut files = old.files.lock();
            for slot in files.iter_mut() {
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &core)) {
                    strong = slot.take();
                    break;
                }
            }
        }
        let strong = strong.unwrap_or_else(|| core.clone());
        target.core.files.lock().push(Some(strong));
        *home = Arc::downgrade(&target.core);
        Ok(())
    }

    /// Read up to `len` bytes at absolute `offset`. Short reads indicate end
    /// of file.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let core = self.upgrade()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = read_at(&core.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    fn upgrade(&self) -> io::Result<Arc<FileCore>> {
        self.core.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionReset, "file arena destroyed")
        })
    }
}

impl std::fmt::Debug for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileRef({})", self.id)
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
