//! Universes: fixed 512-slot channel buffers with change notification.
//!
//! A universe is a live, last-write-wins byte buffer. Exactly one producer
//! path mutates it; any number of sessions observe it through windows.
//! There is no queued change log and no writer backpressure: a slow observer
//! that missed a wake simply reads whatever is current on its next read.
//!
//! Change notification goes through one [`ChangeNotifier`] per universe with
//! two subscriber classes:
//!
//! - **Wait entries**: window-matched blocking waiters. [`Universe::
//!   signal_changed`] wakes exactly the entries whose window overlaps the
//!   signalled range.
//! - **Listeners**: unconditional async subscribers. Every change fires a
//!   [`ChangeEvent`] to every listener, regardless of window overlap
//!   (async subscribers want "something changed", not a specific range).
//!
//! Cost of a signal is proportional to the number of entries on that one
//! universe; no lock or scan spans unrelated universes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{DmxError, Result};

/// Number of addressable slots in every universe, regardless of direction.
pub const UNIVERSE_SLOTS: usize = 512;

/// Unique identifier of a universe within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniverseId(pub u64);

/// Data direction of a universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Slots are produced by the hardware and read by consumers.
    Input,
    /// Slots are produced by consumers and sent to the hardware.
    Output,
    /// Slots mirror traffic observed on the bus.
    Monitor,
}

/// A contiguous slot range `[start, start+size)` within `[0, 512)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    start: usize,
    size: usize,
}

impl Window {
    /// Validated window; `size` must be non-zero and the range must stay
    /// inside the universe bounds.
    pub fn new(start: usize, size: usize) -> Result<Self> {
        if size == 0 || start.saturating_add(size) > UNIVERSE_SLOTS {
            return Err(DmxError::InvalidRange {
                start,
                size,
                max: UNIVERSE_SLOTS,
            });
        }
        Ok(Self { start, size })
    }

    /// The full universe, `[0, 512)`.
    pub const fn full() -> Self {
        Self {
            start: 0,
            size: UNIVERSE_SLOTS,
        }
    }

    /// Caller guarantees the range is valid; used on internal paths where
    /// bounds were already checked.
    pub(crate) fn new_unchecked(start: usize, size: usize) -> Self {
        debug_assert!(size > 0 && start + size <= UNIVERSE_SLOTS);
        Self { start, size }
    }

    /// First slot covered.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of slots covered.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last slot covered.
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Whether the two ranges share at least one slot.
    pub fn overlaps(&self, other: Window) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Notification payload delivered to async listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Universe that changed.
    pub universe: UniverseId,
    /// Slot range that was written.
    pub span: Window,
}

/// Standing registration of one bound session on a universe.
///
/// The entry persists for the whole binding, not just while the session is
/// blocked: the `pending` flag accumulates unseen overlapping changes so
/// `poll` can report readiness without a suspended read.
pub(crate) struct WaitEntry {
    window: Window,
    pending: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl WaitEntry {
    pub(crate) fn new(window: Window) -> Arc<Self> {
        Arc::new(Self {
            window,
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub(crate) fn window(&self) -> Window {
        self.window
    }

    /// Consume the pending-change flag.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Peek at the pending-change flag without consuming it.
    pub(crate) fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Overlapping change: latch pending and wake a suspended read.
    fn mark_changed(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Terminal wake: the binding is gone.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Suspend until the next wake. `Notify` stores a permit, so a wake that
    /// races ahead of the suspension is not lost; callers re-check the flags
    /// in a loop. Cancellation (dropping the future) leaves the entry
    /// consistent.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Per-universe notification channel with two subscriber classes.
#[derive(Default)]
pub(crate) struct ChangeNotifier {
    waiters: Mutex<Vec<Arc<WaitEntry>>>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
}

impl ChangeNotifier {
    pub(crate) fn register(&self, entry: Arc<WaitEntry>) {
        self.waiters.lock().push(entry);
    }

    pub(crate) fn deregister(&self, entry: &Arc<WaitEntry>) {
        self.waiters.lock().retain(|e| !Arc::ptr_eq(e, entry));
    }

    pub(crate) fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, tx });
        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|l| l.id != id);
    }

    fn signal(&self, event: ChangeEvent) {
        for entry in self.waiters.lock().iter() {
            if entry.window().overlaps(event.span) {
                entry.mark_changed();
            }
        }
        // Fire-and-forget; listeners whose receiver is gone are pruned.
        self.listeners.lock().retain(|l| l.tx.send(event).is_ok());
    }

    /// Teardown: wake every waiter with the Closed reason and drop every
    /// listener so receivers observe end-of-channel.
    fn close_all(&self) {
        for entry in self.waiters.lock().drain(..) {
            entry.mark_closed();
        }
        self.listeners.lock().clear();
    }
}

/// One direction-tagged, 512-slot addressable channel buffer.
pub struct Universe {
    id: UniverseId,
    direction: Direction,
    buffer: Mutex<Box<[u8; UNIVERSE_SLOTS]>>,
    notifier: ChangeNotifier,
    available: AtomicBool,
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Universe {
    /// Create a universe. Back-ends obtain universes through the registry;
    /// this is public for tests and for interface construction.
    pub fn new(id: UniverseId, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            id,
            direction,
            buffer: Mutex::new(Box::new([0u8; UNIVERSE_SLOTS])),
            notifier: ChangeNotifier::default(),
            available: AtomicBool::new(true),
        })
    }

    /// Identifier within the registry.
    pub fn id(&self) -> UniverseId {
        self.id
    }

    /// Direction tag.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether new bindings are still accepted.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Copy `data` into the buffer at `offset`. Does not signal; producers
    /// call [`Universe::signal_changed`] after the mutation.
    pub fn store(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= UNIVERSE_SLOTS)
            .ok_or(DmxError::OutOfRange {
                offset,
                len: data.len(),
                max: UNIVERSE_SLOTS,
            })?;
        self.buffer.lock()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy slots starting at `offset` into `buf`.
    pub fn load(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= UNIVERSE_SLOTS)
            .ok_or(DmxError::OutOfRange {
                offset,
                len: buf.len(),
                max: UNIVERSE_SLOTS,
            })?;
        buf.copy_from_slice(&self.buffer.lock()[offset..end]);
        Ok(())
    }

    /// Announce that `span` was mutated: wakes every blocked session whose
    /// window overlaps `span` and fires a [`ChangeEvent`] to every async
    /// listener regardless of overlap.
    pub fn signal_changed(&self, span: Window) {
        trace!(universe = self.id.0, start = span.start(), size = span.size(), "slots changed");
        self.notifier.signal(ChangeEvent {
            universe: self.id,
            span,
        });
    }

    /// Begin teardown: refuse new bindings, wake every blocked session with
    /// the Closed reason, drop all async listeners. Idempotent.
    pub fn retire(&self) {
        self.available.store(false, Ordering::Release);
        self.notifier.close_all();
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}
