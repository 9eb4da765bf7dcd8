//! Per-open-handle sessions multiplexing a universe across many readers.
//!
//! A session is the ephemeral state behind one open consumer handle. It
//! binds to one universe and a contiguous window of its slots, and turns
//! universe mutations into targeted wake-ups:
//!
//! ```text
//! Unbound ──configure──▶ Bound(window) ──read/write/poll──▶ ...
//!    │                        │
//!    └────────close───────────┴──▶ Closed (terminal)
//! ```
//!
//! While bound, the session keeps a standing wait entry on the universe's
//! notification channel. A blocking [`Session::read`] with no unseen change
//! suspends on that entry; wake sources are an overlapping
//! [`Universe::signal_changed`], [`Session::close`], universe retirement,
//! or cancellation of the read future (all handled uniformly by the
//! re-check loop). A Closed wake is a defined terminal outcome
//! ([`ReadOutcome::Closed`]), not an error, and read/write errors never
//! implicitly close the session.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{DmxError, Result};
use crate::universe::{ChangeEvent, Direction, Universe, WaitEntry, Window, UNIVERSE_SLOTS};

/// Result of a [`Session::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` slots were copied into the caller's buffer. A non-blocking read
    /// with no unseen change returns `Data(0)` immediately.
    Data(usize),
    /// The session was closed (or its universe retired) while the read was
    /// pending. Terminal: every subsequent read reports the same.
    Closed,
}

/// Readiness flags reported by [`Session::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// An unseen change overlapping the window is pending.
    pub readable: bool,
    /// The target is output-direction and the cursor is below the slot end.
    pub writable: bool,
}

struct Binding {
    universe: Arc<Universe>,
    window: Window,
    blocking: bool,
    /// Absolute slot index; starts at the window start, saturates at the
    /// window end for reads. Writes may run past the window up to the
    /// universe end.
    cursor: usize,
    entry: Arc<WaitEntry>,
    listener: Option<u64>,
}

impl Binding {
    fn unbind(&self) {
        self.universe.notifier().deregister(&self.entry);
        if let Some(id) = self.listener {
            self.universe.notifier().unsubscribe(id);
        }
        // A read may still be suspended on this entry. Closing it wakes the
        // read; the re-check loop then re-reads the current binding, so a
        // rebound session carries on against the new entry.
        self.entry.mark_closed();
    }
}

enum State {
    Unbound,
    Bound(Binding),
    Closed,
}

/// Live state of one consumer's open handle onto a universe window.
pub struct Session {
    state: Mutex<State>,
}

impl Default for Session {
    fn default() -> Self {
        Self::open()
    }
}

impl Session {
    /// Create a session in the Unbound state.
    pub fn open() -> Self {
        Self {
            state: Mutex::new(State::Unbound),
        }
    }

    /// Bind (or rebind) the session to `universe` and `window`.
    ///
    /// `window` defaults to the full 512 slots. Fails with
    /// [`DmxError::NotAvailable`] if the universe is retiring or the session
    /// is closed. Rebinding releases the previous registration; the cursor
    /// resets to the window start.
    pub fn configure(
        &self,
        universe: &Arc<Universe>,
        window: Option<Window>,
        blocking: bool,
    ) -> Result<()> {
        let window = window.unwrap_or(Window::full());
        let mut state = self.state.lock();
        if matches!(*state, State::Closed) {
            return Err(DmxError::NotAvailable);
        }
        if !universe.is_available() {
            return Err(DmxError::NotAvailable);
        }

        let entry = WaitEntry::new(window);
        universe.notifier().register(entry.clone());
        // Retirement may have raced the registration; entries added before
        // the availability flip were woken by retire, entries added after
        // are caught here.
        if !universe.is_available() {
            universe.notifier().deregister(&entry);
            return Err(DmxError::NotAvailable);
        }

        if let State::Bound(old) = &*state {
            old.unbind();
        }
        debug!(
            universe = universe.id().0,
            start = window.start(),
            size = window.size(),
            blocking,
            "session bound"
        );
        *state = State::Bound(Binding {
            universe: universe.clone(),
            window,
            blocking,
            cursor: window.start(),
            entry,
            listener: None,
        });
        Ok(())
    }

    /// Read slots from the window into `buf`.
    ///
    /// Fails with [`DmxError::NotBound`] if unbound. If an unseen change
    /// overlapping the window is pending, copies up to `buf.len()` slots
    /// starting at the cursor, never past the window end, advances the
    /// cursor, and returns [`ReadOutcome::Data`]. With no pending change a
    /// non-blocking session returns `Data(0)` immediately; a blocking
    /// session suspends until a wake arrives.
    pub async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            let entry = {
                let mut state = self.state.lock();
                match &mut *state {
                    State::Unbound => return Err(DmxError::NotBound),
                    State::Closed => return Ok(ReadOutcome::Closed),
                    State::Bound(binding) => {
                        if binding.entry.is_closed() {
                            return Ok(ReadOutcome::Closed);
                        }
                        if binding.entry.take_pending() {
                            let end = binding.window.end();
                            let avail = end.saturating_sub(binding.cursor);
                            let n = buf.len().min(avail);
                            if n > 0 {
                                binding.universe.load(binding.cursor, &mut buf[..n])?;
                                binding.cursor += n;
                            }
                            return Ok(ReadOutcome::Data(n));
                        }
                        if !binding.blocking {
                            return Ok(ReadOutcome::Data(0));
                        }
                        binding.entry.clone()
                    }
                }
            };
            // Suspend outside the state lock; re-check flags after every
            // wake, whatever its source.
            entry.wait().await;
        }
    }

    /// Write `data` into the universe at the session cursor, then signal the
    /// written range.
    ///
    /// Valid only for output-direction targets ([`DmxError::ReadOnly`]
    /// otherwise). Fails with [`DmxError::OutOfRange`] if the write would
    /// run past the universe's 512 slots; on success the cursor advances by
    /// the written length.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let (universe, span) = {
            let mut state = self.state.lock();
            let binding = match &mut *state {
                State::Unbound => return Err(DmxError::NotBound),
                State::Closed => return Err(DmxError::NotAvailable),
                State::Bound(binding) => binding,
            };
            if binding.universe.direction() != Direction::Output {
                return Err(DmxError::ReadOnly);
            }
            if binding.entry.is_closed() {
                return Err(DmxError::NotAvailable);
            }
            if binding.cursor + data.len() > UNIVERSE_SLOTS {
                return Err(DmxError::OutOfRange {
                    offset: binding.cursor,
                    len: data.len(),
                    max: UNIVERSE_SLOTS,
                });
            }
            let span = Window::new_unchecked(binding.cursor, data.len());
            binding.universe.store(binding.cursor, data)?;
            binding.cursor += data.len();
            (binding.universe.clone(), span)
        };
        // Signal outside the state lock so woken readers on this same
        // session are not serialized behind the writer.
        universe.signal_changed(span);
        Ok(data.len())
    }

    /// Report readiness without mutating any state.
    pub fn poll(&self) -> Result<Readiness> {
        let state = self.state.lock();
        match &*state {
            State::Unbound => Err(DmxError::NotBound),
            State::Closed => Ok(Readiness::default()),
            State::Bound(binding) => Ok(Readiness {
                readable: binding.entry.has_pending(),
                writable: binding.universe.direction() == Direction::Output
                    && binding.cursor < UNIVERSE_SLOTS
                    && !binding.entry.is_closed(),
            }),
        }
    }

    /// Reposition the cursor to `pos` slots past the window start.
    ///
    /// `pos` may equal the window size (cursor at end); anything beyond
    /// fails with [`DmxError::InvalidRange`].
    pub fn seek(&self, pos: usize) -> Result<()> {
        let mut state = self.state.lock();
        let binding = match &mut *state {
            State::Unbound => return Err(DmxError::NotBound),
            State::Closed => return Err(DmxError::NotAvailable),
            State::Bound(binding) => binding,
        };
        if pos > binding.window.size() {
            return Err(DmxError::InvalidRange {
                start: pos,
                size: 0,
                max: binding.window.size(),
            });
        }
        binding.cursor = binding.window.start() + pos;
        Ok(())
    }

    /// Subscribe to asynchronous change notification for the bound universe.
    ///
    /// The receiver gets a [`ChangeEvent`] for every mutation of the
    /// universe, regardless of window overlap. Replaces any previous
    /// subscription for this session; the subscription is removed on close
    /// or rebind, after which the receiver observes end-of-channel.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChangeEvent>> {
        let mut state = self.state.lock();
        let binding = match &mut *state {
            State::Unbound => return Err(DmxError::NotBound),
            State::Closed => return Err(DmxError::NotAvailable),
            State::Bound(binding) => binding,
        };
        if let Some(old) = binding.listener.take() {
            binding.universe.notifier().unsubscribe(old);
        }
        let (id, rx) = binding.universe.notifier().subscribe();
        binding.listener = Some(id);
        Ok(rx)
    }

    /// Close the session: remove it from the universe's wait and
    /// async-notify lists and release the binding. A concurrently blocked
    /// read wakes promptly with [`ReadOutcome::Closed`]. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let State::Bound(binding) = &*state {
            binding.unbind();
            debug!(universe = binding.universe.id().0, "session closed");
        }
        *state = State::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A session never outlives its handle.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::UniverseId;
    use std::time::Duration;
    use tokio::time::timeout;

    fn output_universe(id: u64) -> Arc<Universe> {
        Universe::new(UniverseId(id), Direction::Output)
    }

    #[tokio::test]
    async fn read_requires_binding() {
        let session = Session::open();
        let mut buf = [0u8; 8];
        assert!(matches!(
            session.read(&mut buf).await,
            Err(DmxError::NotBound)
        ));
        assert!(matches!(session.poll(), Err(DmxError::NotBound)));
    }

    #[test]
    fn configure_rejects_retired_universe() {
        let universe = output_universe(1);
        universe.retire();

        let session = Session::open();
        assert!(matches!(
            session.configure(&universe, None, true),
            Err(DmxError::NotAvailable)
        ));
    }

    /// Bytes written at an offset read back exactly through a bound
    /// session observing that range.
    #[tokio::test]
    async fn write_then_read_round_trips() {
        let universe = output_universe(2);

        let writer = Session::open();
        writer.configure(&universe, None, false).unwrap();
        writer.seek(100).unwrap();
        assert_eq!(writer.write(&[1, 2, 3, 4]).unwrap(), 4);

        let reader = Session::open();
        reader
            .configure(&universe, Some(Window::new(100, 4).unwrap()), false)
            .unwrap();
        // The write above predates the reader's registration; signal again
        // so the reader sees a pending change.
        universe.signal_changed(Window::new(100, 4).unwrap());

        let mut buf = [0u8; 8];
        let outcome = reader.read(&mut buf).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Data(4));
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        // Cursor saturates at the window end.
        universe.signal_changed(Window::new(100, 4).unwrap());
        assert_eq!(reader.read(&mut buf).await.unwrap(), ReadOutcome::Data(0));
    }

    #[tokio::test]
    async fn nonblocking_read_with_no_change_returns_zero() {
        let universe = output_universe(3);
        let session = Session::open();
        session.configure(&universe, None, false).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(session.read(&mut buf).await.unwrap(), ReadOutcome::Data(0));
    }

    #[test]
    fn write_is_output_only() {
        let universe = Universe::new(UniverseId(4), Direction::Input);
        let session = Session::open();
        session.configure(&universe, None, false).unwrap();
        assert!(matches!(session.write(&[0u8; 4]), Err(DmxError::ReadOnly)));
    }

    #[test]
    fn write_past_slot_end_fails_without_side_effects() {
        let universe = output_universe(5);
        let session = Session::open();
        session.configure(&universe, None, false).unwrap();
        session.seek(510).unwrap();

        assert!(matches!(
            session.write(&[9u8; 4]),
            Err(DmxError::OutOfRange { offset: 510, len: 4, .. })
        ));
        let mut buf = [0u8; 2];
        universe.load(510, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
        // The failed call does not close the session.
        assert_eq!(session.write(&[9u8; 2]).unwrap(), 2);
    }

    #[test]
    fn poll_reports_without_consuming() {
        let universe = output_universe(6);
        let session = Session::open();
        session
            .configure(&universe, Some(Window::new(0, 100).unwrap()), false)
            .unwrap();

        assert!(!session.poll().unwrap().readable);
        universe.signal_changed(Window::new(50, 10).unwrap());
        assert!(session.poll().unwrap().readable);
        // Still pending: poll must not mutate.
        assert!(session.poll().unwrap().readable);
        assert!(session.poll().unwrap().writable);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_overlapping_signal() {
        let universe = output_universe(7);
        let session = Arc::new(Session::open());
        session
            .configure(&universe, Some(Window::new(0, 100).unwrap()), true)
            .unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 100];
                let outcome = session.read(&mut buf).await.unwrap();
                (outcome, buf)
            })
        };
        tokio::task::yield_now().await;

        universe.store(50, &[0x7f; 10]).unwrap();
        universe.signal_changed(Window::new(50, 10).unwrap());

        let (outcome, buf) = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Data(100));
        assert_eq!(buf[50], 0x7f);
        assert_eq!(buf[60], 0);
    }

    /// Close on a blocked session makes its pending read return promptly
    /// with the Closed outcome.
    #[tokio::test]
    async fn close_wakes_blocked_read() {
        let universe = output_universe(8);
        let session = Arc::new(Session::open());
        session.configure(&universe, None, true).unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                session.read(&mut buf).await.unwrap()
            })
        };
        tokio::task::yield_now().await;

        session.close();
        let outcome = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn universe_retirement_closes_blocked_read() {
        let universe = output_universe(9);
        let session = Arc::new(Session::open());
        session.configure(&universe, None, true).unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                session.read(&mut buf).await.unwrap()
            })
        };
        tokio::task::yield_now().await;

        universe.retire();
        let outcome = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn subscriber_sees_disjoint_changes() {
        let universe = output_universe(10);
        let session = Session::open();
        session
            .configure(&universe, Some(Window::new(0, 10).unwrap()), false)
            .unwrap();
        let mut rx = session.subscribe().unwrap();

        // Disjoint from the session window, still delivered.
        universe.signal_changed(Window::new(400, 10).unwrap());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.span.start(), 400);

        session.close();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn rebind_resets_cursor_and_registration() {
        let universe = output_universe(11);
        let session = Session::open();
        session
            .configure(&universe, Some(Window::new(0, 10).unwrap()), false)
            .unwrap();
        universe.signal_changed(Window::new(0, 10).unwrap());
        assert!(session.poll().unwrap().readable);

        // Rebind to a disjoint window: the old pending flag is gone and the
        // old registration no longer matches signals.
        session
            .configure(&universe, Some(Window::new(200, 10).unwrap()), false)
            .unwrap();
        assert!(!session.poll().unwrap().readable);
        universe.signal_changed(Window::new(0, 10).unwrap());
        assert!(!session.poll().unwrap().readable);
    }

    /// A read suspended at rebind time must not stay parked on the old
    /// registration: closing the rebound session resolves it.
    #[tokio::test]
    async fn close_after_rebind_wakes_blocked_read() {
        let universe = output_universe(13);
        let session = Arc::new(Session::open());
        session.configure(&universe, None, true).unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                session.read(&mut buf).await.unwrap()
            })
        };
        tokio::task::yield_now().await;

        session
            .configure(&universe, Some(Window::new(100, 10).unwrap()), true)
            .unwrap();
        session.close();

        let outcome = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    /// A read suspended at rebind time picks up the new window: a signal
    /// overlapping the rebound window completes it with data.
    #[tokio::test]
    async fn rebind_moves_suspended_read_to_new_window() {
        let universe = output_universe(14);
        let session = Arc::new(Session::open());
        session
            .configure(&universe, Some(Window::new(0, 10).unwrap()), true)
            .unwrap();

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 10];
                let outcome = session.read(&mut buf).await.unwrap();
                (outcome, buf)
            })
        };
        tokio::task::yield_now().await;

        session
            .configure(&universe, Some(Window::new(100, 10).unwrap()), true)
            .unwrap();

        universe.store(100, &[0xaa; 5]).unwrap();
        universe.signal_changed(Window::new(100, 5).unwrap());

        let (outcome, buf) = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Data(10));
        assert_eq!(&buf[..5], &[0xaa; 5]);
        assert_eq!(&buf[5..], &[0; 5]);
    }

    #[test]
    fn seek_stays_inside_window() {
        let universe = output_universe(12);
        let session = Session::open();
        session
            .configure(&universe, Some(Window::new(100, 50).unwrap()), false)
            .unwrap();

        session.seek(50).unwrap();
        assert!(matches!(
            session.seek(51),
            Err(DmxError::InvalidRange { start: 51, .. })
        ));
    }
}
