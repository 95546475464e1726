//! Lock-free publication primitives shared by the capture and render contexts.
//!
//! Two policies sit on top of one validated-copy slot:
//!
//! * [`SnapshotBuffer`] publishes frequently written frames. Two slots, a
//!   flip index and a sequence counter; readers retry at most once and fall
//!   back to the last value they validated.
//! * [`SeqLock`] guards data that is written rarely and read every hop
//!   (tuning, diagnostics). One slot; readers retry until they see a stable,
//!   even sequence.
//!
//! Neither primitive allocates after construction and neither ever blocks a
//! writer.

use std::cell::UnsafeCell;
use std::fmt;
use std::hint;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Storage cell whose contents may be copied out while a writer is mid-store.
///
/// A copy is only trusted once the caller has validated it against a
/// sequence counter, so reads go through `MaybeUninit` and are never
/// materialised as `T` before validation.
struct RacySlot<T> {
    cell: UnsafeCell<T>,
}

impl<T: Copy> RacySlot<T> {
    fn new(value: T) -> Self {
        Self {
            cell: UnsafeCell::new(value),
        }
    }

    /// # Safety
    ///
    /// At most one thread may call `store` on a slot at a time.
    unsafe fn store(&self, value: T) {
        ptr::write_volatile(self.cell.get(), value);
    }

    /// # Safety
    ///
    /// The returned copy may be torn; callers must validate it before
    /// calling `assume_init`.
    unsafe fn load(&self) -> MaybeUninit<T> {
        ptr::read_volatile(self.cell.get() as *const MaybeUninit<T>)
    }
}

struct SnapshotShared<T> {
    slots: [RacySlot<T>; 2],
    active: AtomicUsize,
    seq: AtomicU32,
}

// SAFETY: the writer handle is unique and only stores into the inactive slot;
// readers validate every copy against `seq` before exposing it.
unsafe impl<T: Copy + Send> Sync for SnapshotShared<T> {}
unsafe impl<T: Copy + Send> Send for SnapshotShared<T> {}

/// Single-writer, multi-reader double buffer for per-hop frames.
///
/// Construct one, then [`split`](Self::split) it into the writer handle for
/// the producing context and a reader for the consuming context.
pub struct SnapshotBuffer<T> {
    shared: Arc<SnapshotShared<T>>,
    initial: T,
}

impl<T: Copy + Send> SnapshotBuffer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(SnapshotShared {
                slots: [RacySlot::new(initial), RacySlot::new(initial)],
                active: AtomicUsize::new(0),
                seq: AtomicU32::new(0),
            }),
            initial,
        }
    }

    pub fn split(self) -> (SnapshotWriter<T>, SnapshotReader<T>) {
        let reader = SnapshotReader {
            shared: Arc::clone(&self.shared),
            last_good: self.initial,
            last_seq: 0,
        };
        let writer = SnapshotWriter {
            shared: self.shared,
            initial: self.initial,
        };
        (writer, reader)
    }
}

/// Producing half of a [`SnapshotBuffer`]. Not `Clone`: there is exactly one
/// writer per buffer.
pub struct SnapshotWriter<T> {
    shared: Arc<SnapshotShared<T>>,
    initial: T,
}

impl<T: Copy + Send> SnapshotWriter<T> {
    /// Publishes `value`. Never blocks and never allocates.
    pub fn publish(&mut self, value: T) {
        let shared = &*self.shared;
        let inactive = 1 - shared.active.load(Ordering::Relaxed);
        // SAFETY: `&mut self` makes this the only writer, and readers are
        // directed at the other slot until `active` flips below.
        unsafe { shared.slots[inactive].store(value) };
        fence(Ordering::Release);
        shared.active.store(inactive, Ordering::Release);
        shared.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Sequence number of the most recent publish.
    pub fn seq(&self) -> u32 {
        self.shared.seq.load(Ordering::Relaxed)
    }

    /// Creates an additional reader. It starts from the construction value
    /// and picks up the latest publish on its first read.
    pub fn reader(&self) -> SnapshotReader<T> {
        SnapshotReader {
            shared: Arc::clone(&self.shared),
            last_good: self.initial,
            last_seq: 0,
        }
    }
}

/// Consuming half of a [`SnapshotBuffer`].
///
/// Each reader keeps the last value it validated; when both read attempts
/// race with publishes it returns that value instead of spinning.
#[derive(Clone)]
pub struct SnapshotReader<T> {
    shared: Arc<SnapshotShared<T>>,
    last_good: T,
    last_seq: u32,
}

impl<T: Copy + Send> SnapshotReader<T> {
    /// Returns the latest fully published value and its sequence number.
    pub fn read_latest(&mut self) -> (T, u32) {
        for _ in 0..2 {
            if let Some((value, seq)) = self.try_read() {
                self.last_good = value;
                self.last_seq = seq;
                return (value, seq);
            }
        }
        (self.last_good, self.last_seq)
    }

    /// Sequence number currently visible to this reader, without copying.
    pub fn peek_seq(&self) -> u32 {
        self.shared.seq.load(Ordering::Acquire)
    }

    fn try_read(&self) -> Option<(T, u32)> {
        let shared = &*self.shared;
        let before = shared.seq.load(Ordering::Acquire);
        let index = shared.active.load(Ordering::Acquire);
        // SAFETY: the copy stays uninitialised until the sequence check below
        // proves no publish overlapped it.
        let copy = unsafe { shared.slots[index].load() };
        fence(Ordering::Acquire);
        let after = shared.seq.load(Ordering::Relaxed);
        if before == after {
            // SAFETY: validated above.
            Some((unsafe { copy.assume_init() }, after))
        } else {
            None
        }
    }
}

/// Sequence lock for rarely written, frequently read values.
///
/// An odd sequence means a write is in progress. Readers retry while the
/// sequence is odd or changes across their copy. Concurrent writers
/// serialise on the sequence itself.
pub struct SeqLock<T> {
    seq: AtomicU32,
    slot: RacySlot<T>,
}

// SAFETY: stores are serialised by the odd/even handshake in `write`; loads
// are validated against `seq` before being exposed.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}

impl<T: Copy + Send> SeqLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            slot: RacySlot::new(value),
        }
    }

    pub fn read(&self) -> T {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }
            // SAFETY: validated against `seq` before use.
            let copy = unsafe { self.slot.load() };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                // SAFETY: no write overlapped the copy.
                return unsafe { copy.assume_init() };
            }
            hint::spin_loop();
        }
    }

    pub fn write(&self, value: T) {
        let claimed = self.claim();
        // SAFETY: the odd sequence claimed above excludes other writers.
        unsafe { self.slot.store(value) };
        self.release(claimed);
    }

    /// Read-modify-write under the writer claim, so concurrent updates never
    /// lose each other's changes.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let claimed = self.claim();
        // SAFETY: the claim excludes other stores, so the copy cannot be torn.
        let mut value = unsafe { self.slot.load().assume_init() };
        let out = f(&mut value);
        // SAFETY: as above.
        unsafe { self.slot.store(value) };
        self.release(claimed);
        out
    }

    /// Moves the sequence from even to odd; returns the even value claimed.
    fn claim(&self) -> u32 {
        let mut current = self.seq.load(Ordering::Relaxed);
        loop {
            if current & 1 == 1 {
                hint::spin_loop();
                current = self.seq.load(Ordering::Relaxed);
                continue;
            }
            match self.seq.compare_exchange_weak(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        fence(Ordering::Release);
        current
    }

    fn release(&self, claimed: u32) {
        self.seq.store(claimed.wrapping_add(2), Ordering::Release);
    }

    /// Number of completed writes.
    pub fn version(&self) -> u32 {
        self.seq.load(Ordering::Acquire) / 2
    }
}

impl<T: Copy + Send + fmt::Debug> fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqLock")
            .field("version", &self.version())
            .field("value", &self.read())
            .finish()
    }
}

impl<T> fmt::Debug for SnapshotWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotWriter")
            .field("seq", &self.shared.seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> fmt::Debug for SnapshotReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("last_seq", &self.last_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Every element carries the same stamp so a torn copy is detectable.
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Stamped {
        words: [u64; 32],
    }

    impl Stamped {
        fn new(stamp: u64) -> Self {
            Self { words: [stamp; 32] }
        }

        fn is_whole(&self) -> bool {
            self.words.iter().all(|w| *w == self.words[0])
        }
    }

    #[test]
    fn reader_sees_initial_value_before_publish() {
        let (_writer, mut reader) = SnapshotBuffer::new(7_u32).split();
        assert_eq!(reader.read_latest(), (7, 0));
    }

    #[test]
    fn publish_advances_sequence() {
        let (mut writer, mut reader) = SnapshotBuffer::new(0_u32).split();
        writer.publish(1);
        writer.publish(2);
        assert_eq!(writer.seq(), 2);
        assert_eq!(reader.read_latest(), (2, 2));
    }

    #[test]
    fn repeated_reads_are_identical() {
        let (mut writer, mut reader) = SnapshotBuffer::new(Stamped::new(0)).split();
        writer.publish(Stamped::new(42));
        let first = reader.read_latest();
        let second = reader.read_latest();
        assert_eq!(first, second);
    }

    #[test]
    fn extra_readers_are_independent() {
        let (mut writer, mut a) = SnapshotBuffer::new(0_u64).split();
        let mut b = writer.reader();
        writer.publish(9);
        assert_eq!(a.read_latest().0, 9);
        assert_eq!(b.read_latest().0, 9);
    }

    #[test]
    fn concurrent_reads_never_tear() {
        let (mut writer, mut reader) = SnapshotBuffer::new(Stamped::new(0)).split();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                for stamp in 1..=20_000_u64 {
                    writer.publish(Stamped::new(stamp));
                }
            });
            scope.spawn(move || {
                let mut last_seq = 0;
                for _ in 0..20_000 {
                    let (value, seq) = reader.read_latest();
                    assert!(value.is_whole(), "torn snapshot read: {:?}", value.words[0]);
                    assert!(seq >= last_seq);
                    last_seq = seq;
                }
            });
        });
    }

    #[test]
    fn seqlock_concurrent_reads_never_tear() {
        let lock = SeqLock::new(Stamped::new(0));
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for stamp in 1..=5_000_u64 {
                    lock.write(Stamped::new(stamp));
                }
            });
            scope.spawn(|| {
                for _ in 0..5_000 {
                    assert!(lock.read().is_whole());
                }
            });
        });
        assert_eq!(lock.read(), Stamped::new(5_000));
        assert_eq!(lock.version(), 5_000);
    }

    #[test]
    fn seqlock_update_applies_closure() {
        let lock = SeqLock::new(1.5_f32);
        let doubled = lock.update(|v| {
            *v *= 2.0;
            *v
        });
        assert_eq!(doubled, 3.0);
        assert_eq!(lock.read(), 3.0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let lock = SeqLock::new(0_u64);
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..1_000 {
                        lock.update(|v| *v += 1);
                    }
                });
            }
        });
        assert_eq!(lock.read(), 2_000);
        assert_eq!(lock.version(), 2_000);
    }

    proptest! {
        #[test]
        fn last_publish_wins(values in proptest::collection::vec(any::<u64>(), 1..64)) {
            let (mut writer, mut reader) = SnapshotBuffer::new(Stamped::new(0)).split();
            for v in &values {
                writer.publish(Stamped::new(*v));
            }
            let (latest, seq) = reader.read_latest();
            prop_assert_eq!(latest, Stamped::new(*values.last().unwrap()));
            prop_assert_eq!(seq as usize, values.len());
        }
    }
}
