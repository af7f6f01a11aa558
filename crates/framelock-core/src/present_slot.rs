//! Latest-frame hand-off between the decode thread and the presenter.
//!
//! The decode loop publishes at the pacing cadence while the presenter
//! drains on the host's redraw schedule; the two never run in lockstep. A
//! [`present_slot`] keeps exactly the freshest frame across that boundary:
//! publishing overwrites anything unconsumed, and taking hands the frame
//! out by value. Three rotating cells keep the two sides off each other's
//! buffers, so neither ever waits on the other.
//!
//! Cell roles are tracked as a permutation id plus a freshness bit in one
//! atomic. The writer only ever swaps the write/ready roles and the reader
//! only the ready/front roles, so each side's cell stays stable under the
//! other side's swaps.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Cell index per role, indexed by permutation id. Role order within each
/// row: write, ready, front.
const ROLES: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

/// Permutation after swapping the write and ready roles.
const AFTER_PUBLISH: [u8; 6] = [2, 4, 0, 5, 1, 3];
/// Permutation after swapping the ready and front roles.
const AFTER_ACQUIRE: [u8; 6] = [1, 0, 3, 2, 5, 4];

const PERM_MASK: u8 = 0b0111;
const FRESH_BIT: u8 = 0b1000;

struct SlotShared<T> {
    cells: [Mutex<Option<T>>; 3],
    /// Bits 0..=2: permutation id. Bit 3: a publish has not been taken yet.
    layout: AtomicU8,
}

impl<T> SlotShared<T> {
    fn role_cell(&self, layout: u8, role: usize) -> &Mutex<Option<T>> {
        &self.cells[ROLES[(layout & PERM_MASK) as usize][role]]
    }
}

/// Producer side; owned by the decode loop. Clones share the slot so a
/// restarted session keeps feeding the same presenter; at most one session
/// publishes at a time.
pub struct PresentWriter<T> {
    shared: Arc<SlotShared<T>>,
}

/// Consumer side; polled by the presenter. Clonable so it can move into
/// render callbacks.
pub struct PresentReader<T> {
    shared: Arc<SlotShared<T>>,
}

impl<T> Clone for PresentWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for PresentReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> PresentWriter<T> {
    /// Publishes a frame, replacing any frame not yet taken.
    pub fn publish(&self, value: T) {
        let layout = self.shared.layout.load(Ordering::Acquire);
        // The write cell is ours alone; the reader never swaps it.
        *self.shared.role_cell(layout, 0).lock() = Some(value);

        let mut current = layout;
        loop {
            let next = AFTER_PUBLISH[(current & PERM_MASK) as usize] | FRESH_BIT;
            match self.shared.layout.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl<T> PresentReader<T> {
    /// Takes the freshest published frame, or None when nothing new has
    /// arrived since the last take.
    pub fn take(&self) -> Option<T> {
        let mut current = self.shared.layout.load(Ordering::Acquire);
        loop {
            if current & FRESH_BIT == 0 {
                return None;
            }
            let next = AFTER_ACQUIRE[(current & PERM_MASK) as usize];
            match self.shared.layout.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The front cell is ours alone after the swap.
                    return self.shared.role_cell(next, 2).lock().take();
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns true when a publish is waiting to be taken.
    pub fn is_fresh(&self) -> bool {
        self.shared.layout.load(Ordering::Acquire) & FRESH_BIT != 0
    }
}

/// Creates a connected writer/reader pair around one slot.
pub fn present_slot<T>() -> (PresentWriter<T>, PresentReader<T>) {
    let shared = Arc::new(SlotShared {
        cells: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
        layout: AtomicU8::new(0),
    });
    (
        PresentWriter {
            shared: Arc::clone(&shared),
        },
        PresentReader { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_yields_nothing() {
        let (_writer, reader) = present_slot::<u32>();
        assert!(!reader.is_fresh());
        assert_eq!(reader.take(), None);
    }

    #[test]
    fn publish_take_cycle() {
        let (writer, reader) = present_slot();
        writer.publish(7);
        assert!(reader.is_fresh());
        assert_eq!(reader.take(), Some(7));
        assert!(!reader.is_fresh());
        assert_eq!(reader.take(), None);
    }

    #[test]
    fn later_publish_overwrites_unconsumed() {
        let (writer, reader) = present_slot();
        writer.publish(1);
        writer.publish(2);
        writer.publish(3);
        assert_eq!(reader.take(), Some(3));
        assert_eq!(reader.take(), None);
    }

    #[test]
    fn swap_tables_are_inverse_consistent() {
        // After a publish the old write cell must be in the ready role,
        // and after an acquire the old ready cell must be in front.
        for perm in 0u8..6 {
            let published = AFTER_PUBLISH[perm as usize];
            assert_eq!(
                ROLES[perm as usize][0],
                ROLES[published as usize][1],
                "publish moves the written cell into ready"
            );
            let acquired = AFTER_ACQUIRE[perm as usize];
            assert_eq!(
                ROLES[perm as usize][1],
                ROLES[acquired as usize][2],
                "acquire moves the ready cell into front"
            );
        }
    }

    #[test]
    fn reader_never_observes_stale_after_fresh() {
        let (writer, reader) = present_slot();
        let producer = std::thread::spawn(move || {
            for n in 1..=500u32 {
                writer.publish(n);
            }
        });

        let mut last_seen = 0;
        while last_seen < 500 {
            if let Some(n) = reader.take() {
                assert!(n > last_seen, "value went backwards: {n} after {last_seen}");
                last_seen = n;
            } else if producer.is_finished() {
                // Producer done and nothing fresh: the final value must
                // already have been observed.
                if !reader.is_fresh() {
                    break;
                }
            }
        }
        producer.join().unwrap();
        assert_eq!(last_seen, 500, "freshest value always wins");
    }
}
