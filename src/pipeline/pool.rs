use crate::pipeline::slot::ChannelSlot;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A fixed-size collection of [`ChannelSlot`]s with round-robin selection.
///
/// The pool never grows or shrinks after construction. Selection starts from
/// a rotating cursor and skips slots that are mid-reconnect, so a dead slot
/// is never retried at the expense of live ones and load spreads evenly when
/// everything is healthy.
pub(crate) struct ChannelPool {
    slots: Vec<Arc<ChannelSlot>>,
    cursor: AtomicUsize,
}

impl ChannelPool {
    pub(crate) fn new(slots: Vec<Arc<ChannelSlot>>) -> Self {
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slots(&self) -> &[Arc<ChannelSlot>] {
        &self.slots
    }

    /// Return the first ready slot, scanning at most the whole pool once.
    ///
    /// `None` means every slot is mid-reconnect - a normal condition while
    /// the connection is being re-established, not an error worth shouting
    /// about.
    pub(crate) fn acquire(&self) -> Option<Arc<ChannelSlot>> {
        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let index = (start + offset) % len;
            let slot = &self.slots[index];
            if slot.is_ready() {
                if offset > 0 {
                    // Skipped past dead slots: move the cursor just beyond
                    // the slot we hand out so the rotation resumes there.
                    self.cursor.store(index + 1, Ordering::Relaxed);
                }
                return Some(slot.clone());
            }
        }
        None
    }
}
