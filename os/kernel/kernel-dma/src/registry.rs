use crate::buffer::{BufferKey, BufferRecord};
use alloc::vec::Vec;
use kernel_sync::{InterruptControl, IrqSpinLock};
use log::error;

/// The set of live buffers, keyed by [`BufferKey`].
///
/// Guarded by an interrupt-safe spin lock so that frees from interrupt
/// context are possible. Lookup and removal happen in one critical section,
/// so of two racing frees of the same buffer exactly one finds it.
pub struct BufferRegistry<I: InterruptControl> {
    entries: IrqSpinLock<Vec<BufferRecord>, I>,
}

impl<I: InterruptControl> Default for BufferRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> BufferRegistry<I> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: IrqSpinLock::new(Vec::new()),
        }
    }

    /// Records a new buffer. A key may only be registered once at a time;
    /// a duplicate is handed back untouched.
    pub fn register(&self, record: BufferRecord) -> Result<(), BufferRecord> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|r| r.key == record.key) {
            drop(entries);
            error!("DMA: buffer {:?} registered twice", record.key);
            return Err(record);
        }
        entries.push(record);
        Ok(())
    }

    /// Removes and returns the record for `key`, if any.
    pub fn find_and_remove(&self, key: BufferKey) -> Option<BufferRecord> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|r| r.key == key)?;
        Some(entries.swap_remove(idx))
    }

    /// A copy of the record for `key`, leaving it registered.
    #[must_use]
    pub fn get(&self, key: BufferKey) -> Option<BufferRecord> {
        self.entries.lock().iter().find(|r| r.key == key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: BufferKey) -> bool {
        self.entries.lock().iter().any(|r| r.key == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
