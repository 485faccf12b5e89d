//! Fixed-capacity player arena
//!
//! Slots are reused after release; each reuse bumps the slot generation so
//! handles to the released player stop resolving.

use super::types::MediaPlayerHandle;

struct Slot<T> {
    generation: u64,
    value: Option<T>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
}

impl<T> Arena<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a value built from its handle. None when every slot is live.
    pub fn insert_with(&mut self, build: impl FnOnce(MediaPlayerHandle) -> T) -> Option<MediaPlayerHandle> {
        let index = match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };

        let slot = &mut self.slots[index];
        slot.generation += 1;
        let handle = MediaPlayerHandle {
            index,
            generation: slot.generation,
        };
        slot.value = Some(build(handle));
        Some(handle)
    }

    pub fn get(&self, handle: MediaPlayerHandle) -> Option<&T> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn remove(&mut self, handle: MediaPlayerHandle) -> Option<T> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.take())
    }

    pub fn handles(&self) -> Vec<MediaPlayerHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(index, s)| MediaPlayerHandle {
                index,
                generation: s.generation,
            })
            .collect()
    }
}
