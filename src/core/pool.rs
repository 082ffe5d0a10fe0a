//! Generational Object Pool
//!
//! Free-list arena whose slots are reset and reused instead of dropped.
//! Every slot carries a generation that is bumped on release, so a stale
//! [`PoolHandle`] can never reach the object that replaced it.

/// Objects that can live in a [`GenerationalPool`].
pub trait Poolable: Default {
    /// Return the object to its freshly constructed state, keeping allocations.
    fn reset(&mut self);
}

/// Reference to a pooled slot at a specific generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    /// Slot index.
    pub index: u32,
    /// Generation at acquisition time.
    pub generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    live: bool,
    value: T,
}

/// Arena of reusable objects.
#[derive(Debug)]
pub struct GenerationalPool<T: Poolable> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T: Poolable> Default for GenerationalPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Poolable> GenerationalPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Take a slot, reusing a released one when available.
    pub fn acquire(&mut self) -> PoolHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.live = true;
            return PoolHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            live: true,
            value: T::default(),
        });
        PoolHandle { index, generation: 0 }
    }

    /// Reset the slot and put it back on the free list.
    ///
    /// Returns false if the handle is stale.
    pub fn release(&mut self, handle: PoolHandle) -> bool {
        let Some(slot) = self.slot_mut(handle) else {
            return false;
        };
        slot.value.reset();
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        true
    }

    /// Borrow a live slot.
    pub fn get(&self, handle: PoolHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.live && s.generation == handle.generation)
            .map(|s| &s.value)
    }

    /// Mutably borrow a live slot.
    pub fn get_mut(&mut self, handle: PoolHandle) -> Option<&mut T> {
        self.slot_mut(handle).map(|s| &mut s.value)
    }

    fn slot_mut(&mut self, handle: PoolHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.live && s.generation == handle.generation)
    }

    /// Live slot count.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Released slots waiting for reuse.
    pub fn free(&self) -> usize {
        self.free.len()
    }

    /// Total slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
