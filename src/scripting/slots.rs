use std::collections::BTreeSet;

/// Recycling id allocator for one resource class. Id 0 is never handed out.
#[derive(Default, Debug, Clone)]
pub struct SlotAllocator {
    last_occupied: u64,
    free: BTreeSet<u64>,
}

impl SlotAllocator {
    /// Smallest freed id, or the next fresh one. Does not claim the slot.
    pub fn get_empty_slot(&mut self) -> u64 {
        if let Some(id) = self.free.first() {
            return *id;
        }
        self.last_occupied += 1;
        self.last_occupied
    }

    pub fn on_take(&mut self, id: u64) {
        self.free.remove(&id);
    }

    pub fn on_free(&mut self, id: u64) {
        if id != 0 && id <= self.last_occupied {
            self.free.insert(id);
        }
    }

    pub fn allocate(&mut self) -> u64 {
        let id = self.get_empty_slot();
        self.on_take(id);
        id
    }

    #[cfg(test)]
    pub fn is_free(&self, id: u64) -> bool {
        self.free.contains(&id)
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Arena indexed by recycled slot ids. The allocator is the only liveness record.
#[derive(Debug)]
pub struct ResourceTable<T> {
    slots: SlotAllocator,
    items: Vec<Option<T>>,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self {
            slots: SlotAllocator::default(),
            items: Vec::new(),
        }
    }
}

impl<T> ResourceTable<T> {
    pub fn insert(&mut self, value: T) -> u64 {
        let id = self.slots.allocate();
        let index = id as usize;
        if self.items.len() <= index {
            self.items.resize_with(index + 1, || None);
        }
        self.items[index] = Some(value);
        id
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.items.get(id as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        self.items.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Nulls the payload before the id goes back on the free list.
    pub fn take(&mut self, id: u64) -> Option<T> {
        let value = self.items.get_mut(id as usize).and_then(Option::take);
        if value.is_some() {
            self.slots.on_free(id);
        }
        value
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_some()).count()
    }

    #[cfg(test)]
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_ids_are_reused_before_growth() {
        let mut slots = SlotAllocator::default();
        let a = slots.allocate();
        let b = slots.allocate();
        slots.on_free(a);
        let c = slots.allocate();
        assert_eq!(vec![a, b, c], vec![1, 2, 1]);
        assert_eq!(slots.free_count(), 0);
    }

    #[test]
    fn smallest_freed_id_wins() {
        let mut slots = SlotAllocator::default();
        for _ in 0..5 {
            slots.allocate();
        }
        slots.on_free(4);
        slots.on_free(2);
        assert_eq!(slots.allocate(), 2);
        assert_eq!(slots.allocate(), 4);
        assert_eq!(slots.allocate(), 6);
    }

    #[test]
    fn get_empty_slot_does_not_claim_until_taken() {
        let mut slots = SlotAllocator::default();
        let first = slots.get_empty_slot();
        slots.on_take(first);
        slots.on_free(first);
        assert_eq!(slots.get_empty_slot(), first);
        assert_eq!(slots.get_empty_slot(), first);
        slots.on_take(first);
        assert!(!slots.is_free(first));
    }

    #[test]
    fn live_ids_never_collide() {
        let mut slots = SlotAllocator::default();
        let mut live = Vec::new();
        for step in 0..64u64 {
            if step % 3 == 2 {
                let id = live.remove(0);
                slots.on_free(id);
            } else {
                let id = slots.allocate();
                assert!(!live.contains(&id), "id {id} handed out twice");
                live.push(id);
            }
        }
    }

    #[test]
    fn table_take_nulls_payload_and_frees_once() {
        let mut table = ResourceTable::default();
        let id = table.insert("font");
        assert_eq!(table.get(id), Some(&"font"));
        assert_eq!(table.take(id), Some("font"));
        assert_eq!(table.get(id), None);
        assert_eq!(table.take(id), None);
        assert_eq!(table.slots().free_count(), 1);
        assert_eq!(table.insert("other"), id);
    }
}
