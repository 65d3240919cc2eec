//! Generation-checked slot storage for catalog entities.
//!
//! Every entity lives in a slot addressed by a [`SlotKey`]. Removing an
//! entity bumps the slot's generation before the slot is recycled, so a key
//! kept past the removal fails the lookup instead of aliasing whatever is
//! stored there next.

use std::fmt;

/// Index plus generation of a slot in a [`Bucket`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    pub const INVALID: SlotKey = SlotKey {
        index: u32::MAX,
        generation: u32::MAX,
    };

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "SlotKey(INVALID)")
        } else {
            write!(f, "SlotKey({}v{})", self.index, self.generation)
        }
    }
}

#[derive(Debug)]
struct Slot<E> {
    generation: u32,
    value: Option<E>,
}

/// Typed container of one entity kind.
#[derive(Debug)]
pub struct Bucket<E> {
    slots: Vec<Slot<E>>,
    free: Vec<u32>,
    len: usize,
}

impl<E> Default for Bucket<E> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<E> Bucket<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value, reusing a freed slot when one exists
    pub fn insert(&mut self, value: E) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: SlotKey) -> Option<&E> {
        self.slots
            .get(key.index())
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut E> {
        self.slots
            .get_mut(key.index())
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Take the value out and retire the key
    pub fn remove(&mut self, key: SlotKey) -> Option<E> {
        let slot = self.slots.get_mut(key.index())?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Drop every value; all outstanding keys go stale
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &E)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let mut bucket = Bucket::new();
        let a = bucket.insert("a");
        let b = bucket.insert("b");
        assert_eq!(bucket.get(a), Some(&"a"));
        assert_eq!(bucket.get(b), Some(&"b"));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_removed_key_is_stale_after_reuse() {
        let mut bucket = Bucket::new();
        let a = bucket.insert(1);
        assert_eq!(bucket.remove(a), Some(1));
        assert_eq!(bucket.remove(a), None);

        let b = bucket.insert(2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(bucket.get(a), None);
        assert_eq!(bucket.get(b), Some(&2));
    }

    #[test]
    fn test_clear_invalidates_all_keys() {
        let mut bucket = Bucket::new();
        let keys: Vec<_> = (0..4).map(|i| bucket.insert(i)).collect();
        bucket.clear();
        assert!(bucket.is_empty());
        assert!(keys.iter().all(|k| bucket.get(*k).is_none()));
        let fresh = bucket.insert(9);
        assert_eq!(bucket.get(fresh), Some(&9));
        assert_eq!(bucket.iter().count(), 1);
    }

    #[test]
    fn test_invalid_key() {
        let bucket: Bucket<u8> = Bucket::new();
        assert!(!bucket.contains(SlotKey::INVALID));
        assert_eq!(format!("{:?}", SlotKey::INVALID), "SlotKey(INVALID)");
    }
}
