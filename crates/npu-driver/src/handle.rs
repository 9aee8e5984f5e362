//! Generation-checked handle tables
//!
//! A [`Handle`] names a slot and the generation the slot had when the value
//! was inserted. Removing a value bumps the slot generation, so a handle kept
//! past its value's lifetime never resolves to whatever reuses the slot.

use std::fmt;

/// Opaque reference into a [`HandleTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index, small and dense
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot at insertion
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Stable 64-bit form for logs and external callers
    pub const fn as_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Rebuild a handle from [`Handle::as_raw`]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot map with generation-checked handles and an optional size limit
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    /// Unbounded table
    pub const fn new() -> Self {
        Self::with_limit(u32::MAX as usize)
    }

    /// Table holding at most `limit` live values
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
        }
    }

    /// Live values
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if no value is live
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value`, returning it back if the table is full
    ///
    /// # Errors
    ///
    /// Returns the value when the limit is reached.
    pub fn try_insert(&mut self, value: T) -> std::result::Result<Handle, T> {
        if self.len >= self.limit {
            return Err(value);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => match u32::try_from(self.slots.len()) {
                Ok(index) => {
                    self.slots.push(Slot {
                        generation: 0,
                        value: None,
                    });
                    index
                }
                Err(_) => return Err(value),
            },
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Insert `value` into an unbounded table
    ///
    /// # Panics
    ///
    /// Panics if the table limit is reached; bounded tables use
    /// [`HandleTable::try_insert`].
    pub fn insert(&mut self, value: T) -> Handle {
        match self.try_insert(value) {
            Ok(handle) => handle,
            Err(_) => panic!("handle table full ({} entries)", self.len),
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    /// Value named by `handle`, if still live
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    /// Mutable value named by `handle`, if still live
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// True if `handle` names a live value
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the value named by `handle`
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Live handles and values in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        // Slots are only pushed while their index fits u32
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    /// Mutable iteration over live values
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }

    /// Live handles in slot order
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_insert_get_remove() {
        let mut t = HandleTable::new();
        let a = t.insert("a");
        let b = t.insert("b");
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a), Some(&"a"));
        assert_eq!(t.remove(a), Some("a"));
        assert_eq!(t.get(a), None);
        assert_eq!(t.remove(a), None);
        assert_eq!(t.get(b), Some(&"b"));
    }

    #[test]
    fn test_stale_handle_never_aliases() {
        let mut t = HandleTable::new();
        let old = t.insert(1);
        t.remove(old);
        let new = t.insert(2);

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(t.get(old), None);
        assert_eq!(t.get(new), Some(&2));
    }

    #[test]
    fn test_live_handles_are_unique() {
        let mut t = HandleTable::new();
        let mut live = Vec::new();
        for i in 0..200 {
            live.push(t.insert(i));
            if i % 3 == 0 {
                let h = live.remove(live.len() / 2);
                t.remove(h);
            }
        }
        let raw: HashSet<u64> = live.iter().map(Handle::as_raw).collect();
        assert_eq!(raw.len(), live.len());
        assert_eq!(t.len(), live.len());
        for h in &live {
            assert!(t.contains(*h));
        }
    }

    #[test]
    fn test_limit() {
        let mut t = HandleTable::with_limit(1);
        let a = t.try_insert('a').unwrap();
        assert_eq!(t.try_insert('b'), Err('b'));
        t.remove(a);
        assert!(t.try_insert('c').is_ok());
    }

    #[test]
    fn test_raw_roundtrip() {
        let mut t = HandleTable::new();
        let h = t.insert(());
        t.remove(h);
        let h = t.insert(());
        assert_eq!(Handle::from_raw(h.as_raw()), h);
        assert_eq!(h.generation(), 1);
    }
}
