//! Index-based storage for IR entities.
//!
//! Operations, values and blocks are stored contiguously and addressed by
//! typed `Id<T>` handles. Nothing is ever deallocated individually: erased
//! operations stay in their arena and are flagged instead, so handles held by
//! analyses never dangle.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed ID
// =============================================================================

/// A type-safe handle into an `Arena<T>`.
pub struct Id<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Id {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.raw
    }

    #[inline]
    const fn slot(self) -> usize {
        self.raw as usize
    }
}

// Derives would require `T: Trait`; handles compare by index only.
impl<T> Copy for Id<T> {}
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Id<T> {}
impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}
impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw)
    }
}
impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Append-only storage for homogeneous items.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Store `item` and return its handle.
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    /// Number of items ever allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.slot()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.slot()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Dense side table keyed by arena handles.
///
/// Holds derived data such as the use-list index, which must be
/// recomputable from the primary arenas at any time. Missing slots read as
/// absent and are filled with `V::default()` on first write.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    slots: Vec<V>,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Map with `capacity` default slots.
    pub fn with_capacity(capacity: usize) -> Self {
        SecondaryMap {
            slots: vec![V::default(); capacity],
            _marker: PhantomData,
        }
    }

    pub fn get(&self, id: Id<K>) -> Option<&V> {
        self.slots.get(id.slot())
    }

    /// Mutable slot for `id`, growing the table if needed.
    pub fn slot(&mut self, id: Id<K>) -> &mut V {
        let at = id.slot();
        if at >= self.slots.len() {
            self.slots.resize_with(at + 1, V::default);
        }
        &mut self.slots[at]
    }

    /// Iterate over present slots in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (Id<K>, &V)> {
        (0u32..).zip(&self.slots).map(|(raw, v)| (Id::new(raw), v))
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
