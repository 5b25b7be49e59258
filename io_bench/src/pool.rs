//! Object pools with optional offcache recycling.

use std::collections::VecDeque;

/// An item a [`Pool`] can construct on demand.
pub trait PoolItem {
    /// Construct a fresh item of the pool's configured size.
    fn alloc(size: usize) -> Self;
}

/// LIFO free-stack pool.
///
/// With an offcache depth of D, the pool keeps D items in a FIFO ring
/// so repeated `get()` calls cycle through D distinct items before
/// reusing any one. This defeats CPU-cache reuse of a just-released
/// buffer, to measure cold-memory behavior.
pub struct Pool<T: PoolItem> {
    free: Vec<T>,
    offcache: VecDeque<T>,
    item_size: usize,
    allocated: u32,
    name: &'static str,
}

impl<T: PoolItem> Pool<T> {
    pub fn new(item_size: usize, name: &'static str) -> Self {
        Self::with_offcache(item_size, name, 0)
    }

    pub fn with_offcache(item_size: usize, name: &'static str, offcache: usize) -> Self {
        let mut pool = Self {
            free: Vec::new(),
            offcache: VecDeque::with_capacity(offcache),
            item_size,
            allocated: 0,
            name,
        };
        for _ in 0..offcache {
            let item = pool.get_free();
            pool.offcache.push_back(item);
        }
        pool
    }

    fn get_free(&mut self) -> T {
        match self.free.pop() {
            Some(item) => item,
            None => {
                self.allocated += 1;
                T::alloc(self.item_size)
            }
        }
    }

    /// Take an item; with offcache enabled, the freshly taken item is
    /// enqueued and the oldest offcache item returned instead.
    #[inline]
    pub fn get(&mut self) -> T {
        let item = self.get_free();
        if self.offcache.is_empty() {
            item
        } else {
            self.offcache.push_back(item);
            self.offcache.pop_front().unwrap()
        }
    }

    /// Return an item to the free stack.
    #[inline]
    pub fn put(&mut self, item: T) {
        self.free.push(item);
    }

    /// Total number of items ever constructed.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Item size this pool constructs with.
    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: PoolItem> Drop for Pool<T> {
    fn drop(&mut self) {
        let held = self.free.len() + self.offcache.len();
        if self.allocated as usize != held {
            tracing::warn!(
                "{} buffers were not released from {}",
                self.allocated as usize - held,
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test item that remembers its identity.
    struct Item {
        size: usize,
        serial: usize,
    }

    use std::cell::Cell;
    thread_local! {
        static NEXT_SERIAL: Cell<usize> = const { Cell::new(0) };
    }

    impl PoolItem for Item {
        fn alloc(size: usize) -> Self {
            let serial = NEXT_SERIAL.with(|c| {
                let v = c.get();
                c.set(v + 1);
                v
            });
            Item { size, serial }
        }
    }

    #[test]
    fn test_get_put_lifo() {
        let mut pool: Pool<Item> = Pool::new(64, "items");
        let a = pool.get();
        assert_eq!(a.size, 64);
        assert_eq!(pool.allocated(), 1);

        let a_serial = a.serial;
        pool.put(a);
        let b = pool.get();
        assert_eq!(b.serial, a_serial);
        assert_eq!(pool.allocated(), 1);
        pool.put(b);
    }

    #[test]
    fn test_put_get_stable_allocation() {
        let mut pool: Pool<Item> = Pool::new(8, "items");
        let items: Vec<Item> = (0..10).map(|_| pool.get()).collect();
        assert_eq!(pool.allocated(), 10);
        for item in items {
            pool.put(item);
        }
        let again: Vec<Item> = (0..10).map(|_| pool.get()).collect();
        assert_eq!(pool.allocated(), 10);
        for item in again {
            pool.put(item);
        }
    }

    #[test]
    fn test_offcache_cycles_distinct_items() {
        const DEPTH: usize = 4;
        let mut pool: Pool<Item> = Pool::with_offcache(8, "items", DEPTH);

        // D+1 consecutive gets without put return D+1 distinct items.
        let mut serials = Vec::new();
        let mut items = Vec::new();
        for _ in 0..=DEPTH {
            let item = pool.get();
            serials.push(item.serial);
            items.push(item);
        }
        let mut unique = serials.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), DEPTH + 1);
        for item in items {
            pool.put(item);
        }
    }

    #[test]
    fn test_offcache_defers_reuse() {
        const DEPTH: usize = 3;
        let mut pool: Pool<Item> = Pool::with_offcache(8, "items", DEPTH);

        // A released item comes back only after cycling the offcache.
        let first = pool.get();
        let first_serial = first.serial;
        pool.put(first);
        for _ in 0..DEPTH {
            let item = pool.get();
            assert_ne!(item.serial, first_serial);
            pool.put(item);
        }
    }
}
