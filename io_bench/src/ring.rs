//! Round-robin ring of servers currently eligible for new operations.
//!
//! The ring keeps a two-way mapping: `active[i]` is a server index, and
//! `pos[server]` is that server's position in `active` (or NONE when
//! absent). All mutations go through [`ActiveRing::add`] and
//! [`ActiveRing::remove`] so the mapping cannot be broken from outside.

use crate::random::Random;

const NONE: usize = usize::MAX;

/// Client-side list of servers eligible to receive a new operation.
pub struct ActiveRing {
    active: Vec<usize>,
    pos: Vec<usize>,
    next: usize,
}

impl ActiveRing {
    pub fn new(num_servers: usize) -> Self {
        Self {
            active: Vec::with_capacity(num_servers),
            pos: vec![NONE; num_servers],
            next: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[inline]
    pub fn contains(&self, server: usize) -> bool {
        self.pos[server] != NONE
    }

    /// Add a server and swap it to a uniformly random position, so new
    /// servers interleave into the round instead of batching at the
    /// tail.
    pub fn add(&mut self, server: usize, rng: &mut Random) {
        assert_eq!(self.pos[server], NONE);
        self.active.push(server);
        self.pos[server] = self.active.len() - 1;

        let target = rng.urand(self.active.len());
        self.swap(target, self.active.len() - 1);
        debug_assert_eq!(self.pos[server], target);
    }

    /// Remove a server, repairing the round-robin cursor so the element
    /// that was "next" before the removal is still served next.
    pub fn remove(&mut self, server: usize) {
        let at = self.pos[server];
        assert_ne!(at, NONE);

        self.swap(at, self.active.len() - 1);
        self.active.pop();
        self.pos[server] = NONE;

        if self.next == self.active.len() {
            self.next = 0;
        } else if at < self.next {
            self.next -= 1;
            self.swap(at, self.next);
        }
    }

    /// Return the next server in the round and advance the cursor.
    /// Callers must have checked the ring is non-empty.
    pub fn pick(&mut self) -> usize {
        assert!(self.next < self.active.len());
        let server = self.active[self.next];
        self.next += 1;
        if self.next == self.active.len() {
            self.next = 0;
        }
        server
    }

    fn swap(&mut self, i: usize, j: usize) {
        let (a, b) = (self.active[i], self.active[j]);
        self.pos[a] = j;
        self.pos[b] = i;
        self.active.swap(i, j);
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for (i, &server) in self.active.iter().enumerate() {
            assert_eq!(self.pos[server], i);
        }
        for (server, &p) in self.pos.iter().enumerate() {
            if p != NONE {
                assert_eq!(self.active[p], server);
            }
        }
        assert!(self.active.is_empty() || self.next < self.active.len());
    }
}
