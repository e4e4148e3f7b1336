//! Bounded cache of seen AEAD nonces for replay protection.
//!
//! Session envelopes carry random 96-bit nonces, so there is no sequence to slide a
//! window over. Instead the cache remembers the most recent `capacity` nonces that
//! authenticated successfully and rejects any repeat of them.
//!
//! # Design
//!
//! - Capacity: 4096 nonces (configurable)
//! - When full, the oldest nonce is forgotten first
//! - Callers check before decrypting and record only after the tag verified
//!
//! # Thread Safety
//!
//! This implementation is NOT thread-safe. Wrap in a Mutex if needed.

use std::collections::{HashSet, VecDeque};

pub type Nonce = [u8; 12];

#[derive(Debug, Clone)]
pub struct NonceCache {
    seen: HashSet<Nonce>,
    order: VecDeque<Nonce>,
    capacity: usize,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceCache {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// # Panics
    /// Panics if capacity is 0.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "nonce cache capacity must be non-zero");
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `nonce` has not been recorded. Does NOT update state.
    pub fn check(&self, nonce: &Nonce) -> bool {
        !self.seen.contains(nonce)
    }

    /// Check and record: returns true if fresh, false if already seen.
    pub fn check_and_insert(&mut self, nonce: Nonce) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
