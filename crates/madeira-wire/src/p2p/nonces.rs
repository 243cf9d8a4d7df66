// SPDX-License-Identifier: MIT

//! Connection nonces. Every live connection owns one 64-bit nonce that
//! goes out in our version message; an inbound version carrying a nonce
//! from this set means we dialed ourselves.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

pub struct NonceRegistry {
    set: HashSet<u64>,
    rng: StdRng,
}

impl Default for NonceRegistry {
    fn default() -> Self {
        NonceRegistry::new()
    }
}

impl NonceRegistry {
    pub fn new() -> Self {
        NonceRegistry {
            set: HashSet::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Draw a fresh nonce, distinct from every live one, and remember it.
    pub fn alloc(&mut self) -> u64 {
        loop {
            let nonce = self.rng.gen::<u64>();

            if nonce != 0 && self.set.insert(nonce) {
                return nonce;
            }
        }
    }

    pub fn has(&self, nonce: u64) -> bool {
        self.set.contains(&nonce)
    }

    pub fn remove(&mut self, nonce: u64) -> bool {
        self.set.remove(&nonce)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::NonceRegistry;

    #[test]
    fn test_alloc_is_unique_and_tracked() {
        let mut nonces = NonceRegistry::new();

        let a = nonces.alloc();
        let b = nonces.alloc();

        assert_ne!(a, b);
        assert!(nonces.has(a));
        assert!(nonces.has(b));
        assert_eq!(nonces.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut nonces = NonceRegistry::new();
        let nonce = nonces.alloc();

        assert!(nonces.remove(nonce));
        assert!(!nonces.has(nonce));
        assert!(!nonces.remove(nonce));
        assert!(nonces.is_empty());
    }
}
