use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hash, Hasher};

use siphasher::sip128::{Hasher128, SipHasher13};

use crate::key::CallKey;

/// A map bucketed by the hash a [`CallKey`] computed on construction.
pub(crate) type KeyMap<V> = HashMap<CallKey, V, BuildHasherDefault<Prehashed>>;

/// Produce a 128-bit hash of a value.
#[inline]
pub fn hash<T: Hash + ?Sized>(value: &T) -> u128 {
    let mut state = SipHasher13::new();
    value.hash(&mut state);
    state.finish128().as_u128()
}

/// Folds the parts of a call key into a single 128-bit hash.
pub struct KeyHasher(SipHasher13);

impl KeyHasher {
    pub fn new() -> Self {
        Self(SipHasher13::new())
    }

    /// Mix in a plain integer part.
    #[inline]
    pub fn write_u64(&mut self, part: u64) {
        self.0.write_u64(part);
    }

    /// Mix in an already hashed part.
    #[inline]
    pub fn write_u128(&mut self, part: u128) {
        self.0.write_u128(part);
    }

    pub fn finish(self) -> u128 {
        self.0.finish128().as_u128()
    }
}

/// Takes over the precomputed hash that call keys feed through `write_u128`.
#[derive(Default)]
pub(crate) struct Prehashed(u64);

impl Hasher for Prehashed {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, _: &[u8]) {
        unreachable!("memograph: call keys only hash through `write_u128`")
    }

    #[inline]
    fn write_u128(&mut self, hash: u128) {
        // The high half is left for shard selection.
        self.0 = hash as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hasher_is_order_sensitive() {
        let mut a = KeyHasher::new();
        a.write_u128(hash(&1u32));
        a.write_u128(hash(&2u32));

        let mut b = KeyHasher::new();
        b.write_u128(hash(&2u32));
        b.write_u128(hash(&1u32));

        assert_ne!(a.finish(), b.finish());
    }
}
