/// Property Lookup Cache
///
/// A small direct-mapped L1 in front of own-property lookup, keyed on
/// (object cp, property name) and yielding (pair cp, slot index). Any own
/// property mutation, prototype change, or collection bumps one generation
/// counter, which invalidates every entry at once; coarse, but misses only
/// cost the chain walk.
use crate::config::LOOKUP_CACHE_SIZE;
use crate::heap::Idx;
use crate::object::PropName;

#[derive(Clone, Copy)]
struct Entry {
    generation: u32,
    object: u32,
    name_key: u64,
    pair: u32,
    slot: u8,
}

const EMPTY: Entry = Entry {
    generation: 0,
    object: u32::MAX,
    name_key: u64::MAX,
    pair: 0,
    slot: 0,
};

pub struct LookupCache {
    entries: Box<[Entry]>,
    generation: u32,
    hits: u64,
    misses: u64,
}

impl Default for LookupCache {
    fn default() -> Self {
        LookupCache {
            entries: vec![EMPTY; LOOKUP_CACHE_SIZE].into_boxed_slice(),
            generation: 1,
            hits: 0,
            misses: 0,
        }
    }
}

impl LookupCache {
    #[inline(always)]
    fn bucket(&self, object: Idx, name: PropName) -> usize {
        let h = (object.0 as u64)
            .wrapping_mul(0x9e37_79b9)
            .wrapping_add(name.key());
        (h as usize) & (self.entries.len() - 1)
    }

    #[inline(always)]
    pub fn probe(&mut self, object: Idx, name: PropName) -> Option<(Idx, u8)> {
        let b = self.bucket(object, name);
        let e = self.entries[b];
        if e.generation == self.generation && e.object == object.0 && e.name_key == name.key() {
            self.hits += 1;
            Some((Idx(e.pair), e.slot))
        } else {
            self.misses += 1;
            None
        }
    }

    #[inline(always)]
    pub fn insert(&mut self, object: Idx, name: PropName, pair: Idx, slot: u8) {
        let b = self.bucket(object, name);
        self.entries[b] = Entry {
            generation: self.generation,
            object: object.0,
            name_key: name.key(),
            pair: pair.0,
            slot,
        };
    }

    /// Drop every entry. Called on property mutation, prototype mutation and
    /// after each GC sweep.
    #[inline(always)]
    pub fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            // Wrapped: scrub stale entries that would alias generation 0.
            self.entries.fill(EMPTY);
            self.generation = 1;
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_after_insert_hits() {
        let mut cache = LookupCache::default();
        let obj = Idx(5);
        let name = PropName::Magic(3);
        assert!(cache.probe(obj, name).is_none());
        cache.insert(obj, name, Idx(9), 1);
        assert_eq!(cache.probe(obj, name), Some((Idx(9), 1)));
    }

    #[test]
    fn invalidate_clears_all() {
        let mut cache = LookupCache::default();
        cache.insert(Idx(1), PropName::Index(0), Idx(2), 0);
        cache.invalidate();
        assert!(cache.probe(Idx(1), PropName::Index(0)).is_none());
    }

    #[test]
    fn distinct_names_do_not_alias() {
        let mut cache = LookupCache::default();
        cache.insert(Idx(1), PropName::Magic(1), Idx(2), 0);
        assert!(cache.probe(Idx(1), PropName::Magic(2)).is_none());
        assert!(cache.probe(Idx(2), PropName::Magic(1)).is_none());
    }

    #[test]
    fn hit_rate_tracks() {
        let mut cache = LookupCache::default();
        cache.insert(Idx(1), PropName::Index(1), Idx(3), 0);
        let _ = cache.probe(Idx(1), PropName::Index(1));
        let _ = cache.probe(Idx(1), PropName::Index(2));
        assert!(cache.hit_rate() > 0.4 && cache.hit_rate() < 0.6);
    }
}
