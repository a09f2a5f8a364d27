// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conntrack-zone allocation.
//!
//! Each guest NIC gets a stable uint16 conntrack zone derived from its
//! MAC address: FNV-32 of the textual MAC modulo the slot space, with
//! linear probing on collision. The mapping lives only in memory; it is
//! rebuilt deterministically enough on restart because probing starts
//! from the same hash.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("conntrack zones exhausted ({0} slots in use)")]
    Full(usize),
}

/// Bijection MAC ↔ zone slot.
#[derive(Debug)]
pub struct CtZoneBook {
    base: u16,
    by_mac: HashMap<String, u32>,
    by_slot: HashMap<u32, String>,
}

impl CtZoneBook {
    pub fn new(base: u16) -> Self {
        CtZoneBook { base, by_mac: HashMap::new(), by_slot: HashMap::new() }
    }

    fn slots(&self) -> u32 {
        (u16::MAX as u32 + 1) - self.base as u32
    }

    /// The zone id for `mac`, allocating one if needed. Fails only when
    /// every slot is taken.
    pub fn alloc(&mut self, mac: &str) -> Result<u16, Error> {
        if let Some(&slot) = self.by_mac.get(mac) {
            return Ok(self.base + slot as u16);
        }

        let slots = self.slots();
        if self.by_mac.len() as u32 >= slots {
            return Err(Error::Full(self.by_mac.len()));
        }

        let mut slot = fnv32(mac.as_bytes()) % slots;
        while self.by_slot.contains_key(&slot) {
            slot = (slot + 1) % slots;
        }
        self.by_mac.insert(mac.to_string(), slot);
        self.by_slot.insert(slot, mac.to_string());
        Ok(self.base + slot as u16)
    }

    /// Release `mac`'s zone, returning whether it was allocated.
    pub fn free(&mut self, mac: &str) -> bool {
        match self.by_mac.remove(mac) {
            Some(slot) => {
                self.by_slot.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, mac: &str) -> Option<u16> {
        self.by_mac.get(mac).map(|&slot| self.base + slot as u16)
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }
}

fn fnv32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_alloc_is_stable() {
        let mut book = CtZoneBook::new(1000);
        let id1 = book.alloc("aa:bb:cc:dd:ee:01").unwrap();
        let id2 = book.alloc("aa:bb:cc:dd:ee:02").unwrap();
        assert_ne!(id1, id2);
        assert!(id1 >= 1000);
        assert!(id2 >= 1000);
        // Repeated allocation returns the same id.
        assert_eq!(book.alloc("aa:bb:cc:dd:ee:01").unwrap(), id1);
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn test_free_then_realloc_never_collides() {
        let mut book = CtZoneBook::new(1000);
        let mut live = Vec::new();
        for i in 0..64 {
            let mac = format!("aa:bb:cc:dd:ee:{:02x}", i);
            live.push((mac.clone(), book.alloc(&mac).unwrap()));
        }
        let (freed_mac, _) = live.remove(10);
        assert!(book.free(&freed_mac));
        assert!(!book.free(&freed_mac));

        let id = book.alloc("11:22:33:44:55:66").unwrap();
        for (_, other) in &live {
            assert_ne!(id, *other);
        }
    }

    #[test]
    fn test_depletion() {
        // A tiny slot space: base leaves 4 slots.
        let mut book = CtZoneBook::new(u16::MAX - 3);
        for i in 0..4 {
            book.alloc(&format!("mac{}", i)).unwrap();
        }
        assert!(matches!(book.alloc("overflow"), Err(Error::Full(4))));
        book.free("mac0");
        assert!(book.alloc("overflow").is_ok());
    }

    #[test]
    fn test_probe_resolves_collisions() {
        let mut book = CtZoneBook::new(u16::MAX - 7);
        // With 8 slots, several of these must hash-collide; all get
        // distinct ids anyway.
        let mut seen = std::collections::HashSet::new();
        for i in 0..8 {
            let id = book.alloc(&format!("m{}", i)).unwrap();
            assert!(seen.insert(id));
        }
    }
}
