// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Export-Id Allocator
//!
//! Presence set over all 65536 export ids. The check for a free id and the
//! marking of that id as used happen under one lock acquisition, so two
//! concurrent provisions can never be handed the same id.

use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::export::{ExportId, EXPORT_ID_SLOTS};

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = EXPORT_ID_SLOTS / WORD_BITS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("all {0} export ids are in use")]
    Exhausted(usize),
}

pub struct ExportIdAllocator {
    used: Mutex<Bitmap>,
}

struct Bitmap {
    words: Box<[u64; WORDS]>,
    in_use: usize,
}

impl Bitmap {
    fn is_set(&self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        self.words[word] & (1 << bit) != 0
    }

    fn set(&mut self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        let was_set = self.words[word] & (1 << bit) != 0;
        if !was_set {
            self.words[word] |= 1 << bit;
            self.in_use += 1;
        }
        !was_set
    }

    fn clear(&mut self, id: u16) -> bool {
        let (word, bit) = Self::locate(id);
        let was_set = self.words[word] & (1 << bit) != 0;
        if was_set {
            self.words[word] &= !(1 << bit);
            self.in_use -= 1;
        }
        was_set
    }

    fn first_clear(&self) -> Option<u16> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            (*word != u64::MAX).then(|| (i * WORD_BITS + word.trailing_ones() as usize) as u16)
        })
    }

    fn locate(id: u16) -> (usize, u32) {
        let id = id as usize;
        (id / WORD_BITS, (id % WORD_BITS) as u32)
    }
}

impl ExportIdAllocator {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(Bitmap {
                words: Box::new([0u64; WORDS]),
                in_use: 0,
            }),
        }
    }

    /// Allocator with `ids` already marked as used
    pub fn with_reserved(ids: impl IntoIterator<Item = ExportId>) -> Self {
        let allocator = Self::new();
        for id in ids {
            allocator.reserve(id);
        }
        allocator
    }

    /// Reserve the lowest free id
    pub fn allocate(&self) -> Result<ExportId, AllocatorError> {
        let mut used = self.used.lock();
        let id = used
            .first_clear()
            .ok_or(AllocatorError::Exhausted(EXPORT_ID_SLOTS))?;
        used.set(id);
        Ok(ExportId(id))
    }

    /// Mark a specific id as used. Returns false if it already was.
    pub fn reserve(&self, id: ExportId) -> bool {
        self.used.lock().set(id.0)
    }

    /// Mark an id as free. Freeing a free id is a no-op; returns whether the
    /// id was in use.
    pub fn free(&self, id: ExportId) -> bool {
        self.used.lock().clear(id.0)
    }

    pub fn is_allocated(&self, id: ExportId) -> bool {
        self.used.lock().is_set(id.0)
    }

    /// Number of ids currently in use
    pub fn in_use(&self) -> usize {
        self.used.lock().in_use
    }
}

impl Default for ExportIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocates_lowest_free_id() {
        let allocator = ExportIdAllocator::new();
        assert_eq!(allocator.allocate().unwrap(), ExportId(0));
        assert_eq!(allocator.allocate().unwrap(), ExportId(1));
        assert_eq!(allocator.allocate().unwrap(), ExportId(2));

        allocator.free(ExportId(1));
        assert_eq!(allocator.allocate().unwrap(), ExportId(1));
        assert_eq!(allocator.allocate().unwrap(), ExportId(3));
    }

    #[test]
    fn test_reserved_ids_are_skipped() {
        let allocator = ExportIdAllocator::with_reserved([ExportId(0), ExportId(1), ExportId(5)]);
        assert_eq!(allocator.in_use(), 3);
        assert_eq!(allocator.allocate().unwrap(), ExportId(2));
        assert!(!allocator.reserve(ExportId(5)));
    }

    #[test]
    fn test_free_is_idempotent() {
        let allocator = ExportIdAllocator::new();

        // never allocated
        assert!(!allocator.free(ExportId(9)));
        assert_eq!(allocator.in_use(), 0);

        let id = allocator.allocate().unwrap();
        assert!(allocator.free(id));
        assert!(!allocator.free(id));
        assert_eq!(allocator.in_use(), 0);

        assert_eq!(allocator.allocate().unwrap(), ExportId(0));
        assert_eq!(allocator.allocate().unwrap(), ExportId(1));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let allocator = ExportIdAllocator::new();
        for expected in 0..EXPORT_ID_SLOTS {
            assert_eq!(allocator.allocate().unwrap(), ExportId(expected as u16));
        }
        assert_eq!(allocator.in_use(), EXPORT_ID_SLOTS);
        assert_eq!(
            allocator.allocate(),
            Err(AllocatorError::Exhausted(EXPORT_ID_SLOTS))
        );

        allocator.free(ExportId(40000));
        assert_eq!(allocator.allocate().unwrap(), ExportId(40000));
        assert!(allocator.allocate().is_err());

        allocator.free(ExportId(u16::MAX));
        assert_eq!(allocator.allocate().unwrap(), ExportId(u16::MAX));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let allocator = Arc::new(ExportIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| allocator.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(allocator.in_use(), 4000);
    }
}
