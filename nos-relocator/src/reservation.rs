//! Process-wide reservation table
//!
//! Every range granted by any relocator is recorded here so unrelated
//! subsystems never receive the same physical memory twice. Ranges the loader
//! itself occupies are recorded with [`Owner::Loader`].

use alloc::vec::Vec;

use crate::error::{RelocatorError, Result};

/// Identifier of one relocator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelocatorId(pub u32);

/// Who holds a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Loader image, heap or stack
    Loader,
    Relocator(RelocatorId),
}

/// One reserved physical range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub start: u64,
    pub end: u64,
    pub owner: Owner,
}

impl Reservation {
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Sorted list of reservations
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    entries: Vec<Reservation>,
}

impl ReservationTable {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// First reservation intersecting `[start, end)`
    pub fn find_overlap(&self, start: u64, end: u64) -> Option<&Reservation> {
        self.entries.iter().find(|r| r.overlaps(start, end))
    }

    /// Record `[start, end)` if nothing else holds any part of it
    pub fn reserve(&mut self, start: u64, end: u64, owner: Owner) -> Result<()> {
        if start >= end {
            return Err(RelocatorError::InvalidArgument("empty reservation"));
        }
        if let Some(existing) = self.find_overlap(start, end) {
            return Err(RelocatorError::Overlap { start: existing.start, end: existing.end });
        }
        self.insert(Reservation { start, end, owner });
        Ok(())
    }

    /// Record `[start, end)` even if it overlaps other owners
    ///
    /// Used by unchecked fixed allocations, whose callers vouch for the range.
    pub fn record(&mut self, start: u64, end: u64, owner: Owner) -> Result<()> {
        if start >= end {
            return Err(RelocatorError::InvalidArgument("empty reservation"));
        }
        self.insert(Reservation { start, end, owner });
        Ok(())
    }

    fn insert(&mut self, reservation: Reservation) {
        let at = self
            .entries
            .partition_point(|r| (r.start, r.end) <= (reservation.start, reservation.end));
        self.entries.insert(at, reservation);
    }

    /// Remove exactly one reservation matching range and owner
    pub fn release(&mut self, start: u64, end: u64, owner: Owner) -> bool {
        match self
            .entries
            .iter()
            .position(|r| r.start == start && r.end == end && r.owner == owner)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove everything held by `owner`, returning how many entries went
    pub fn release_owner(&mut self, owner: Owner) -> usize {
        let before = self.entries.len();
        self.entries.retain(|r| r.owner != owner);
        before - self.entries.len()
    }

    pub fn count_owned_by(&self, owner: Owner) -> usize {
        self.entries.iter().filter(|r| r.owner == owner).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current entries, for before/after comparisons
    pub fn snapshot(&self) -> Vec<Reservation> {
        self.entries.clone()
    }
}
