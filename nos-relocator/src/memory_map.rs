//! Firmware memory map
//!
//! The relocator never enumerates firmware memory itself. Platform glue hands
//! it a [`MemoryMap`] oracle which reports physical ranges and their
//! firmware-assigned usage class.

use alloc::vec::Vec;

/// Memory Types for E820
pub const E820_TYPE_USABLE: u32 = 1;
pub const E820_TYPE_RESERVED: u32 = 2;
pub const E820_TYPE_ACPI_RECLAIMABLE: u32 = 3;
pub const E820_TYPE_NVS: u32 = 4;
pub const E820_TYPE_BADRAM: u32 = 5;
pub const E820_TYPE_PERSISTENT: u32 = 7;

/// Firmware usage class of a physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Conventional RAM, free for the taking
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    /// Firmware boot-services code/data, free once firmware hands over
    BootServices,
    /// Firmware runtime services, never free
    RuntimeServices,
    Persistent,
}

impl MemoryKind {
    /// Decode an E820 type field
    pub fn from_e820(type_: u32) -> Self {
        match type_ {
            E820_TYPE_USABLE => MemoryKind::Available,
            E820_TYPE_ACPI_RECLAIMABLE => MemoryKind::AcpiReclaimable,
            E820_TYPE_NVS => MemoryKind::AcpiNvs,
            E820_TYPE_BADRAM => MemoryKind::BadMemory,
            E820_TYPE_PERSISTENT => MemoryKind::Persistent,
            _ => MemoryKind::Reserved,
        }
    }

    /// Whether a chunk may be placed here
    pub fn is_free(self, avoid_boot_services: bool) -> bool {
        match self {
            MemoryKind::Available => true,
            MemoryKind::BootServices => !avoid_boot_services,
            _ => false,
        }
    }
}

/// One entry of the firmware memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    pub const fn new(start: u64, size: u64, kind: MemoryKind) -> Self {
        Self { start, size, kind }
    }

    /// End address (exclusive), saturating at the top of the address space
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }
}

/// Memory-map oracle
///
/// `iterate` calls `f` once per region until `f` returns `false`. Regions may
/// come in any order and may overlap; a byte is free only if some free region
/// covers it and no non-free region does.
pub trait MemoryMap {
    fn iterate(&self, f: &mut dyn FnMut(&MemoryRegion) -> bool);
}

/// E820 Memory Map Entry Structure
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct E820Entry {
    pub base_addr: u64,
    pub length: u64,
    pub type_: u32,
    pub acpi_attrs: u32,
}

/// Memory map held in a vector, built by platform glue or tests
#[derive(Debug, Clone, Default)]
pub struct StaticMemoryMap {
    regions: Vec<MemoryRegion>,
}

impl StaticMemoryMap {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    /// Add a region, skipping empty ones
    pub fn with_region(mut self, start: u64, size: u64, kind: MemoryKind) -> Self {
        self.push(MemoryRegion::new(start, size, kind));
        self
    }

    pub fn push(&mut self, region: MemoryRegion) {
        if region.size != 0 {
            self.regions.push(region);
        }
    }

    /// Build from a raw E820 table
    pub fn from_e820(entries: &[E820Entry]) -> Self {
        let mut map = Self::new();
        for entry in entries {
            let (base, length, type_) = (entry.base_addr, entry.length, entry.type_);
            map.push(MemoryRegion::new(base, length, MemoryKind::from_e820(type_)));
        }
        map
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

impl MemoryMap for StaticMemoryMap {
    fn iterate(&self, f: &mut dyn FnMut(&MemoryRegion) -> bool) {
        for region in &self.regions {
            if !f(region) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_e820_types() {
        assert_eq!(MemoryKind::from_e820(1), MemoryKind::Available);
        assert_eq!(MemoryKind::from_e820(3), MemoryKind::AcpiReclaimable);
        assert_eq!(MemoryKind::from_e820(4), MemoryKind::AcpiNvs);
        assert_eq!(MemoryKind::from_e820(0), MemoryKind::Reserved);
        assert_eq!(MemoryKind::from_e820(42), MemoryKind::Reserved);
    }

    #[test]
    fn test_boot_services_freedom() {
        assert!(MemoryKind::BootServices.is_free(false));
        assert!(!MemoryKind::BootServices.is_free(true));
        assert!(!MemoryKind::AcpiNvs.is_free(false));
    }

    #[test]
    fn test_static_map_from_e820() {
        let table = [
            E820Entry { base_addr: 0, length: 0x9FC00, type_: E820_TYPE_USABLE, acpi_attrs: 0 },
            E820Entry {
                base_addr: 0x9FC00,
                length: 0x400,
                type_: E820_TYPE_RESERVED,
                acpi_attrs: 0,
            },
            E820Entry { base_addr: 0x10_0000, length: 0, type_: E820_TYPE_USABLE, acpi_attrs: 0 },
        ];
        let map = StaticMemoryMap::from_e820(&table);
        assert_eq!(map.regions().len(), 2);
        assert_eq!(map.regions()[1].kind, MemoryKind::Reserved);
    }

    #[test]
    fn test_iterate_stops_early() {
        let map = StaticMemoryMap::new()
            .with_region(0, 0x1000, MemoryKind::Available)
            .with_region(0x1000, 0x1000, MemoryKind::Reserved)
            .with_region(0x2000, 0x1000, MemoryKind::Available);
        let mut seen = 0;
        map.iterate(&mut |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_region_end_saturates() {
        let region = MemoryRegion::new(u64::MAX - 1, 16, MemoryKind::Reserved);
        assert_eq!(region.end(), u64::MAX);
        assert!(region.overlaps(u64::MAX - 2, u64::MAX));
    }
}
