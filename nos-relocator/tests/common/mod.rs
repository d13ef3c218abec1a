//! Common test utilities for relocator integration tests

#![allow(dead_code)]

use std::ptr::NonNull;

use nos_relocator::{
    CpuMode, Machine, MemoryKind, MemoryMap, MemoryRegion, RelocatorConfig, RelocatorContext,
    StaticMemoryMap,
};

/// Simulated physical memory `[0, len)` backed by a leaked host buffer
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    base: usize,
    len: usize,
}

impl Arena {
    pub fn new(len: usize) -> Self {
        let memory: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self { base: memory.as_mut_ptr() as usize, len }
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// Copy of `[addr, addr + len)`
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        assert!(addr as usize + len <= self.len, "read outside the arena");
        let start = (self.base + addr as usize) as *const u8;
        // SAFETY: the arena is leaked and stays valid for the whole test run.
        unsafe { std::slice::from_raw_parts(start, len).to_vec() }
    }
}

/// Machine whose physical memory is an [`Arena`]; the jump panics
#[derive(Debug, Clone, Copy)]
pub struct ArenaMachine {
    pub arena: Arena,
    pub mode: CpuMode,
}

unsafe impl Machine for ArenaMachine {
    fn cpu_mode(&self) -> CpuMode {
        self.mode
    }

    fn direct_access(&self, target: u64, size: u64) -> Option<NonNull<u8>> {
        if target.checked_add(size)? > self.arena.len() {
            return None;
        }
        NonNull::new((self.arena.base + target as usize) as *mut u8)
    }

    unsafe fn jump(&self, entry: u64) -> ! {
        panic!("jump to {:#x}", entry)
    }
}

/// Machine with no direct mapping; every chunk is staged in a heap buffer
#[derive(Debug, Clone, Copy)]
pub struct BufferedMachine(pub CpuMode);

unsafe impl Machine for BufferedMachine {
    fn cpu_mode(&self) -> CpuMode {
        self.0
    }

    fn direct_access(&self, _target: u64, _size: u64) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn jump(&self, entry: u64) -> ! {
        panic!("jump to {:#x}", entry)
    }
}

/// BIOS-style low memory: IVT/BDA reserved, conventional memory free,
/// video and ROM area reserved
pub fn low_memory_map() -> StaticMemoryMap {
    StaticMemoryMap::new()
        .with_region(0, 0x500, MemoryKind::Reserved)
        .with_region(0x500, 0xA0000 - 0x500, MemoryKind::Available)
        .with_region(0xA0000, 0x60000, MemoryKind::Reserved)
}

/// Context over a 1 MiB arena with the BIOS low-memory map
pub fn arena_context(mode: CpuMode) -> (RelocatorContext, Arena) {
    arena_context_with(low_memory_map(), 0x10_0000, mode, RelocatorConfig::default())
}

pub fn arena_context_with(
    map: StaticMemoryMap,
    arena_len: usize,
    mode: CpuMode,
    config: RelocatorConfig,
) -> (RelocatorContext, Arena) {
    let arena = Arena::new(arena_len);
    let context =
        RelocatorContext::new(map, ArenaMachine { arena, mode }, config).expect("valid config");
    (context, arena)
}

pub fn buffered_context(map: StaticMemoryMap, mode: CpuMode) -> RelocatorContext {
    RelocatorContext::new(map, BufferedMachine(mode), RelocatorConfig::default())
        .expect("valid config")
}

/// Per-byte freedom over `[0, len)` as the planner must see it: covered by a
/// free region and by no non-free region
pub fn free_bitmap(map: &dyn MemoryMap, len: usize, avoid_boot_services: bool) -> Vec<bool> {
    let mut free = vec![false; len];
    let mut blocked = vec![false; len];
    map.iterate(&mut |region: &MemoryRegion| {
        let start = (region.start as usize).min(len);
        let end = (region.end() as usize).min(len);
        let target =
            if region.kind.is_free(avoid_boot_services) { &mut free } else { &mut blocked };
        target[start..end].iter_mut().for_each(|b| *b = true);
        true
    });
    free.iter().zip(&blocked).map(|(f, b)| *f && !*b).collect()
}

pub fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

pub fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}
