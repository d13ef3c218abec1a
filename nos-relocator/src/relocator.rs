//! Chunk planner
//!
//! A [`Relocator`] collects the chunks of one boot attempt. Each chunk has a
//! target (where the payload must end up) and a staging area (where the
//! loader writes it now). Targets are granted from the memory-map oracle and
//! recorded in the context's reservation table under one lock, so two
//! relocators never receive overlapping memory.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use crate::compiler::{check_transition, TrampolineCompiler};
use crate::context::{self, RelocatorContext};
use crate::copy::CopyOp;
use crate::emitter::Program;
use crate::error::{RelocatorError, Result};
use crate::memory_map::{MemoryMap, MemoryRegion};
use crate::reservation::{Owner, RelocatorId, ReservationTable};
use crate::state::BootState;

/// Which fitting address `alloc_in_range` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    /// Lowest fitting address
    #[default]
    Low,
    /// Highest fitting address
    High,
    /// Lowest address of the smallest free window that fits
    Any,
}

/// Handle of a chunk inside its relocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u32);

enum Staging {
    /// The target itself, written through the machine's direct mapping
    InPlace(NonNull<u8>),
    /// Loader heap buffer, copied to the target by the trampoline
    Buffer(Box<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagingPolicy {
    Auto,
    Buffer,
    InPlace,
}

/// One relocation unit
pub struct Chunk {
    id: ChunkId,
    target: u64,
    size: u64,
    staging_addr: u64,
    staging: Staging,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Physical address the bytes must occupy at handoff
    pub fn target_addr(&self) -> u64 {
        self.target
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last target byte
    pub fn end(&self) -> u64 {
        self.target + self.size
    }

    /// Physical address the trampoline copies from
    pub fn staging_addr(&self) -> u64 {
        self.staging_addr
    }

    /// Whether the staging area is a buffer owned by the chunk
    pub fn owns_memory(&self) -> bool {
        matches!(self.staging, Staging::Buffer(_))
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.target < end && start < self.end()
    }

    /// Pointer the loader writes the payload through
    pub fn staging_ptr(&mut self) -> NonNull<u8> {
        match &mut self.staging {
            Staging::InPlace(ptr) => *ptr,
            Staging::Buffer(buffer) => NonNull::from(&mut buffer[..]).cast(),
        }
    }

    pub fn staging(&self) -> &[u8] {
        match &self.staging {
            // SAFETY: `Machine::direct_access` guarantees `size` valid bytes
            // for the lifetime of the boot attempt.
            Staging::InPlace(ptr) => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), self.size as usize)
            },
            Staging::Buffer(buffer) => buffer,
        }
    }

    pub fn staging_mut(&mut self) -> &mut [u8] {
        match &mut self.staging {
            // SAFETY: as in `staging`; `&mut self` makes the access exclusive.
            Staging::InPlace(ptr) => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize)
            },
            Staging::Buffer(buffer) => buffer,
        }
    }

    /// Copy `bytes` into the staging area at `offset`
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| RelocatorError::InvalidArgument("offset out of range"))?;
        let end = start
            .checked_add(bytes.len())
            .ok_or(RelocatorError::InvalidArgument("write past end of chunk"))?;
        self.staging_mut()
            .get_mut(start..end)
            .ok_or(RelocatorError::InvalidArgument("write past end of chunk"))?
            .copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("target", &format_args!("{:#x}", self.target))
            .field("size", &format_args!("{:#x}", self.size))
            .field("staging", &format_args!("{:#x}", self.staging_addr))
            .field("owns_memory", &self.owns_memory())
            .finish()
    }
}

/// Planner for one boot attempt
pub struct Relocator<'ctx> {
    id: RelocatorId,
    context: &'ctx RelocatorContext,
    chunks: Vec<Chunk>,
    next_chunk: u32,
    frozen: bool,
}

impl Relocator<'static> {
    /// Relocator bound to the installed global context
    pub fn new() -> Result<Self> {
        Ok(Self::new_in(context::global()?))
    }
}

impl<'ctx> Relocator<'ctx> {
    pub fn new_in(context: &'ctx RelocatorContext) -> Self {
        Self {
            id: context.allocate_id(),
            context,
            chunks: Vec::new(),
            next_chunk: 0,
            frozen: false,
        }
    }

    pub fn id(&self) -> RelocatorId {
        self.id
    }

    pub fn context(&self) -> &'ctx RelocatorContext {
        self.context
    }

    /// Whether the program has been compiled
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn owner(&self) -> Owner {
        Owner::Relocator(self.id)
    }

    /// Chunk pinned at `target`, checked against the memory map, every
    /// reservation and this relocator's chunks
    pub fn alloc_fixed(&mut self, target: u64, size: u64) -> Result<ChunkId> {
        let end = self.validate(target, size)?;
        {
            let mut table = self.context.lock();
            if let Some(existing) = table.find_overlap(target, end) {
                return Err(RelocatorError::Overlap { start: existing.start, end: existing.end });
            }
            check_free(self.context.memory_map(), target, end)?;
            table.reserve(target, end, self.owner())?;
        }
        self.attach(target, size, StagingPolicy::Auto)
    }

    /// Chunk pinned at `target` without consulting the memory map or other
    /// owners
    ///
    /// The range is still recorded so later checked allocations avoid it.
    /// Staging is always a loader buffer since the target may hold live data.
    pub fn alloc_fixed_unchecked(&mut self, target: u64, size: u64) -> Result<ChunkId> {
        let end = self.validate(target, size)?;
        if let Some(chunk) = self.chunks.iter().find(|c| c.overlaps(target, end)) {
            return Err(RelocatorError::Overlap { start: chunk.target, end: chunk.end() });
        }
        log::warn!("Unchecked fixed chunk at [{:#x}, {:#x})", target, end);
        self.context.lock().record(target, end, self.owner())?;
        self.attach(target, size, StagingPolicy::Buffer)
    }

    /// Chunk somewhere in `[min, max)` on an `align` boundary
    pub fn alloc_in_range(
        &mut self,
        min: u64,
        max: u64,
        size: u64,
        align: u64,
        preference: Preference,
        avoid_firmware_boot_services: bool,
    ) -> Result<ChunkId> {
        self.check_request(size)?;
        if !align.is_power_of_two() {
            return Err(RelocatorError::InvalidArgument("alignment must be a power of two"));
        }
        if min > max {
            return Err(RelocatorError::InvalidArgument("min above max"));
        }
        let target =
            self.find_and_reserve(min, max, size, align, preference, avoid_firmware_boot_services)?;
        self.attach(target, size, StagingPolicy::Auto)
    }

    /// Like [`alloc_in_range`](Self::alloc_in_range), for callers that pass
    /// "anywhere": `max` is cut to what the loader's CPU mode can address and
    /// `min` is raised to the configured low-memory floor
    pub fn alloc_in_range_clamped(
        &mut self,
        min: u64,
        max: u64,
        size: u64,
        align: u64,
        preference: Preference,
        avoid_firmware_boot_services: bool,
    ) -> Result<ChunkId> {
        let min = min.max(self.context.config().low_memory_floor);
        let max = max.min(self.context.machine().cpu_mode().reach());
        if min >= max {
            return Err(RelocatorError::OutOfMemory);
        }
        self.alloc_in_range(min, max, size, align, preference, avoid_firmware_boot_services)
    }

    /// Release one chunk and its reservation
    pub fn free(&mut self, id: ChunkId) -> Result<()> {
        if self.frozen {
            return Err(RelocatorError::UseAfterFreeze);
        }
        let index = self.index_of(id)?;
        let chunk = self.chunks.remove(index);
        self.context.lock().release(chunk.target, chunk.end(), self.owner());
        Ok(())
    }

    /// Release every chunk; calling it again does nothing
    pub fn unload(&mut self) {
        let released = self.context.lock().release_owner(self.owner());
        self.chunks.clear();
        if released != 0 {
            log::debug!("Relocator {} unloaded, {} reservations released", self.id.0, released);
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Result<&Chunk> {
        let index = self.index_of(id)?;
        Ok(&self.chunks[index])
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        let index = self.index_of(id)?;
        Ok(&mut self.chunks[index])
    }

    /// Chunks in allocation order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Moves the trampoline performs, in allocation order
    pub fn copy_ops(&self) -> Vec<CopyOp> {
        self.chunks
            .iter()
            .filter_map(|c| CopyOp::new(c.staging_addr, c.target, c.size))
            .collect()
    }

    /// Compile the trampoline for `state` and freeze the relocator
    pub fn compile(&mut self, state: &BootState) -> Result<Program> {
        if self.frozen {
            return Err(RelocatorError::UseAfterFreeze);
        }
        let mode = self.context.machine().cpu_mode();
        check_transition(mode, state.kind())?;
        let program =
            TrampolineCompiler::new(mode, self.context.config()).compile(&self.copy_ops(), state)?;
        self.frozen = true;
        Ok(program)
    }

    /// Place the compiled program; bypasses the freeze and must be written in
    /// place
    pub(crate) fn alloc_program(&mut self, program: &Program) -> Result<ChunkId> {
        let placement = program.placement();
        let size = program.len() as u64;
        let target = self.find_and_reserve(
            placement.min,
            placement.max,
            size,
            placement.align,
            Preference::Low,
            placement.avoid_firmware_boot_services,
        )?;
        self.attach(target, size, StagingPolicy::InPlace)
    }

    fn check_request(&self, size: u64) -> Result<()> {
        if self.frozen {
            return Err(RelocatorError::UseAfterFreeze);
        }
        if size == 0 {
            return Err(RelocatorError::InvalidArgument("zero-sized chunk"));
        }
        Ok(())
    }

    /// End of a fixed `[start, start + size)` request
    fn validate(&self, start: u64, size: u64) -> Result<u64> {
        self.check_request(size)?;
        start
            .checked_add(size)
            .ok_or(RelocatorError::InvalidArgument("range overflows the address space"))
    }

    fn index_of(&self, id: ChunkId) -> Result<usize> {
        self.chunks
            .iter()
            .position(|c| c.id == id)
            .ok_or(RelocatorError::UnknownChunk)
    }

    fn find_and_reserve(
        &self,
        min: u64,
        max: u64,
        size: u64,
        align: u64,
        preference: Preference,
        avoid_firmware_boot_services: bool,
    ) -> Result<u64> {
        let mut table = self.context.lock();
        let windows = free_windows(
            self.context.memory_map(),
            &table,
            min,
            max,
            avoid_firmware_boot_services,
        );
        let Some(target) = choose(&windows, size, align, preference) else {
            log::debug!(
                "No {:#x}-byte window in [{:#x}, {:#x}) aligned to {:#x}",
                size,
                min,
                max,
                align
            );
            return Err(RelocatorError::OutOfMemory);
        };
        table.reserve(target, target + size, self.owner())?;
        Ok(target)
    }

    /// Create the chunk for an already reserved target
    fn attach(&mut self, target: u64, size: u64, policy: StagingPolicy) -> Result<ChunkId> {
        let staging = match self.make_staging(target, size, policy) {
            Ok(staging) => staging,
            Err(error) => {
                self.context.lock().release(target, target + size, self.owner());
                return Err(error);
            }
        };
        let staging_addr = match &staging {
            Staging::InPlace(_) => target,
            Staging::Buffer(buffer) => self.context.machine().physical_address_of(buffer.as_ptr()),
        };

        let id = ChunkId(self.next_chunk);
        self.next_chunk += 1;
        let chunk = Chunk { id, target, size, staging_addr, staging };
        #[cfg(feature = "verbose_logging")]
        log::trace!("Relocator {}: {:?}", self.id.0, chunk);
        self.chunks.push(chunk);
        Ok(id)
    }

    fn make_staging(&self, target: u64, size: u64, policy: StagingPolicy) -> Result<Staging> {
        let machine = self.context.machine();
        match policy {
            StagingPolicy::InPlace => machine
                .direct_access(target, size)
                .map(Staging::InPlace)
                .ok_or(RelocatorError::NotDirectlyAddressable { target }),
            StagingPolicy::Auto if self.context.config().in_place_staging => {
                match machine.direct_access(target, size) {
                    Some(ptr) => Ok(Staging::InPlace(ptr)),
                    None => staging_buffer(size).map(Staging::Buffer),
                }
            }
            StagingPolicy::Auto | StagingPolicy::Buffer => {
                staging_buffer(size).map(Staging::Buffer)
            }
        }
    }
}

impl Drop for Relocator<'_> {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for Relocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relocator")
            .field("id", &self.id)
            .field("chunks", &self.chunks)
            .field("frozen", &self.frozen)
            .finish()
    }
}

fn staging_buffer(size: u64) -> Result<Box<[u8]>> {
    let len = usize::try_from(size).map_err(|_| RelocatorError::OutOfMemory)?;
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| RelocatorError::OutOfMemory)?;
    buffer.resize(len, 0);
    Ok(buffer.into_boxed_slice())
}

const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Sort and coalesce overlapping or touching intervals
fn merge(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// `free` minus `blocked`; both sorted and coalesced
fn subtract(free: &[(u64, u64)], blocked: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut first = 0;
    for &(mut start, end) in free {
        while first < blocked.len() && blocked[first].1 <= start {
            first += 1;
        }
        for &(block_start, block_end) in &blocked[first..] {
            if block_start >= end || start >= end {
                break;
            }
            if block_start > start {
                out.push((start, block_start));
            }
            start = start.max(block_end);
        }
        if start < end {
            out.push((start, end));
        }
    }
    out
}

/// Free windows inside `[min, max)`, sorted by address
fn free_windows(
    map: &dyn MemoryMap,
    table: &ReservationTable,
    min: u64,
    max: u64,
    avoid_firmware_boot_services: bool,
) -> Vec<(u64, u64)> {
    let clip = |start: u64, end: u64| {
        let (start, end) = (start.max(min), end.min(max));
        (start < end).then_some((start, end))
    };

    let mut free = Vec::new();
    let mut blocked = Vec::new();
    map.iterate(&mut |region: &MemoryRegion| {
        if let Some(range) = clip(region.start, region.end()) {
            if region.kind.is_free(avoid_firmware_boot_services) {
                free.push(range);
            } else {
                blocked.push(range);
            }
        }
        true
    });
    blocked.extend(table.iter().filter_map(|r| clip(r.start, r.end)));

    subtract(&merge(free), &merge(blocked))
}

/// Require every byte of `[start, end)` to be covered by free memory
fn check_free(map: &dyn MemoryMap, start: u64, end: u64) -> Result<()> {
    let mut collision = None;
    let mut free = Vec::new();
    map.iterate(&mut |region: &MemoryRegion| {
        if !region.overlaps(start, end) {
            return true;
        }
        if region.kind.is_free(false) {
            free.push((region.start.max(start), region.end().min(end)));
            true
        } else {
            collision = Some((region.start, region.end()));
            false
        }
    });
    if let Some((start, end)) = collision {
        return Err(RelocatorError::Overlap { start, end });
    }
    if merge(free) != [(start, end)] {
        return Err(RelocatorError::Overlap { start, end });
    }
    Ok(())
}

/// Pick a target among `windows` for a `size`-byte chunk
fn choose(windows: &[(u64, u64)], size: u64, align: u64, preference: Preference) -> Option<u64> {
    let low = |&(start, end): &(u64, u64)| {
        align_up(start, align).filter(|t| t.checked_add(size).is_some_and(|e| e <= end))
    };
    let high = |&(start, end): &(u64, u64)| {
        end.checked_sub(size).map(|t| align_down(t, align)).filter(|&t| t >= start)
    };
    match preference {
        Preference::Low => windows.iter().find_map(low),
        Preference::High => windows.iter().rev().find_map(high),
        Preference::Any => windows
            .iter()
            .filter_map(|w| low(w).map(|t| (w.1 - w.0, t)))
            .min()
            .map(|(_, t)| t),
    }
}
