//! Relocator context
//!
//! Bundles the memory-map oracle, the machine seam, the configuration and the
//! process-wide reservation table. Loaders normally install one context at
//! startup; tests and multi-context hosts pass contexts explicitly.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard, Once};

use crate::config::RelocatorConfig;
use crate::error::{RelocatorError, Result};
use crate::machine::Machine;
use crate::memory_map::MemoryMap;
use crate::reservation::{Owner, RelocatorId, Reservation, ReservationTable};

static CONTEXT: Once<RelocatorContext> = Once::new();

/// Shared state of every relocator bound to one machine
pub struct RelocatorContext {
    memory_map: Box<dyn MemoryMap + Send + Sync>,
    machine: Box<dyn Machine + Send + Sync>,
    config: RelocatorConfig,
    reservations: Mutex<ReservationTable>,
    next_id: AtomicU32,
}

impl RelocatorContext {
    pub fn new<M, H>(memory_map: M, machine: H, config: RelocatorConfig) -> Result<Self>
    where
        M: MemoryMap + Send + Sync + 'static,
        H: Machine + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            memory_map: Box::new(memory_map),
            machine: Box::new(machine),
            config,
            reservations: Mutex::new(ReservationTable::new()),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn memory_map(&self) -> &dyn MemoryMap {
        self.memory_map.as_ref()
    }

    pub fn machine(&self) -> &dyn Machine {
        self.machine.as_ref()
    }

    pub fn config(&self) -> &RelocatorConfig {
        &self.config
    }

    /// Lock the reservation table
    pub(crate) fn lock(&self) -> MutexGuard<'_, ReservationTable> {
        self.reservations.lock()
    }

    pub(crate) fn allocate_id(&self) -> RelocatorId {
        RelocatorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Current reservations, sorted by address
    pub fn reservations(&self) -> Vec<Reservation> {
        self.lock().snapshot()
    }

    /// Keep the planner away from `[start, start + size)`, which the loader
    /// itself occupies (image, heap, stack)
    pub fn reserve_loader_range(&self, start: u64, size: u64) -> Result<()> {
        let end = start
            .checked_add(size)
            .ok_or(RelocatorError::InvalidArgument("range overflows the address space"))?;
        self.lock().reserve(start, end, Owner::Loader)?;
        log::debug!("Loader range reserved: [{:#x}, {:#x})", start, end);
        Ok(())
    }

    pub fn release_loader_range(&self, start: u64, size: u64) -> bool {
        start
            .checked_add(size)
            .is_some_and(|end| self.lock().release(start, end, Owner::Loader))
    }
}

/// Install the process-wide context
///
/// Only the first call installs; later calls get the existing context back.
pub fn install(context: RelocatorContext) -> &'static RelocatorContext {
    if CONTEXT.is_completed() {
        log::warn!("Relocator context already installed, keeping the existing one");
    }
    CONTEXT.call_once(|| context)
}

/// The process-wide context
pub fn global() -> Result<&'static RelocatorContext> {
    CONTEXT.get().ok_or(RelocatorError::NotInitialized)
}
