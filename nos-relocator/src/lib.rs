//! NOS Relocator
//!
//! Control-transfer core of the boot loader. Payloads are staged into
//! chunks whose physical targets are planned against the firmware memory
//! map; a synthesized trampoline then moves every chunk into place, switches
//! the CPU into the state the payload expects and jumps to it.
//!
//! Typical flow:
//!
//! 1. install a [`RelocatorContext`] with the memory map and machine seam
//! 2. allocate chunks with [`Relocator::alloc_fixed`] or
//!    [`Relocator::alloc_in_range`] and fill their staging areas
//! 3. hand the relocator and a [`BootState`] to [`Launcher::boot`]

#![no_std]
#![warn(clippy::all)]

extern crate alloc;

pub mod compiler;
pub mod config;
pub mod context;
pub mod copy;
pub mod emitter;
pub mod error;
pub mod launcher;
pub mod machine;
pub mod memory_map;
pub mod relocator;
pub mod reservation;
pub mod state;
pub mod template;

pub use compiler::Placement;
pub use config::RelocatorConfig;
pub use context::RelocatorContext;
pub use copy::{CopyOp, Direction};
pub use emitter::Program;
pub use error::{RelocatorError, Result};
pub use launcher::{Launcher, PreparedBoot};
pub use machine::Machine;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use machine::IdentityMachine;
pub use memory_map::{MemoryKind, MemoryMap, MemoryRegion, StaticMemoryMap};
pub use relocator::{Chunk, ChunkId, Preference, Relocator};
pub use reservation::{Owner, RelocatorId, Reservation};
pub use state::{
    AddressWindow, BootState, BootStateKind, CpuMode, FirmwareCallState, Long64State, PagingWindow,
    ParavirtState, Protected32State, Real16State,
};
