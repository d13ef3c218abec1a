//! Launcher
//!
//! Compiles a relocator's trampoline, places the program in its own directly
//! writable chunk, links it there and performs the final jump.

use alloc::vec::Vec;
use core::convert::Infallible;

use crate::error::Result;
use crate::relocator::{ChunkId, Relocator};
use crate::state::{BootState, BootStateKind};

/// Entry points of the handoff
pub struct Launcher;

impl Launcher {
    /// Compile, place and link the trampoline without jumping
    ///
    /// On error the relocator is dropped, which releases every reservation it
    /// made.
    pub fn prepare<'ctx>(
        mut relocator: Relocator<'ctx>,
        state: &BootState,
    ) -> Result<PreparedBoot<'ctx>> {
        let program = relocator.compile(state)?;
        let program_chunk = relocator.alloc_program(&program)?;
        let chunk = relocator.chunk_mut(program_chunk)?;
        let entry = chunk.target_addr();
        let image = program.link(entry)?;
        chunk.write_at(0, &image)?;

        log::info!(
            "Trampoline ready at {:#x}: {} bytes, {} copies, {:?} handoff",
            entry,
            image.len(),
            program.copy_count(),
            state.kind()
        );
        Ok(PreparedBoot {
            relocator,
            program_chunk,
            entry,
            image,
            state: state.kind(),
        })
    }

    /// Compile, place, link and jump
    ///
    /// Returns only on failure, after all reservations have been released.
    ///
    /// # Safety
    ///
    /// Every chunk must hold what the payload expects and `state` must
    /// describe a valid entry point: the jump hands the CPU to it.
    pub unsafe fn boot(relocator: Relocator<'_>, state: &BootState) -> Result<Infallible> {
        let prepared = Self::prepare(relocator, state)?;
        // SAFETY: forwarded from the caller.
        unsafe { prepared.launch() }
    }
}

/// A linked trampoline waiting for the jump
pub struct PreparedBoot<'ctx> {
    relocator: Relocator<'ctx>,
    program_chunk: ChunkId,
    entry: u64,
    image: Vec<u8>,
    state: BootStateKind,
}

impl<'ctx> PreparedBoot<'ctx> {
    /// Physical address of the first trampoline instruction
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Linked program as written to the program chunk
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn program_chunk(&self) -> ChunkId {
        self.program_chunk
    }

    pub fn state(&self) -> BootStateKind {
        self.state
    }

    pub fn relocator(&self) -> &Relocator<'ctx> {
        &self.relocator
    }

    /// Release everything without jumping
    pub fn abort(self) {
        log::info!("Boot at {:#x} aborted", self.entry);
    }

    /// Jump to the trampoline
    ///
    /// # Safety
    ///
    /// As for [`Launcher::boot`].
    pub unsafe fn launch(self) -> ! {
        log::info!("Jumping to trampoline at {:#x}", self.entry);
        let machine = self.relocator.context().machine();
        // SAFETY: the program chunk holds the linked image at `entry`.
        unsafe { machine.jump(self.entry) }
    }
}
