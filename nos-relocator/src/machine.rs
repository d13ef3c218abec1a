//! Hardware seam
//!
//! Everything the relocator needs from the running machine: which mode the
//! loader executes in, whether a physical range can be written right now,
//! where loader buffers sit physically, and the final jump.

use core::ptr::NonNull;

use crate::state::CpuMode;

/// Access to the machine the loader runs on
///
/// # Safety
///
/// Implementors guarantee that a pointer returned by `direct_access` is valid
/// for reads and writes of `size` bytes until the boot attempt ends, and that
/// nothing else uses that memory in the meantime.
pub unsafe trait Machine {
    /// Mode the trampoline will start executing in
    fn cpu_mode(&self) -> CpuMode;

    /// Pointer through which `[target, target + size)` can be written now
    fn direct_access(&self, target: u64, size: u64) -> Option<NonNull<u8>>;

    /// Physical address the trampoline must read a loader buffer from
    fn physical_address_of(&self, ptr: *const u8) -> u64 {
        ptr as usize as u64
    }

    /// Transfer control to `entry`
    ///
    /// # Safety
    ///
    /// `entry` must hold a linked program produced by this crate.
    unsafe fn jump(&self, entry: u64) -> !;
}

/// Machine whose physical memory is identity mapped (BIOS and x86_64 EFI
/// loaders after the memory map has been fetched)
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMachine;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
unsafe impl Machine for IdentityMachine {
    fn cpu_mode(&self) -> CpuMode {
        if cfg!(target_arch = "x86_64") {
            CpuMode::Long64
        } else {
            CpuMode::Protected32
        }
    }

    fn direct_access(&self, target: u64, size: u64) -> Option<NonNull<u8>> {
        let end = target.checked_add(size)?;
        if end > usize::MAX as u64 {
            return None;
        }
        NonNull::new(target as usize as *mut u8)
    }

    unsafe fn jump(&self, entry: u64) -> ! {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("cli", "jmp {0}", in(reg) entry, options(noreturn));
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("cli", "jmp {0}", in(reg) entry as u32, options(noreturn));
        }
    }
}

#[cfg(all(test, any(target_arch = "x86", target_arch = "x86_64")))]
mod tests {
    use super::*;

    #[test]
    fn test_identity_direct_access() {
        let machine = IdentityMachine;
        let ptr = machine.direct_access(0x10_0000, 0x1000).unwrap();
        assert_eq!(ptr.as_ptr() as usize, 0x10_0000);
        assert!(machine.direct_access(0, 0x1000).is_none());
        assert!(machine.direct_access(u64::MAX, 2).is_none());
    }
}
