//! Boot states
//!
//! A boot state is the register and mode snapshot a payload expects at its
//! first instruction. Each variant maps to one epilogue template family.

use arrayvec::ArrayVec;
use bitflags::bitflags;

/// CPU mode type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// Flat 32-bit protected mode, paging off (BIOS loaders)
    Protected32,
    /// 64-bit long mode with identity paging (x86_64 EFI loaders)
    Long64,
}

impl CpuMode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Protected32 => "Protected Mode (32-bit)",
            Self::Long64 => "Long Mode (64-bit)",
        }
    }

    /// First address the mode cannot execute from
    pub fn reach(&self) -> u64 {
        match self {
            Self::Protected32 => 1 << 32,
            Self::Long64 => u64::MAX,
        }
    }
}

/// Variant tag of a [`BootState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStateKind {
    Real16,
    Protected32,
    Long64,
    Long64FirmwareCall,
    ParavirtGuest,
}

/// Real-mode handoff (chained boot sectors, 16-bit kernels)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Real16State {
    pub cs: u16,
    pub ip: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub sp: u16,
    pub ebx: u32,
    pub edx: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Open the A20 gate through the fast-A20 port before the jump
    pub a20: bool,
}

/// Flat 32-bit protected-mode handoff (multiboot, 32-bit Linux entry)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Protected32State {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    /// Keep the trampoline out of firmware boot-services memory
    pub avoid_firmware_boot_services: bool,
}

/// Address window `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub min: u64,
    pub max: u64,
}

impl AddressWindow {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub const fn anywhere() -> Self {
        Self { min: 0, max: u64::MAX }
    }
}

impl Default for AddressWindow {
    fn default() -> Self {
        Self::anywhere()
    }
}

/// 64-bit long-mode handoff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Long64State {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rip: u64,
    /// Page tables in effect at the jump; they must identity map the trampoline
    pub cr3: u64,
    /// Where the switch code itself must live
    pub code_window: AddressWindow,
}

/// 64-bit handoff with the firmware calling convention
///
/// The stack pointer is left alone: the firmware stack stays live through the
/// jump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareCallState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rip: u64,
}

/// Maximum number of page-table windows a paravirtual handoff remaps
pub const MAX_PAGING_WINDOWS: usize = 3;

/// A run of guest page-table pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingWindow {
    /// Guest virtual address of the first page
    pub virt: u64,
    /// Guest pseudo-physical frame of the first page
    pub pfn: u64,
    /// Number of pages
    pub pages: u64,
}

bitflags! {
    /// Page-table entry bits used when remapping the trampoline page
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// Paravirtualized guest handoff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParavirtState {
    /// Guest virtual address of the start-info page
    pub start_info: u64,
    /// Page-table windows; the first page of the first window is the root
    pub paging: ArrayVec<PagingWindow, MAX_PAGING_WINDOWS>,
    /// Guest virtual address of the pfn-to-mfn list
    pub mfn_list: u64,
    pub stack: u64,
    pub entry_point: u64,
    /// Pseudo-physical frame the trampoline page is placed in
    pub remapper_pfn: u64,
    /// Machine frame backing `remapper_pfn`, taken from the loader's own
    /// pfn-to-mfn table
    pub remapper_mfn: u64,
    /// Virtual address the trampoline page is remapped to
    pub remapper_virt: u64,
}

impl ParavirtState {
    /// Pseudo-physical address of the trampoline page
    pub fn remapper_page(&self, page_size: u64) -> Option<u64> {
        self.remapper_pfn.checked_mul(page_size)
    }

    /// Page-table entry installed for the trampoline page
    pub fn remapper_pte(&self) -> Option<u64> {
        let frame = self.remapper_mfn.checked_mul(4096)?;
        // Frames above the 52-bit physical limit cannot be mapped.
        if frame >> 52 != 0 {
            return None;
        }
        let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::ACCESSED | PteFlags::DIRTY;
        Some(frame | flags.bits())
    }

    /// Pseudo-physical frame of the root page table
    pub fn root_pfn(&self) -> Option<u64> {
        self.paging.iter().find(|w| w.pages != 0).map(|w| w.pfn)
    }
}

/// Register/mode snapshot handed to the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    Real16(Real16State),
    Protected32(Protected32State),
    Long64(Long64State),
    Long64FirmwareCall(FirmwareCallState),
    ParavirtGuest(ParavirtState),
}

impl BootState {
    pub fn kind(&self) -> BootStateKind {
        match self {
            BootState::Real16(_) => BootStateKind::Real16,
            BootState::Protected32(_) => BootStateKind::Protected32,
            BootState::Long64(_) => BootStateKind::Long64,
            BootState::Long64FirmwareCall(_) => BootStateKind::Long64FirmwareCall,
            BootState::ParavirtGuest(_) => BootStateKind::ParavirtGuest,
        }
    }

    /// Whether the trampoline must stay clear of firmware boot-services memory
    pub fn avoids_firmware_boot_services(&self) -> bool {
        match self {
            BootState::Protected32(state) => state.avoid_firmware_boot_services,
            _ => false,
        }
    }
}
