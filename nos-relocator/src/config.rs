// Relocator configuration

/// Default page size used for paravirtual remapping
pub const DEFAULT_PAGE_SIZE: u64 = 4096;
/// Default alignment of the trampoline program
pub const DEFAULT_PROGRAM_ALIGN: u64 = 16;
/// Top of conventional memory usable by real-mode code
pub const DEFAULT_REAL_MODE_CEILING: u64 = 0xA0000;

/// Tunables shared by the planner and the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatorConfig {
    /// Page size of the paravirtual guest
    pub page_size: u64,
    /// Alignment of the program chunk (real mode needs 16)
    pub program_align: u64,
    /// Lowest address `alloc_in_range_clamped` will hand out
    pub low_memory_floor: u64,
    /// Exclusive upper bound for real-mode trampolines
    pub real_mode_ceiling: u64,
    /// Let chunks be written at their target when the machine allows it
    pub in_place_staging: bool,
}

impl RelocatorConfig {
    pub const fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            program_align: DEFAULT_PROGRAM_ALIGN,
            low_memory_floor: 0,
            real_mode_ceiling: DEFAULT_REAL_MODE_CEILING,
            in_place_staging: true,
        }
    }

    pub const fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub const fn with_program_align(mut self, align: u64) -> Self {
        self.program_align = align;
        self
    }

    /// BIOS loaders keep the IVT and BDA out of reach with a 0x1000 floor
    pub const fn with_low_memory_floor(mut self, floor: u64) -> Self {
        self.low_memory_floor = floor;
        self
    }

    pub const fn with_real_mode_ceiling(mut self, ceiling: u64) -> Self {
        self.real_mode_ceiling = ceiling;
        self
    }

    pub const fn with_in_place_staging(mut self, enabled: bool) -> Self {
        self.in_place_staging = enabled;
        self
    }

    /// Reject values the planner cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(crate::RelocatorError::InvalidArgument("page size must be a power of two"));
        }
        // Real-mode segments are 16-byte granular.
        if !self.program_align.is_power_of_two() || self.program_align < 16 {
            return Err(crate::RelocatorError::InvalidArgument(
                "program alignment must be a power of two >= 16",
            ));
        }
        if self.real_mode_ceiling > 0x10_0000 {
            return Err(crate::RelocatorError::InvalidArgument("real-mode ceiling above 1 MiB"));
        }
        Ok(())
    }
}

impl Default for RelocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
