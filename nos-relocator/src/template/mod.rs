//! Code templates
//!
//! A template is a constant machine-code fragment plus a table of patch
//! points: fixed byte offsets where operand values are written before the
//! fragment is appended to a trampoline program. Operands are either
//! immediate (known when the program is compiled) or link-time (depending on
//! where the program finally lands, resolved by
//! [`Program::link`](crate::emitter::Program::link)).

pub mod x86;

/// Encoding of one patch point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandWidth {
    /// Little-endian 16-bit immediate
    U16,
    /// Little-endian 32-bit immediate
    U32,
    /// Little-endian 64-bit immediate
    U64,
    /// 32-bit base scattered over an 8-byte segment descriptor
    DescriptorBase,
}

impl OperandWidth {
    /// Bytes covered at the patch offset
    pub const fn bytes(self) -> usize {
        match self {
            OperandWidth::U16 => 2,
            OperandWidth::U32 => 4,
            OperandWidth::U64 => 8,
            OperandWidth::DescriptorBase => 8,
        }
    }

    /// Largest value the slot can hold
    pub const fn max(self) -> u64 {
        match self {
            OperandWidth::U16 => u16::MAX as u64,
            OperandWidth::U32 | OperandWidth::DescriptorBase => u32::MAX as u64,
            OperandWidth::U64 => u64::MAX,
        }
    }

    /// Write `value` at `at`; `None` if it does not fit or runs off the buffer
    pub fn write(self, buf: &mut [u8], at: usize, value: u64) -> Option<()> {
        if value > self.max() {
            return None;
        }
        let slot = buf.get_mut(at..at.checked_add(self.bytes())?)?;
        match self {
            OperandWidth::U16 => slot.copy_from_slice(&(value as u16).to_le_bytes()),
            OperandWidth::U32 => slot.copy_from_slice(&(value as u32).to_le_bytes()),
            OperandWidth::U64 => slot.copy_from_slice(&value.to_le_bytes()),
            OperandWidth::DescriptorBase => {
                let base = (value as u32).to_le_bytes();
                slot[2..5].copy_from_slice(&base[..3]);
                slot[7] = base[3];
            }
        }
        Some(())
    }
}

/// What a patch point holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    // Bulk copy
    Source,
    Destination,
    Length,
    /// Absolute jump target
    Target,

    // 32-bit registers
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,

    // 64-bit registers
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rsp,
    Rip,
    Cr3,

    // Real-mode segments and pointers
    Cs,
    Ip,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Sp,

    // Paravirtual guest
    RemapperVirt,
    RemapperPte,
    WindowVirt,
    WindowPfn,
    WindowPages,
    MfnList,
    RootPfn,
    OpsVirt,
    StartInfo,
    Stack,
    Entry,

    // Link-time
    /// Absolute address of the GDT register image
    GdtPointer,
    /// Absolute address of the first GDT descriptor
    GdtTable,
    /// Absolute address of the program
    SegmentBase,
    /// Program address as a real-mode segment
    RealModeSegment,
    /// Absolute address of a byte in the same template
    Here(u16),
    /// Offset of a byte in the same template from the program start
    BlockOffset(u16),
}

impl Operand {
    /// Whether the value depends on the program's final address
    pub const fn is_link_time(self) -> bool {
        matches!(
            self,
            Operand::GdtPointer
                | Operand::GdtTable
                | Operand::SegmentBase
                | Operand::RealModeSegment
                | Operand::Here(_)
                | Operand::BlockOffset(_)
        )
    }
}

/// One operand slot of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchPoint {
    pub offset: usize,
    pub width: OperandWidth,
    pub operand: Operand,
}

impl PatchPoint {
    pub const fn new(offset: usize, width: OperandWidth, operand: Operand) -> Self {
        Self { offset, width, operand }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width.bytes()
    }
}

/// Parameterized machine-code fragment
#[derive(Debug, Clone, Copy)]
pub struct CodeTemplate {
    pub name: &'static str,
    pub bytes: &'static [u8],
    pub patches: &'static [PatchPoint],
}

impl CodeTemplate {
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check that every patch point lies inside the fragment and that no two
    /// patch points share a byte
    pub fn is_well_formed(&self) -> bool {
        self.patches.iter().enumerate().all(|(i, patch)| {
            patch.end() <= self.bytes.len()
                && self.patches[i + 1..]
                    .iter()
                    .all(|other| other.end() <= patch.offset || patch.end() <= other.offset)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_templates_well_formed() {
        for template in x86::ALL {
            assert!(template.is_well_formed(), "{} has a bad patch table", template.name);
        }
    }

    #[test]
    fn test_width_rejects_wide_values() {
        let mut buf = [0u8; 8];
        assert!(OperandWidth::U16.write(&mut buf, 0, 0x1_0000).is_none());
        assert!(OperandWidth::U32.write(&mut buf, 0, 0x1_0000_0000).is_none());
        assert!(OperandWidth::U32.write(&mut buf, 6, 1).is_none());
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_width_writes_little_endian() {
        let mut buf = [0u8; 8];
        OperandWidth::U32.write(&mut buf, 2, 0xAABB_CCDD).unwrap();
        assert_eq!(buf, [0, 0, 0xDD, 0xCC, 0xBB, 0xAA, 0, 0]);
    }

    #[test]
    fn test_descriptor_base_scatter() {
        let mut descriptor = [0xFF, 0xFF, 0, 0, 0, 0x9A, 0x00, 0];
        OperandWidth::DescriptorBase.write(&mut descriptor, 0, 0x1234_5678).unwrap();
        assert_eq!(descriptor, [0xFF, 0xFF, 0x78, 0x56, 0x34, 0x9A, 0x00, 0x12]);
    }

    #[test]
    fn test_overlapping_patches_detected() {
        static BYTES: [u8; 8] = [0; 8];
        static PATCHES: [PatchPoint; 2] = [
            PatchPoint::new(0, OperandWidth::U32, Operand::Eax),
            PatchPoint::new(2, OperandWidth::U32, Operand::Ebx),
        ];
        let template = CodeTemplate { name: "bad", bytes: &BYTES, patches: &PATCHES };
        assert!(!template.is_well_formed());
    }
}
