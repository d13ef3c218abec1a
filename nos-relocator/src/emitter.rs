//! Code emitter
//!
//! Appends templates to a growing program, writing immediate operands on the
//! spot and recording link-time operands as fixups. A template is appended
//! only if every immediate operand fits, so a failed `emit` leaves the
//! program untouched.

use alloc::vec::Vec;

use crate::compiler::Placement;
use crate::error::{RelocatorError, Result};
use crate::state::{BootStateKind, CpuMode};
use crate::template::x86::GDT_TABLE_OFFSET;
use crate::template::{CodeTemplate, Operand, OperandWidth};

/// A patch point resolved at link time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Template the patch point belongs to
    pub template: &'static str,
    /// Program offset of the template's first byte
    pub block: usize,
    /// Program offset of the patch point
    pub offset: usize,
    pub width: OperandWidth,
    pub operand: Operand,
}

/// Builder for one trampoline program
#[derive(Debug, Default)]
pub struct CodeEmitter {
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
    gdt_offset: Option<usize>,
}

impl CodeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append `template`, asking `resolve` for every immediate operand
    ///
    /// Returns the program offset of the appended block.
    pub fn emit<F>(&mut self, template: &CodeTemplate, mut resolve: F) -> Result<usize>
    where
        F: FnMut(Operand) -> Option<u64>,
    {
        let block = self.bytes.len();
        let mut code = template.bytes.to_vec();
        let mut fixups = Vec::new();

        for patch in template.patches {
            if patch.operand.is_link_time() {
                fixups.push(Fixup {
                    template: template.name,
                    block,
                    offset: block + patch.offset,
                    width: patch.width,
                    operand: patch.operand,
                });
                continue;
            }
            let value =
                resolve(patch.operand).ok_or(RelocatorError::UnresolvedOperand(patch.operand))?;
            write_operand(
                &mut code,
                patch.offset,
                patch.width,
                template.name,
                patch.operand,
                value,
            )?;
        }

        #[cfg(feature = "verbose_logging")]
        log::trace!("emit {} at +{:#x} ({} bytes)", template.name, block, code.len());

        self.bytes.extend_from_slice(&code);
        self.fixups.extend(fixups);
        Ok(block)
    }

    /// Remember where the descriptor table block starts
    pub fn set_gdt_offset(&mut self, offset: usize) {
        self.gdt_offset = Some(offset);
    }

    pub fn finish(
        self,
        mode: CpuMode,
        state: BootStateKind,
        placement: Placement,
        copies: usize,
    ) -> Program {
        Program {
            bytes: self.bytes,
            fixups: self.fixups,
            gdt_offset: self.gdt_offset,
            mode,
            state,
            placement,
            copies,
        }
    }
}

fn write_operand(
    buf: &mut [u8],
    offset: usize,
    width: OperandWidth,
    template: &'static str,
    operand: Operand,
    value: u64,
) -> Result<()> {
    if value > width.max() {
        return Err(RelocatorError::OperandOutOfRange { template, operand, value });
    }
    width
        .write(buf, offset, value)
        .ok_or(RelocatorError::InvalidArgument("patch point outside template"))
}

/// Compiled, not yet linked trampoline program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
    gdt_offset: Option<usize>,
    mode: CpuMode,
    state: BootStateKind,
    placement: Placement,
    copies: usize,
}

impl Program {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Program bytes with link-time operands still zero
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Where the program chunk may be placed
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Loader mode the program starts in
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn state(&self) -> BootStateKind {
        self.state
    }

    /// Number of copy blocks
    pub fn copy_count(&self) -> usize {
        self.copies
    }

    /// Produce the final image for a program placed at `base`
    pub fn link(&self, base: u64) -> Result<Vec<u8>> {
        let mut image = self.bytes.clone();
        for fixup in &self.fixups {
            let value = self.resolve(fixup, base)?;
            write_operand(
                &mut image,
                fixup.offset,
                fixup.width,
                fixup.template,
                fixup.operand,
                value,
            )?;
        }
        Ok(image)
    }

    fn resolve(&self, fixup: &Fixup, base: u64) -> Result<u64> {
        let absolute = |offset: usize| {
            base.checked_add(offset as u64)
                .ok_or(RelocatorError::InvalidArgument("program base overflows the address space"))
        };
        match fixup.operand {
            Operand::GdtPointer => absolute(self.gdt()?),
            Operand::GdtTable => absolute(self.gdt()? + GDT_TABLE_OFFSET),
            Operand::SegmentBase => Ok(base),
            Operand::RealModeSegment => {
                if base % 16 != 0 {
                    return Err(RelocatorError::InvalidArgument(
                        "real-mode program must be 16-byte aligned",
                    ));
                }
                Ok(base >> 4)
            }
            Operand::Here(label) => absolute(fixup.block + label as usize),
            Operand::BlockOffset(label) => Ok((fixup.block + label as usize) as u64),
            operand => Err(RelocatorError::UnresolvedOperand(operand)),
        }
    }

    fn gdt(&self) -> Result<usize> {
        self.gdt_offset.ok_or(RelocatorError::UnresolvedOperand(Operand::GdtPointer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::x86;

    fn placement() -> Placement {
        Placement { min: 0, max: u64::MAX, align: 16, avoid_firmware_boot_services: false }
    }

    #[test]
    fn test_emit_patches_immediates() {
        let mut emitter = CodeEmitter::new();
        let at = emitter
            .emit(&x86::JUMP64, |op| match op {
                Operand::Target => Some(0x1122_3344_5566_7788),
                _ => None,
            })
            .unwrap();
        assert_eq!(at, 0);
        let program = emitter.finish(CpuMode::Long64, BootStateKind::Long64, placement(), 0);
        assert_eq!(
            program.bytes(),
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xFF, 0xE0]
        );
        assert!(program.fixups().is_empty());
    }

    #[test]
    fn test_failed_emit_leaves_program_untouched() {
        let mut emitter = CodeEmitter::new();
        let result = emitter.emit(&x86::COPY32_FORWARD, |op| match op {
            Operand::Source => Some(0x1_0000_0000),
            _ => Some(0),
        });
        assert_eq!(
            result,
            Err(RelocatorError::OperandOutOfRange {
                template: "copy32.forward",
                operand: Operand::Source,
                value: 0x1_0000_0000,
            })
        );
        assert!(emitter.is_empty());
    }

    #[test]
    fn test_missing_operand() {
        let mut emitter = CodeEmitter::new();
        assert_eq!(
            emitter.emit(&x86::JUMP64, |_| None),
            Err(RelocatorError::UnresolvedOperand(Operand::Target))
        );
    }

    #[test]
    fn test_link_resolves_here_and_gdt() {
        let mut emitter = CodeEmitter::new();
        emitter.emit(&x86::JUMP64, |_| Some(0)).unwrap();
        let leave = emitter.emit(&x86::LEAVE_LONG, |_| None).unwrap();
        let gdt = emitter.emit(&x86::GDT, |_| None).unwrap();
        emitter.set_gdt_offset(gdt);
        let program = emitter.finish(CpuMode::Long64, BootStateKind::Protected32, placement(), 0);

        let base = 0x8000;
        let image = program.link(base).unwrap();
        let gdtr = u64::from_le_bytes(image[leave + 3..leave + 11].try_into().unwrap());
        assert_eq!(gdtr, base + gdt as u64);
        let farptr = u32::from_le_bytes(image[leave + 26..leave + 30].try_into().unwrap());
        assert_eq!(farptr as u64, base + leave as u64 + 32);
        let table = u64::from_le_bytes(image[gdt + 2..gdt + 10].try_into().unwrap());
        assert_eq!(table, base + gdt as u64 + 16);
        // 16-bit code descriptor based at the program
        assert_eq!(&image[gdt + 48 + 2..gdt + 48 + 5], &[0x00, 0x80, 0x00]);
    }

    #[test]
    fn test_link_without_gdt_fails() {
        let mut emitter = CodeEmitter::new();
        emitter.emit(&x86::STATE32, |_| Some(0)).unwrap();
        let program =
            emitter.finish(CpuMode::Protected32, BootStateKind::Protected32, placement(), 0);
        assert_eq!(
            program.link(0x1000),
            Err(RelocatorError::UnresolvedOperand(Operand::GdtPointer))
        );
    }

    #[test]
    fn test_link_rejects_32bit_fixup_above_4g() {
        let mut emitter = CodeEmitter::new();
        emitter.emit(&x86::STATE32, |_| Some(0)).unwrap();
        let gdt = emitter.emit(&x86::GDT, |_| None).unwrap();
        emitter.set_gdt_offset(gdt);
        let program = emitter.finish(CpuMode::Long64, BootStateKind::Protected32, placement(), 0);
        assert!(matches!(
            program.link(0x1_0000_0000),
            Err(RelocatorError::OperandOutOfRange { operand: Operand::GdtPointer, .. })
        ));
        assert!(program.link(0x10_0000).is_ok());
    }
}
