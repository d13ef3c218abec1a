//! Trampoline compiler
//!
//! Turns the copy list of a relocator and one boot state into a program: one
//! copy block per chunk in allocation order, then the epilogue selected by
//! the loader's CPU mode and the requested state.

use crate::config::RelocatorConfig;
use crate::copy::{CopyOp, Direction};
use crate::emitter::{CodeEmitter, Program};
use crate::error::{RelocatorError, Result};
use crate::state::{
    BootState, BootStateKind, CpuMode, FirmwareCallState, Long64State, ParavirtState,
    Protected32State, Real16State,
};
use crate::template::x86;
use crate::template::{CodeTemplate, Operand};

/// Where a program chunk may be placed: `[min, max)` with `align`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub min: u64,
    pub max: u64,
    pub align: u64,
    pub avoid_firmware_boot_services: bool,
}

/// Reject loader mode / boot state pairs without an epilogue
pub fn check_transition(mode: CpuMode, state: BootStateKind) -> Result<()> {
    match (mode, state) {
        (
            CpuMode::Protected32,
            BootStateKind::Long64FirmwareCall | BootStateKind::ParavirtGuest,
        ) => Err(RelocatorError::UnsupportedTransition { from: mode, to: state }),
        _ => Ok(()),
    }
}

/// Compiler for one loader mode
#[derive(Debug, Clone, Copy)]
pub struct TrampolineCompiler<'a> {
    mode: CpuMode,
    config: &'a RelocatorConfig,
}

impl<'a> TrampolineCompiler<'a> {
    pub fn new(mode: CpuMode, config: &'a RelocatorConfig) -> Self {
        Self { mode, config }
    }

    pub fn compile(&self, copies: &[CopyOp], state: &BootState) -> Result<Program> {
        check_transition(self.mode, state.kind())?;

        let mut emitter = CodeEmitter::new();
        for op in copies {
            self.emit_copy(&mut emitter, op)?;
        }

        let placement = match state {
            BootState::Real16(s) => self.real16(&mut emitter, s)?,
            BootState::Protected32(s) => self.protected32(&mut emitter, s)?,
            BootState::Long64(s) => self.long64(&mut emitter, s)?,
            BootState::Long64FirmwareCall(s) => self.firmware_call(&mut emitter, s)?,
            BootState::ParavirtGuest(s) => self.paravirt(&mut emitter, s)?,
        };
        let placement = Placement {
            max: placement.max.min(self.mode.reach()),
            avoid_firmware_boot_services: state.avoids_firmware_boot_services(),
            ..placement
        };

        let program = emitter.finish(self.mode, state.kind(), placement, copies.len());
        log::debug!(
            "Compiled {:?} -> {:?} trampoline: {} copies, {} bytes",
            self.mode,
            state.kind(),
            copies.len(),
            program.len()
        );
        Ok(program)
    }

    fn emit_copy(&self, emitter: &mut CodeEmitter, op: &CopyOp) -> Result<usize> {
        let (src, dest, len) = op.register_operands();
        emitter.emit(copy_template(self.mode, op.direction), |operand| match operand {
            Operand::Source => Some(src),
            Operand::Destination => Some(dest),
            Operand::Length => Some(len),
            _ => None,
        })
    }

    /// Leave long mode when the loader runs 64-bit code
    fn drop_to_protected(&self, emitter: &mut CodeEmitter) -> Result<()> {
        if self.mode == CpuMode::Long64 {
            emitter.emit(&x86::LEAVE_LONG, no_operands)?;
        }
        Ok(())
    }

    fn emit_gdt(&self, emitter: &mut CodeEmitter) -> Result<()> {
        let offset = emitter.emit(&x86::GDT, no_operands)?;
        emitter.set_gdt_offset(offset);
        Ok(())
    }

    fn program_align(&self) -> u64 {
        self.config.program_align.max(16)
    }

    fn real16(&self, emitter: &mut CodeEmitter, s: &Real16State) -> Result<Placement> {
        self.drop_to_protected(emitter)?;
        if s.a20 {
            emitter.emit(&x86::A20_FAST, no_operands)?;
        }
        emitter.emit(&x86::STATE16, |operand| {
            let value = match operand {
                Operand::Cs => s.cs,
                Operand::Ip => s.ip,
                Operand::Ds => s.ds,
                Operand::Es => s.es,
                Operand::Fs => s.fs,
                Operand::Gs => s.gs,
                Operand::Ss => s.ss,
                Operand::Sp => s.sp,
                Operand::Ebx => return Some(s.ebx as u64),
                Operand::Edx => return Some(s.edx as u64),
                Operand::Esi => return Some(s.esi as u64),
                Operand::Ebp => return Some(s.ebp as u64),
                _ => return None,
            };
            Some(value as u64)
        })?;
        self.emit_gdt(emitter)?;
        Ok(Placement {
            min: 0,
            max: self.config.real_mode_ceiling,
            align: self.program_align(),
            avoid_firmware_boot_services: false,
        })
    }

    fn protected32(&self, emitter: &mut CodeEmitter, s: &Protected32State) -> Result<Placement> {
        self.drop_to_protected(emitter)?;
        emitter.emit(&x86::STATE32, |operand| {
            let value = match operand {
                Operand::Eax => s.eax,
                Operand::Ebx => s.ebx,
                Operand::Ecx => s.ecx,
                Operand::Edx => s.edx,
                Operand::Esi => s.esi,
                Operand::Edi => s.edi,
                Operand::Ebp => s.ebp,
                Operand::Esp => s.esp,
                Operand::Eip => s.eip,
                _ => return None,
            };
            Some(value as u64)
        })?;
        self.emit_gdt(emitter)?;
        Ok(Placement {
            min: 0,
            max: 1 << 32,
            align: self.program_align(),
            avoid_firmware_boot_services: false,
        })
    }

    fn long64(&self, emitter: &mut CodeEmitter, s: &Long64State) -> Result<Placement> {
        if s.code_window.min >= s.code_window.max {
            return Err(RelocatorError::InvalidBootState("empty code window"));
        }
        if self.mode == CpuMode::Protected32 {
            emitter.emit(&x86::ENTER_LONG, |operand| match operand {
                Operand::Cr3 => Some(s.cr3),
                _ => None,
            })?;
        }
        emitter.emit(&x86::STATE64, |operand| match operand {
            Operand::Cr3 => Some(s.cr3),
            Operand::Rax => Some(s.rax),
            Operand::Rbx => Some(s.rbx),
            Operand::Rcx => Some(s.rcx),
            Operand::Rdx => Some(s.rdx),
            Operand::Rsi => Some(s.rsi),
            Operand::Rsp => Some(s.rsp),
            Operand::Rip => Some(s.rip),
            _ => None,
        })?;
        if self.mode == CpuMode::Protected32 {
            self.emit_gdt(emitter)?;
        }
        Ok(Placement {
            min: s.code_window.min,
            max: s.code_window.max,
            align: self.program_align(),
            avoid_firmware_boot_services: false,
        })
    }

    fn firmware_call(&self, emitter: &mut CodeEmitter, s: &FirmwareCallState) -> Result<Placement> {
        emitter.emit(&x86::STATE64_FIRMWARE, |operand| match operand {
            Operand::Rax => Some(s.rax),
            Operand::Rbx => Some(s.rbx),
            Operand::Rcx => Some(s.rcx),
            Operand::Rdx => Some(s.rdx),
            Operand::Rsi => Some(s.rsi),
            Operand::Rip => Some(s.rip),
            _ => None,
        })?;
        Ok(Placement {
            min: 0,
            max: u64::MAX,
            align: self.program_align(),
            avoid_firmware_boot_services: false,
        })
    }

    fn paravirt(&self, emitter: &mut CodeEmitter, s: &ParavirtState) -> Result<Placement> {
        let page_size = self.config.page_size;
        // The remap only moves the page the program sits in.
        let (page_start, page_end) = s
            .remapper_page(page_size)
            .and_then(|page| Some((page, page.checked_add(page_size)?)))
            .ok_or(RelocatorError::InvalidBootState("remapper page overflows"))?;
        let pte = s.remapper_pte().ok_or(RelocatorError::InvalidBootState(
            "remapper frame beyond physical address width",
        ))?;
        let root =
            s.root_pfn().ok_or(RelocatorError::InvalidBootState("no page-table window"))?;
        // Code after the remap runs at remapper_virt + program offset.
        let remapped = |offset: usize| {
            s.remapper_virt
                .checked_add(offset as u64)
                .ok_or(RelocatorError::InvalidBootState("remapper address overflows"))
        };

        emitter.emit(&x86::XEN_REMAP, |operand| match operand {
            Operand::RemapperVirt => Some(s.remapper_virt),
            Operand::RemapperPte => Some(pte),
            _ => None,
        })?;
        let continue_at = remapped(emitter.len() + x86::JUMP64.len())?;
        emitter.emit(&x86::JUMP64, |operand| match operand {
            Operand::Target => Some(continue_at),
            _ => None,
        })?;

        for window in s.paging.iter().filter(|w| w.pages != 0) {
            emitter.emit(&x86::XEN_WINDOW, |operand| match operand {
                Operand::WindowVirt => Some(window.virt),
                Operand::WindowPfn => Some(window.pfn),
                Operand::WindowPages => Some(window.pages),
                Operand::MfnList => Some(s.mfn_list),
                _ => None,
            })?;
        }

        let ops = remapped(emitter.len() + x86::XEN_FINISH_OPS_OFFSET)?;
        emitter.emit(&x86::XEN_FINISH, |operand| match operand {
            Operand::MfnList => Some(s.mfn_list),
            Operand::RootPfn => Some(root),
            Operand::OpsVirt => Some(ops),
            Operand::Stack => Some(s.stack),
            Operand::StartInfo => Some(s.start_info),
            Operand::Entry => Some(s.entry_point),
            _ => None,
        })?;

        if emitter.len() as u64 > page_size {
            return Err(RelocatorError::ProgramTooLarge {
                size: emitter.len() as u64,
                limit: page_size,
            });
        }
        Ok(Placement {
            min: page_start,
            max: page_end,
            align: page_size,
            avoid_firmware_boot_services: false,
        })
    }
}

fn no_operands(_: Operand) -> Option<u64> {
    None
}

/// Copy template for a loader mode and direction
pub fn copy_template(mode: CpuMode, direction: Direction) -> &'static CodeTemplate {
    match (mode, direction) {
        (CpuMode::Long64, Direction::Forward) => &x86::COPY64_FORWARD,
        (CpuMode::Long64, Direction::Backward) => &x86::COPY64_BACKWARD,
        (CpuMode::Protected32, Direction::Forward) => &x86::COPY32_FORWARD,
        (CpuMode::Protected32, Direction::Backward) => &x86::COPY32_BACKWARD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AddressWindow, PagingWindow};
    use alloc::vec::Vec;

    const CONFIG: RelocatorConfig = RelocatorConfig::new();

    fn compile(mode: CpuMode, copies: &[CopyOp], state: &BootState) -> Result<Program> {
        TrampolineCompiler::new(mode, &CONFIG).compile(copies, state)
    }

    fn paravirt() -> ParavirtState {
        let mut state = ParavirtState {
            start_info: 0xFFFF_8000_0010_0000,
            mfn_list: 0xFFFF_8000_0020_0000,
            stack: 0xFFFF_8000_0030_0000,
            entry_point: 0xFFFF_8000_0000_1000,
            remapper_pfn: 0x90,
            remapper_mfn: 0x5678,
            remapper_virt: 0xFFFF_8000_0040_0000,
            ..Default::default()
        };
        state.paging.push(PagingWindow { virt: 0xFFFF_8000_0050_0000, pfn: 0x500, pages: 6 });
        state.paging.push(PagingWindow { virt: 0, pfn: 0, pages: 0 });
        state
    }

    #[test]
    fn test_unsupported_transitions() {
        let state = BootState::Long64FirmwareCall(FirmwareCallState::default());
        assert_eq!(
            compile(CpuMode::Protected32, &[], &state),
            Err(RelocatorError::UnsupportedTransition {
                from: CpuMode::Protected32,
                to: BootStateKind::Long64FirmwareCall,
            })
        );
        let state = BootState::ParavirtGuest(paravirt());
        assert!(matches!(
            compile(CpuMode::Protected32, &[], &state),
            Err(RelocatorError::UnsupportedTransition { .. })
        ));
    }

    #[test]
    fn test_long64_to_long64_layout() {
        let copies = [CopyOp::new(0x20_0000, 0x10_0000, 0x1000).unwrap()];
        let state = BootState::Long64(Long64State { rip: 0x10_0000, ..Default::default() });
        let program = compile(CpuMode::Long64, &copies, &state).unwrap();
        assert_eq!(program.len(), x86::COPY64_FORWARD.len() + x86::STATE64.len());
        assert!(program.fixups().is_empty());
        assert_eq!(program.copy_count(), 1);
    }

    #[test]
    fn test_protected32_copies_above_4g_rejected() {
        let copies = [CopyOp::new(0x1_0000_0000, 0x10_0000, 0x1000).unwrap()];
        let state = BootState::Protected32(Protected32State::default());
        assert!(matches!(
            compile(CpuMode::Protected32, &copies, &state),
            Err(RelocatorError::OperandOutOfRange {
                template: "copy32.forward",
                operand: Operand::Source,
                ..
            })
        ));
    }

    #[test]
    fn test_enter_long_rejects_high_cr3() {
        let state = BootState::Long64(Long64State { cr3: 0x1_0000_0000, ..Default::default() });
        assert!(matches!(
            compile(CpuMode::Protected32, &[], &state),
            Err(RelocatorError::OperandOutOfRange {
                template: "enter_long",
                operand: Operand::Cr3,
                ..
            })
        ));
        assert!(compile(CpuMode::Long64, &[], &state).is_ok());
    }

    #[test]
    fn test_real16_placement_and_a20() {
        let mut s = Real16State { cs: 0, ip: 0x7C00, ..Default::default() };
        let plain = compile(CpuMode::Protected32, &[], &BootState::Real16(s)).unwrap();
        s.a20 = true;
        let with_a20 = compile(CpuMode::Protected32, &[], &BootState::Real16(s)).unwrap();
        assert_eq!(with_a20.len(), plain.len() + x86::A20_FAST.len());
        assert_eq!(plain.placement().max, 0xA0000);
        assert_eq!(plain.placement().align, 16);

        let from_long = compile(CpuMode::Long64, &[], &BootState::Real16(s)).unwrap();
        assert_eq!(from_long.len(), with_a20.len() + x86::LEAVE_LONG.len());
    }

    #[test]
    fn test_protected32_placement_clamped_by_loader_reach() {
        let state = BootState::Long64(Long64State {
            code_window: AddressWindow::anywhere(),
            ..Default::default()
        });
        let program = compile(CpuMode::Protected32, &[], &state).unwrap();
        assert_eq!(program.placement().max, 1 << 32);
        let program = compile(CpuMode::Long64, &[], &state).unwrap();
        assert_eq!(program.placement().max, u64::MAX);
    }

    #[test]
    fn test_protected32_placement_avoids_boot_services() {
        let state = Protected32State { avoid_firmware_boot_services: true, ..Default::default() };
        let program = compile(CpuMode::Long64, &[], &BootState::Protected32(state)).unwrap();
        assert!(program.placement().avoid_firmware_boot_services);
        assert_eq!(program.placement().max, 1 << 32);

        let state = BootState::Protected32(Protected32State::default());
        let program = compile(CpuMode::Long64, &[], &state).unwrap();
        assert!(!program.placement().avoid_firmware_boot_services);
    }

    #[test]
    fn test_empty_code_window_rejected() {
        let state = BootState::Long64(Long64State {
            code_window: AddressWindow::new(0x1000, 0x1000),
            ..Default::default()
        });
        assert!(matches!(
            compile(CpuMode::Long64, &[], &state),
            Err(RelocatorError::InvalidBootState(_))
        ));
    }

    #[test]
    fn test_paravirt_layout() {
        let state = paravirt();
        let program =
            compile(CpuMode::Long64, &[], &BootState::ParavirtGuest(state.clone())).unwrap();
        let expected = x86::XEN_REMAP.len()
            + x86::JUMP64.len()
            + x86::XEN_WINDOW.len()
            + x86::XEN_FINISH.len();
        assert_eq!(program.len(), expected);
        let placement = program.placement();
        assert_eq!((placement.min, placement.max, placement.align), (0x9_0000, 0x9_1000, 4096));

        let bytes = program.bytes();
        let pte = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        assert_eq!(pte, 0x567_8000 | 0x63);
        let jump = x86::XEN_REMAP.len();
        let target = u64::from_le_bytes(bytes[jump + 2..jump + 10].try_into().unwrap());
        assert_eq!(target, state.remapper_virt + (jump + x86::JUMP64.len()) as u64);

        let finish = expected - x86::XEN_FINISH.len();
        let ops = u64::from_le_bytes(bytes[finish + 26..finish + 34].try_into().unwrap());
        assert_eq!(ops, state.remapper_virt + (finish + x86::XEN_FINISH_OPS_OFFSET) as u64);
        let root = u64::from_le_bytes(bytes[finish + 12..finish + 20].try_into().unwrap());
        assert_eq!(root, 0x500);
    }

    #[test]
    fn test_paravirt_requires_page_table_window() {
        let mut state = paravirt();
        state.paging.clear();
        assert_eq!(
            compile(CpuMode::Long64, &[], &BootState::ParavirtGuest(state)),
            Err(RelocatorError::InvalidBootState("no page-table window"))
        );
    }

    #[test]
    fn test_paravirt_remapper_page_overflow_rejected() {
        let state = ParavirtState { remapper_pfn: u64::MAX >> 12, ..paravirt() };
        assert_eq!(
            compile(CpuMode::Long64, &[], &BootState::ParavirtGuest(state)),
            Err(RelocatorError::InvalidBootState("remapper page overflows"))
        );
    }

    #[test]
    fn test_paravirt_program_must_fit_page() {
        let copies: Vec<CopyOp> = (0..200u64)
            .map(|i| CopyOp::new(0x100_0000 + i * 0x1000, 0x10_0000 + i * 0x1000, 0x1000).unwrap())
            .collect();
        assert!(matches!(
            compile(CpuMode::Long64, &copies, &BootState::ParavirtGuest(paravirt())),
            Err(RelocatorError::ProgramTooLarge { limit: 4096, .. })
        ));
    }

    #[test]
    fn test_copy_templates_follow_direction() {
        let copies = [
            CopyOp::new(0x2000, 0x1000, 8).unwrap(),
            CopyOp::new(0x1000, 0x2000, 8).unwrap(),
        ];
        let names: Vec<&str> = copies
            .iter()
            .map(|op| copy_template(CpuMode::Protected32, op.direction).name)
            .collect();
        assert_eq!(names, ["copy32.forward", "copy32.backward"]);
    }
}
