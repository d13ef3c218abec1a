//! x86 template families
//!
//! Hand-assembled fragments for 32-bit and 64-bit loaders. Byte offsets in
//! the comments are relative to the start of each fragment.

use static_assertions::const_assert_eq;

use super::{CodeTemplate, Operand, OperandWidth, PatchPoint};

use OperandWidth::{DescriptorBase, U16, U32, U64};

/// GDT selectors installed by [`GDT`]
pub const SELECTOR_CODE32: u16 = 0x08;
pub const SELECTOR_DATA32: u16 = 0x10;
pub const SELECTOR_CODE64: u16 = 0x18;
pub const SELECTOR_CODE16: u16 = 0x20;
pub const SELECTOR_DATA16: u16 = 0x28;

/// Offset of the first descriptor inside the GDT block
pub const GDT_TABLE_OFFSET: usize = 16;
const GDT_DESCRIPTORS: usize = 6;

/// Offset of the `mmuext_op` batch inside [`XEN_FINISH`]
pub const XEN_FINISH_OPS_OFFSET: usize = 96;
const MMUEXT_OP_SIZE: usize = 24;

const fn p(offset: usize, width: OperandWidth, operand: Operand) -> PatchPoint {
    PatchPoint::new(offset, width, operand)
}

// ---------------------------------------------------------------------------
// Bulk copies
// ---------------------------------------------------------------------------

#[rustfmt::skip]
const COPY64_FORWARD_CODE: [u8; 33] = [
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0, // mov rsi, src
    0x48, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0, // mov rdi, dest
    0x48, 0xB9, 0, 0, 0, 0, 0, 0, 0, 0, // mov rcx, len
    0xFC,                               // cld
    0xF3, 0xA4,                         // rep movsb
];

#[rustfmt::skip]
const COPY64_BACKWARD_CODE: [u8; 34] = [
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0, // mov rsi, src + len - 1
    0x48, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0, // mov rdi, dest + len - 1
    0x48, 0xB9, 0, 0, 0, 0, 0, 0, 0, 0, // mov rcx, len
    0xFD,                               // std
    0xF3, 0xA4,                         // rep movsb
    0xFC,                               // cld
];

const COPY64_PATCHES: [PatchPoint; 3] = [
    p(2, U64, Operand::Source),
    p(12, U64, Operand::Destination),
    p(22, U64, Operand::Length),
];

#[rustfmt::skip]
const COPY32_FORWARD_CODE: [u8; 18] = [
    0xBE, 0, 0, 0, 0, // mov esi, src
    0xBF, 0, 0, 0, 0, // mov edi, dest
    0xB9, 0, 0, 0, 0, // mov ecx, len
    0xFC,             // cld
    0xF3, 0xA4,       // rep movsb
];

#[rustfmt::skip]
const COPY32_BACKWARD_CODE: [u8; 19] = [
    0xBE, 0, 0, 0, 0,
    0xBF, 0, 0, 0, 0,
    0xB9, 0, 0, 0, 0,
    0xFD,             // std
    0xF3, 0xA4,
    0xFC,
];

const COPY32_PATCHES: [PatchPoint; 3] = [
    p(1, U32, Operand::Source),
    p(6, U32, Operand::Destination),
    p(11, U32, Operand::Length),
];

pub static COPY64_FORWARD: CodeTemplate = CodeTemplate {
    name: "copy64.forward",
    bytes: &COPY64_FORWARD_CODE,
    patches: &COPY64_PATCHES,
};

/// Source and destination operands are the addresses of the last byte
pub static COPY64_BACKWARD: CodeTemplate = CodeTemplate {
    name: "copy64.backward",
    bytes: &COPY64_BACKWARD_CODE,
    patches: &COPY64_PATCHES,
};

pub static COPY32_FORWARD: CodeTemplate = CodeTemplate {
    name: "copy32.forward",
    bytes: &COPY32_FORWARD_CODE,
    patches: &COPY32_PATCHES,
};

pub static COPY32_BACKWARD: CodeTemplate = CodeTemplate {
    name: "copy32.backward",
    bytes: &COPY32_BACKWARD_CODE,
    patches: &COPY32_PATCHES,
};

// ---------------------------------------------------------------------------
// Absolute jump
// ---------------------------------------------------------------------------

#[rustfmt::skip]
const JUMP64_CODE: [u8; 12] = [
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // mov rax, target
    0xFF, 0xE0,                         // jmp rax
];

pub static JUMP64: CodeTemplate = CodeTemplate {
    name: "jump64",
    bytes: &JUMP64_CODE,
    patches: &[p(2, U64, Operand::Target)],
};

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

#[rustfmt::skip]
const GDT_CODE: [u8; 64] = [
    // GDTR image: limit, 64-bit base, padding
    0x2F, 0x00, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0,
    // 16: null
    0, 0, 0, 0, 0, 0, 0, 0,
    // 24: flat 32-bit code
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00,
    // 32: flat 32-bit data
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00,
    // 40: 64-bit code
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xAF, 0x00,
    // 48: 16-bit code based at the program
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0x00, 0x00,
    // 56: 16-bit data based at the program
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0x00, 0x00,
];

const_assert_eq!(GDT_CODE.len(), GDT_TABLE_OFFSET + GDT_DESCRIPTORS * 8);
const_assert_eq!(GDT_CODE[0] as usize, GDT_DESCRIPTORS * 8 - 1);
const_assert_eq!(SELECTOR_DATA16 as usize, (GDT_DESCRIPTORS - 1) * 8);

pub static GDT: CodeTemplate = CodeTemplate {
    name: "gdt",
    bytes: &GDT_CODE,
    patches: &[
        p(2, U64, Operand::GdtTable),
        p(GDT_TABLE_OFFSET + SELECTOR_CODE16 as usize, DescriptorBase, Operand::SegmentBase),
        p(GDT_TABLE_OFFSET + SELECTOR_DATA16 as usize, DescriptorBase, Operand::SegmentBase),
    ],
};

// ---------------------------------------------------------------------------
// Mode switches
// ---------------------------------------------------------------------------

#[rustfmt::skip]
const LEAVE_LONG_CODE: [u8; 72] = [
    0xFA,                               // 0: cli
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // 1: mov rax, gdtr
    0x0F, 0x01, 0x10,                   // 11: lgdt [rax]
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // 14: mov rax, farptr
    0xFF, 0x28,                         // 24: jmp far [rax]
    0, 0, 0, 0, 0x08, 0x00,             // 26: farptr -> 32:code32
    0x0F, 0x20, 0xC0,                   // 32: mov eax, cr0
    0x25, 0xFF, 0xFF, 0xFF, 0x7F,       // and eax, ~PG
    0x0F, 0x22, 0xC0,                   // mov cr0, eax
    0xB9, 0x80, 0x00, 0x00, 0xC0,       // mov ecx, EFER
    0x0F, 0x32,                         // rdmsr
    0x25, 0xFF, 0xFE, 0xFF, 0xFF,       // and eax, ~LME
    0x0F, 0x30,                         // wrmsr
    0xB8, 0x10, 0x00, 0x00, 0x00,       // mov eax, data32
    0x8E, 0xD8,                         // mov ds, ax
    0x8E, 0xC0,                         // mov es, ax
    0x8E, 0xD0,                         // mov ss, ax
    0x8E, 0xE0,                         // mov fs, ax
    0x8E, 0xE8,                         // mov gs, ax
];

const_assert_eq!(LEAVE_LONG_CODE[30] as u16, SELECTOR_CODE32);
const_assert_eq!(LEAVE_LONG_CODE[58] as u16, SELECTOR_DATA32);

/// Drop from long mode to flat 32-bit protected mode with paging off
pub static LEAVE_LONG: CodeTemplate = CodeTemplate {
    name: "leave_long",
    bytes: &LEAVE_LONG_CODE,
    patches: &[
        p(3, U64, Operand::GdtPointer),
        p(16, U64, Operand::Here(26)),
        p(26, U32, Operand::Here(32)),
    ],
};

#[rustfmt::skip]
const ENTER_LONG_CODE: [u8; 56] = [
    0x0F, 0x01, 0x15, 0, 0, 0, 0,       // 0: lgdt [gdtr]
    0x0F, 0x20, 0xE0,                   // 7: mov eax, cr4
    0x83, 0xC8, 0x20,                   // or eax, PAE
    0x0F, 0x22, 0xE0,                   // mov cr4, eax
    0xB8, 0, 0, 0, 0,                   // 16: mov eax, cr3
    0x0F, 0x22, 0xD8,                   // mov cr3, eax
    0xB9, 0x80, 0x00, 0x00, 0xC0,       // 24: mov ecx, EFER
    0x0F, 0x32,                         // rdmsr
    0x0D, 0x00, 0x01, 0x00, 0x00,       // or eax, LME
    0x0F, 0x30,                         // wrmsr
    0x0F, 0x20, 0xC0,                   // 38: mov eax, cr0
    0x0D, 0x01, 0x00, 0x00, 0x80,       // or eax, PG | PE
    0x0F, 0x22, 0xC0,                   // mov cr0, eax
    0xEA, 0, 0, 0, 0, 0x18, 0x00,       // 49: jmp code64:56
];

const_assert_eq!(ENTER_LONG_CODE[54] as u16, SELECTOR_CODE64);

/// Enable PAE, EFER.LME and paging, then far jump into 64-bit code
pub static ENTER_LONG: CodeTemplate = CodeTemplate {
    name: "enter_long",
    bytes: &ENTER_LONG_CODE,
    patches: &[
        p(3, U32, Operand::GdtPointer),
        p(17, U32, Operand::Cr3),
        p(50, U32, Operand::Here(56)),
    ],
};

#[rustfmt::skip]
const A20_FAST_CODE: [u8; 8] = [
    0xE4, 0x92, // in al, 0x92
    0x0C, 0x02, // or al, 2
    0x24, 0xFE, // and al, ~1
    0xE6, 0x92, // out 0x92, al
];

pub static A20_FAST: CodeTemplate = CodeTemplate {
    name: "a20.fast",
    bytes: &A20_FAST_CODE,
    patches: &[],
};

// ---------------------------------------------------------------------------
// Epilogues
// ---------------------------------------------------------------------------

#[rustfmt::skip]
const STATE32_CODE: [u8; 70] = [
    0x0F, 0x01, 0x15, 0, 0, 0, 0,       // 0: lgdt [gdtr]
    0xB8, 0x10, 0x00, 0x00, 0x00,       // 7: mov eax, data32
    0x8E, 0xD8,
    0x8E, 0xC0,
    0x8E, 0xD0,
    0x8E, 0xE0,
    0x8E, 0xE8,
    0xBC, 0, 0, 0, 0,                   // 22: mov esp
    0xBD, 0, 0, 0, 0,                   // 27: mov ebp
    0xBE, 0, 0, 0, 0,                   // 32: mov esi
    0xBF, 0, 0, 0, 0,                   // 37: mov edi
    0xB8, 0, 0, 0, 0,                   // 42: mov eax
    0xBB, 0, 0, 0, 0,                   // 47: mov ebx
    0xB9, 0, 0, 0, 0,                   // 52: mov ecx
    0xBA, 0, 0, 0, 0,                   // 57: mov edx
    0xFC,                               // 62: cld
    0xEA, 0, 0, 0, 0, 0x08, 0x00,       // 63: jmp code32:eip
];

const_assert_eq!(STATE32_CODE[68] as u16, SELECTOR_CODE32);

pub static STATE32: CodeTemplate = CodeTemplate {
    name: "state32",
    bytes: &STATE32_CODE,
    patches: &[
        p(3, U32, Operand::GdtPointer),
        p(23, U32, Operand::Esp),
        p(28, U32, Operand::Ebp),
        p(33, U32, Operand::Esi),
        p(38, U32, Operand::Edi),
        p(43, U32, Operand::Eax),
        p(48, U32, Operand::Ebx),
        p(53, U32, Operand::Ecx),
        p(58, U32, Operand::Edx),
        p(64, U32, Operand::Eip),
    ],
};

#[rustfmt::skip]
const STATE64_CODE: [u8; 88] = [
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // 0: mov rax, cr3
    0x0F, 0x22, 0xD8,                   // mov cr3, rax
    0x48, 0xBC, 0, 0, 0, 0, 0, 0, 0, 0, // 13: mov rsp
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0, // 23: mov rsi
    0x48, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0, // 33: mov rbx
    0x48, 0xB9, 0, 0, 0, 0, 0, 0, 0, 0, // 43: mov rcx
    0x48, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0, // 53: mov rdx
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // 63: mov rax
    0xFC,                               // 73: cld
    0xFF, 0x25, 0, 0, 0, 0,             // 74: jmp [rip]
    0, 0, 0, 0, 0, 0, 0, 0,             // 80: rip
];

pub static STATE64: CodeTemplate = CodeTemplate {
    name: "state64",
    bytes: &STATE64_CODE,
    patches: &[
        p(2, U64, Operand::Cr3),
        p(15, U64, Operand::Rsp),
        p(25, U64, Operand::Rsi),
        p(35, U64, Operand::Rbx),
        p(45, U64, Operand::Rcx),
        p(55, U64, Operand::Rdx),
        p(65, U64, Operand::Rax),
        p(80, U64, Operand::Rip),
    ],
};

#[rustfmt::skip]
const STATE64_FIRMWARE_CODE: [u8; 65] = [
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0, // 0: mov rsi
    0x48, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0, // 10: mov rbx
    0x48, 0xB9, 0, 0, 0, 0, 0, 0, 0, 0, // 20: mov rcx
    0x48, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0, // 30: mov rdx
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, // 40: mov rax
    0xFC,                               // 50: cld
    0xFF, 0x25, 0, 0, 0, 0,             // 51: jmp [rip]
    0, 0, 0, 0, 0, 0, 0, 0,             // 57: rip
];

/// 64-bit handoff that leaves `rsp` and `cr3` alone
pub static STATE64_FIRMWARE: CodeTemplate = CodeTemplate {
    name: "state64.firmware",
    bytes: &STATE64_FIRMWARE_CODE,
    patches: &[
        p(2, U64, Operand::Rsi),
        p(12, U64, Operand::Rbx),
        p(22, U64, Operand::Rcx),
        p(32, U64, Operand::Rdx),
        p(42, U64, Operand::Rax),
        p(57, U64, Operand::Rip),
    ],
};

#[rustfmt::skip]
const STATE16_CODE: [u8; 112] = [
    0xFA,                               // 0: cli
    0x0F, 0x01, 0x15, 0, 0, 0, 0,       // 1: lgdt [gdtr]
    0xEA, 0, 0, 0, 0, 0x20, 0x00,       // 8: jmp code16:15
    // 15: 16-bit protected mode
    0xB8, 0x28, 0x00,                   // mov ax, data16
    0x8E, 0xD8,
    0x8E, 0xC0,
    0x8E, 0xD0,
    0x8E, 0xE0,
    0x8E, 0xE8,
    0x0F, 0x01, 0x1E, 0, 0,             // 28: lidt [idtr]
    0x0F, 0x20, 0xC0,                   // 33: mov eax, cr0
    0x66, 0x83, 0xE0, 0xFE,             // and eax, ~PE
    0x0F, 0x22, 0xC0,                   // mov cr0, eax
    0xEA, 0, 0, 0, 0,                   // 43: jmp seg:48
    // 48: real mode
    0xB8, 0, 0,                         // mov ax, ss
    0x8E, 0xD0,
    0xBC, 0, 0,                         // 53: mov sp
    0xB8, 0, 0,                         // 56: mov ax, ds
    0x8E, 0xD8,
    0xB8, 0, 0,                         // 61: mov ax, es
    0x8E, 0xC0,
    0xB8, 0, 0,                         // 66: mov ax, fs
    0x8E, 0xE0,
    0xB8, 0, 0,                         // 71: mov ax, gs
    0x8E, 0xE8,
    0x66, 0xBB, 0, 0, 0, 0,             // 76: mov ebx
    0x66, 0xBA, 0, 0, 0, 0,             // 82: mov edx
    0x66, 0xBE, 0, 0, 0, 0,             // 88: mov esi
    0x66, 0xBD, 0, 0, 0, 0,             // 94: mov ebp
    0xFC,                               // 100: cld
    0xEA, 0, 0, 0, 0,                   // 101: jmp cs:ip
    // 106: real-mode IVT descriptor
    0xFF, 0x03, 0x00, 0x00, 0x00, 0x00,
];

const_assert_eq!(STATE16_CODE[13] as u16, SELECTOR_CODE16);
const_assert_eq!(STATE16_CODE[16] as u16, SELECTOR_DATA16);

/// Drop from 32-bit protected mode to real mode
///
/// The program is entered through a 16-bit segment based at its own address,
/// so it must sit below 1 MiB on a 16-byte boundary.
pub static STATE16: CodeTemplate = CodeTemplate {
    name: "state16",
    bytes: &STATE16_CODE,
    patches: &[
        p(4, U32, Operand::GdtPointer),
        p(9, U32, Operand::BlockOffset(15)),
        p(31, U16, Operand::BlockOffset(106)),
        p(44, U16, Operand::BlockOffset(48)),
        p(46, U16, Operand::RealModeSegment),
        p(49, U16, Operand::Ss),
        p(54, U16, Operand::Sp),
        p(57, U16, Operand::Ds),
        p(62, U16, Operand::Es),
        p(67, U16, Operand::Fs),
        p(72, U16, Operand::Gs),
        p(78, U32, Operand::Ebx),
        p(84, U32, Operand::Edx),
        p(90, U32, Operand::Esi),
        p(96, U32, Operand::Ebp),
        p(102, U16, Operand::Ip),
        p(104, U16, Operand::Cs),
    ],
};

// ---------------------------------------------------------------------------
// Paravirtual guest
// ---------------------------------------------------------------------------

const HYPERVISOR_UPDATE_VA_MAPPING: u8 = 14;
const HYPERVISOR_MMUEXT_OP: u8 = 26;
const UVMF_INVLPG: u8 = 2;

#[rustfmt::skip]
const XEN_REMAP_CODE: [u8; 32] = [
    0x48, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0,         // 0: mov rdi, va
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0,         // 10: mov rsi, pte
    0xBA, UVMF_INVLPG, 0x00, 0x00, 0x00,        // 20: mov edx, flags
    0xB8, HYPERVISOR_UPDATE_VA_MAPPING, 0x00, 0x00, 0x00,
    0x0F, 0x05,                                 // 30: syscall
];

/// Map the trampoline page at its final virtual address
pub static XEN_REMAP: CodeTemplate = CodeTemplate {
    name: "xen.remap",
    bytes: &XEN_REMAP_CODE,
    patches: &[p(2, U64, Operand::RemapperVirt), p(12, U64, Operand::RemapperPte)],
};

#[rustfmt::skip]
const XEN_WINDOW_CODE: [u8; 82] = [
    0x48, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0,         // 0: mov rbx, virt
    0x49, 0xBC, 0, 0, 0, 0, 0, 0, 0, 0,         // 10: mov r12, pages
    0x49, 0xBD, 0, 0, 0, 0, 0, 0, 0, 0,         // 20: mov r13, pfn
    0x49, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0,         // 30: mov r14, mfn_list
    // 40: loop
    0x4B, 0x8B, 0x34, 0xEE,                     // mov rsi, [r14 + r13 * 8]
    0x48, 0xC1, 0xE6, 0x0C,                     // shl rsi, 12
    0x48, 0x83, 0xCE, 0x01,                     // or rsi, PRESENT
    0x48, 0x89, 0xDF,                           // mov rdi, rbx
    0xBA, UVMF_INVLPG, 0x00, 0x00, 0x00,
    0xB8, HYPERVISOR_UPDATE_VA_MAPPING, 0x00, 0x00, 0x00,
    0x0F, 0x05,                                 // syscall
    0x48, 0x81, 0xC3, 0x00, 0x10, 0x00, 0x00,   // add rbx, 4096
    0x49, 0xFF, 0xC5,                           // inc r13
    0x49, 0xFF, 0xCC,                           // dec r12
    0x75, 0xD6,                                 // jnz loop
];

const_assert_eq!(XEN_WINDOW_CODE[81], 0xD6);

/// Map every page of one page-table window read-only
pub static XEN_WINDOW: CodeTemplate = CodeTemplate {
    name: "xen.window",
    bytes: &XEN_WINDOW_CODE,
    patches: &[
        p(2, U64, Operand::WindowVirt),
        p(12, U64, Operand::WindowPages),
        p(22, U64, Operand::WindowPfn),
        p(32, U64, Operand::MfnList),
    ],
};

#[rustfmt::skip]
const XEN_FINISH_CODE: [u8; 144] = [
    0x49, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0,         // 0: mov r14, mfn_list
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0,         // 10: mov rax, root pfn
    0x49, 0x8B, 0x04, 0xC6,                     // 20: mov rax, [r14 + rax * 8]
    0x48, 0xBF, 0, 0, 0, 0, 0, 0, 0, 0,         // 24: mov rdi, ops
    0x48, 0x89, 0x47, 0x08,                     // 34: mov [rdi + 8], rax
    0x48, 0x89, 0x47, 0x20,                     // 38: mov [rdi + 32], rax
    0xBE, 0x02, 0x00, 0x00, 0x00,               // 42: mov esi, 2
    0x31, 0xD2,                                 // xor edx, edx
    0x41, 0xBA, 0xF0, 0x7F, 0x00, 0x00,         // mov r10d, DOMID_SELF
    0xB8, HYPERVISOR_MMUEXT_OP, 0x00, 0x00, 0x00,
    0x0F, 0x05,                                 // 60: syscall
    0x48, 0xBC, 0, 0, 0, 0, 0, 0, 0, 0,         // 62: mov rsp, stack
    0x48, 0xBE, 0, 0, 0, 0, 0, 0, 0, 0,         // 72: mov rsi, start_info
    0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0,         // 82: mov rax, entry
    0xFF, 0xE0,                                 // 92: jmp rax
    0x00, 0x00,
    // 96: MMUEXT_PIN_L4_TABLE
    0x03, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    // 120: MMUEXT_NEW_BASEPTR
    0x05, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,
];

const_assert_eq!(XEN_FINISH_CODE.len(), XEN_FINISH_OPS_OFFSET + 2 * MMUEXT_OP_SIZE);
const_assert_eq!(XEN_FINISH_CODE[XEN_FINISH_OPS_OFFSET], 3);
const_assert_eq!(XEN_FINISH_CODE[XEN_FINISH_OPS_OFFSET + MMUEXT_OP_SIZE], 5);

/// Pin the new root table, switch to it and enter the guest kernel
pub static XEN_FINISH: CodeTemplate = CodeTemplate {
    name: "xen.finish",
    bytes: &XEN_FINISH_CODE,
    patches: &[
        p(2, U64, Operand::MfnList),
        p(12, U64, Operand::RootPfn),
        p(26, U64, Operand::OpsVirt),
        p(64, U64, Operand::Stack),
        p(74, U64, Operand::StartInfo),
        p(84, U64, Operand::Entry),
    ],
};

/// Every template, for table-wide checks
pub static ALL: [&CodeTemplate; 16] = [
    &COPY64_FORWARD,
    &COPY64_BACKWARD,
    &COPY32_FORWARD,
    &COPY32_BACKWARD,
    &JUMP64,
    &GDT,
    &LEAVE_LONG,
    &ENTER_LONG,
    &A20_FAST,
    &STATE32,
    &STATE64,
    &STATE64_FIRMWARE,
    &STATE16,
    &XEN_REMAP,
    &XEN_WINDOW,
    &XEN_FINISH,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_templates_share_prefix() {
        assert_eq!(COPY64_FORWARD.bytes[..30], COPY64_BACKWARD.bytes[..30]);
        assert_eq!(COPY32_FORWARD.bytes[..15], COPY32_BACKWARD.bytes[..15]);
        assert_eq!(COPY64_BACKWARD.bytes[30], 0xFD);
        assert_eq!(*COPY64_BACKWARD.bytes.last().unwrap(), 0xFC);
    }

    #[test]
    fn test_here_labels_inside_template() {
        for template in ALL {
            for patch in template.patches {
                if let Operand::Here(label) | Operand::BlockOffset(label) = patch.operand {
                    assert!((label as usize) <= template.len(), "{}", template.name);
                }
            }
        }
    }

    #[test]
    fn test_window_loop_target() {
        // jnz displacement lands on the first loop instruction
        let end = XEN_WINDOW.len() as i64;
        let disp = XEN_WINDOW.bytes[81] as i8 as i64;
        assert_eq!(end + disp, 40);
        assert_eq!(XEN_WINDOW.bytes[40], 0x4B);
    }

    #[test]
    fn test_real_mode_idt_limit() {
        assert_eq!(&STATE16.bytes[106..], &[0xFF, 0x03, 0, 0, 0, 0]);
    }
}
