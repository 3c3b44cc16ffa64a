// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine/ABI definitions shared between the VM, the loader, and host tools.
//!
//! Everything in this crate is defined by the virtual machine architecture
//! itself — instruction encodings, the call frame layout, the fault taxonomy,
//! the debugger wire protocol — rather than by any particular implementation
//! of it. It deliberately has almost no dependencies so that both the VM and
//! offline tooling can share it.

#![cfg_attr(not(test), no_std)]

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod debug;
pub mod instr;
pub mod log;
pub mod svc;

/// Unit of validation: 64 bundles of code.
pub const BLOCK_SIZE: usize = 256;

/// Granularity of branch targets. All valid control transfer lands on a
/// bundle boundary.
pub const BUNDLE_SIZE: usize = 4;

pub const BUNDLES_PER_BLOCK: usize = BLOCK_SIZE / BUNDLE_SIZE;

/// Registers are wide enough to hold a native pointer, so that an emulator
/// may store host-derived values in them. The ISA-visible width is 32 bits;
/// flags are always computed on 32-bit results, and values entering guest
/// memory must be squashed back to 32 bits first.
pub type Reg = usize;

pub const REG_FP: usize = 11;
pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;
pub const REG_PC: usize = 15;
pub const REG_CPSR: usize = 16;
pub const NUM_REGS: usize = 17;

/// ABI call stack frame, pushed by `call` and popped by the return SVC.
///
/// The size of this struct must remain constant; the compiler relies on it
/// to calculate stack offsets for parameter passing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CallFrame {
    pub pc: u32,
    pub fp: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<CallFrame>(), 32);

/// Exception entry frame. On hardware this is pushed by the exception
/// machinery; the emulator pushes and pops it explicitly so that SVC
/// handlers see the same stack layout either way.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HwContext {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub return_addr: u32,
    pub xpsr: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<HwContext>(), 32);

/// A record describing a fault taken by the guest program.
///
/// Faults are unrecoverable from inside the VM: the runtime records the
/// fault, snapshots registers, and terminates the current user invocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum FaultCode {
    /// Stack allocation failure.
    StackOverflow = 0x01,
    /// Validation-time stack address error.
    BadStack = 0x02,
    /// Branch-time code address error.
    BadCodeAddress = 0x03,
    /// Unsupported syscall number.
    BadSyscall = 0x04,
    /// Runtime load address error.
    LoadAddress = 0x05,
    /// Runtime store address error.
    StoreAddress = 0x06,
    /// Runtime load alignment error.
    LoadAlignment = 0x07,
    /// Runtime store alignment error.
    StoreAlignment = 0x08,
    /// Runtime code fetch error.
    CodeFetch = 0x09,
    /// Runtime code alignment error.
    CodeAlignment = 0x0A,
    /// Unhandled instruction reached the interpreter. Since only validated
    /// code executes, this detects a validator bug.
    CpuSim = 0x0B,
    /// Reserved SVC encoding.
    ReservedSvc = 0x0C,
    /// Reserved addrop encoding.
    ReservedAddrop = 0x0D,
    /// Explicit abort from the guest.
    Abort = 0x0E,
    /// Bad address in a long stack load addrop.
    LongStackLoad = 0x0F,
    /// Bad address in a long stack store addrop.
    LongStackStore = 0x10,
    /// Bad address for an asynchronous preload.
    PreloadAddress = 0x11,
    /// Bad saved FP detected during return; the stack has been corrupted.
    ReturnFrame = 0x12,
    /// Memory fault while fetching log data.
    LogFetch = 0x13,
    /// Bad address in a system call.
    SyscallAddress = 0x14,
    /// Other bad parameter in a system call.
    SyscallParam = 0x15,
    /// Exception during script execution.
    ScriptException = 0x16,
    /// Bad filesystem volume handle.
    BadVolumeHandle = 0x17,
    /// Bad ELF binary header.
    BadElfHeader = 0x18,
    /// Bad asset image.
    BadAssetImage = 0x19,
    /// Launcher program not found.
    NoLauncher = 0x1A,
    /// Address in a system call has insufficient alignment.
    SyscallAddrAlign = 0x1B,
    /// Invalid or unbound asset slot.
    BadAssetSlot = 0x1C,
    /// Failed to initialize the read-write data segment.
    RwdataSeg = 0x1D,
    /// Main thread is not responding.
    NotResponding = 0x1E,
    /// Bad asset configuration.
    BadAssetConfig = 0x1F,
    /// Incorrect asset loader.
    BadAssetLoader = 0x20,
}

impl FaultCode {
    /// Full-size fault strings, used by the debugger and the panic screen.
    pub fn describe(self) -> &'static str {
        match self {
            Self::StackOverflow => "Stack allocation failure",
            Self::BadStack => "Validation-time stack address error",
            Self::BadCodeAddress => "Branch-time code address error",
            Self::BadSyscall => "Unsupported syscall number",
            Self::LoadAddress => "Runtime load address error",
            Self::StoreAddress => "Runtime store address error",
            Self::LoadAlignment => "Runtime load alignment error",
            Self::StoreAlignment => "Runtime store alignment error",
            Self::CodeFetch => "Runtime code fetch error",
            Self::CodeAlignment => "Runtime code alignment error",
            Self::CpuSim => "Unhandled instruction in interpreter",
            Self::ReservedSvc => "Reserved SVC encoding",
            Self::ReservedAddrop => "Reserved addrop encoding",
            Self::Abort => "User abort",
            Self::LongStackLoad => "Bad address in long stack load",
            Self::LongStackStore => "Bad address in long stack store",
            Self::PreloadAddress => "Bad address for async preload",
            Self::ReturnFrame => "Bad saved FP value detected during return",
            Self::LogFetch => "Memory fault while fetching log data",
            Self::SyscallAddress => "Bad address in system call",
            Self::SyscallParam => "Other bad parameter in system call",
            Self::ScriptException => "Exception during script execution",
            Self::BadVolumeHandle => "Bad filesystem volume handle",
            Self::BadElfHeader => "Bad ELF binary header",
            Self::BadAssetImage => "Bad asset image",
            Self::NoLauncher => "Launcher program not found",
            Self::SyscallAddrAlign => {
                "Address in system call has insufficient alignment"
            }
            Self::BadAssetSlot => "Invalid or unbound asset slot",
            Self::RwdataSeg => "Failed to initialize read-write data segment",
            Self::NotResponding => "Main thread is not responding",
            Self::BadAssetConfig => "Bad asset configuration",
            Self::BadAssetLoader => "Incorrect asset loader",
        }
    }
}

/// We're using an explicit `TryFrom` impl for `FaultCode` instead of
/// `FromPrimitive` because this crate doesn't otherwise depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for FaultCode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        Ok(match x {
            0x01 => Self::StackOverflow,
            0x02 => Self::BadStack,
            0x03 => Self::BadCodeAddress,
            0x04 => Self::BadSyscall,
            0x05 => Self::LoadAddress,
            0x06 => Self::StoreAddress,
            0x07 => Self::LoadAlignment,
            0x08 => Self::StoreAlignment,
            0x09 => Self::CodeFetch,
            0x0A => Self::CodeAlignment,
            0x0B => Self::CpuSim,
            0x0C => Self::ReservedSvc,
            0x0D => Self::ReservedAddrop,
            0x0E => Self::Abort,
            0x0F => Self::LongStackLoad,
            0x10 => Self::LongStackStore,
            0x11 => Self::PreloadAddress,
            0x12 => Self::ReturnFrame,
            0x13 => Self::LogFetch,
            0x14 => Self::SyscallAddress,
            0x15 => Self::SyscallParam,
            0x16 => Self::ScriptException,
            0x17 => Self::BadVolumeHandle,
            0x18 => Self::BadElfHeader,
            0x19 => Self::BadAssetImage,
            0x1A => Self::NoLauncher,
            0x1B => Self::SyscallAddrAlign,
            0x1C => Self::BadAssetSlot,
            0x1D => Self::RwdataSeg,
            0x1E => Self::NotResponding,
            0x1F => Self::BadAssetConfig,
            0x20 => Self::BadAssetLoader,
            _ => return Err(()),
        })
    }
}

/// Extend a `w`-bit wide two's complement value to 32 bits.
#[inline(always)]
pub fn sign_extend(value: u32, w: u32) -> i32 {
    debug_assert!(w >= 1 && w < 32);
    let msb = 1u32 << (w - 1);
    let upper = u32::MAX << w;
    if value & msb != 0 {
        (value | upper) as i32
    } else {
        value as i32
    }
}

/// If bits [15:11] are 0b11101, 0b11110 or 0b11111, this halfword begins a
/// 32-bit instruction.
#[inline(always)]
pub fn is_32bit_instr(instr: u16) -> bool {
    (instr & 0xF800) >= 0xE800
}

/// Apply a branch offset relative to the PC value seen mid-instruction.
/// `Reg` is unsigned, so underflows wrap and appear to be past the end of
/// the block — the bounds check downstream handles both cases at once.
#[inline(always)]
pub fn branch_offset(pc: Reg, offset: i32) -> Reg {
    pc.wrapping_add(offset as Reg).wrapping_add(2) & !1
}

pub mod cond {
    //! Condition codes and NZCV flag access over a CPSR word.

    use super::Reg;

    pub const EQ: u8 = 0;
    pub const NE: u8 = 1;
    pub const CS: u8 = 2;
    pub const CC: u8 = 3;
    pub const MI: u8 = 4;
    pub const PL: u8 = 5;
    pub const VS: u8 = 6;
    pub const VC: u8 = 7;
    pub const HI: u8 = 8;
    pub const LS: u8 = 9;
    pub const GE: u8 = 10;
    pub const LT: u8 = 11;
    pub const GT: u8 = 12;
    pub const LE: u8 = 13;
    pub const AL: u8 = 14;

    #[inline(always)]
    pub fn neg(cpsr: Reg) -> bool {
        (cpsr >> 31) & 1 != 0
    }

    #[inline(always)]
    pub fn zero(cpsr: Reg) -> bool {
        (cpsr >> 30) & 1 != 0
    }

    #[inline(always)]
    pub fn carry(cpsr: Reg) -> bool {
        (cpsr >> 29) & 1 != 0
    }

    #[inline(always)]
    pub fn overflow(cpsr: Reg) -> bool {
        (cpsr >> 28) & 1 != 0
    }

    /// Evaluate a condition field against the flags. Condition 15 is not a
    /// valid encoding in this subset and never passes.
    pub fn passed(cond: u8, cpsr: Reg) -> bool {
        match cond {
            EQ => zero(cpsr),
            NE => !zero(cpsr),
            CS => carry(cpsr),
            CC => !carry(cpsr),
            MI => neg(cpsr),
            PL => !neg(cpsr),
            VS => overflow(cpsr),
            VC => !overflow(cpsr),
            HI => carry(cpsr) && !zero(cpsr),
            LS => !carry(cpsr) || zero(cpsr),
            GE => neg(cpsr) == overflow(cpsr),
            LT => neg(cpsr) != overflow(cpsr),
            GT => !zero(cpsr) && neg(cpsr) == overflow(cpsr),
            LE => zero(cpsr) || neg(cpsr) != overflow(cpsr),
            AL => true,
            _ => {
                debug_assert!(false, "invalid condition code");
                false
            }
        }
    }
}

/// Target of an unconditional branch (encoding T2).
#[inline(always)]
pub fn branch_target_b(instr: u16, pc: Reg) -> Reg {
    let imm11 = u32::from(instr) & 0x7FF;
    branch_offset(pc, sign_extend(imm11 << 1, 12))
}

/// Target of a conditional branch, assuming the condition passed.
#[inline(always)]
pub fn taken_target_cond_b(instr: u16, pc: Reg) -> Reg {
    let imm8 = u32::from(instr) & 0xFF;
    branch_offset(pc, sign_extend(imm8 << 1, 9))
}

/// Target of a conditional branch, evaluating the condition.
#[inline(always)]
pub fn branch_target_cond_b(instr: u16, pc: Reg, cpsr: Reg) -> Reg {
    let c = ((instr >> 8) & 0xF) as u8;
    if cond::passed(c, cpsr) {
        taken_target_cond_b(instr, pc)
    } else {
        pc
    }
}

/// Target of CBZ/CBNZ, assuming the branch is taken.
#[inline(always)]
pub fn taken_target_cbz(instr: u16, pc: Reg) -> Reg {
    let i = u32::from(instr) & (1 << 9);
    let imm5 = (u32::from(instr) >> 3) & 0x1F;
    // ZeroExtend(i:imm5:'0')
    branch_offset(pc, ((i << 6) | (imm5 << 1)) as i32)
}

/// Target of CBZ/CBNZ, evaluating the register.
#[inline(always)]
pub fn branch_target_cbz(instr: u16, pc: Reg, rn: Reg) -> Reg {
    let nonzero = instr & (1 << 11) != 0;
    if nonzero ^ (rn as u32 == 0) {
        taken_target_cbz(instr, pc)
    } else {
        pc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extend_widths() {
        assert_eq!(sign_extend(0x7FF, 12), 0x7FF);
        assert_eq!(sign_extend(0x800, 12), -2048);
        assert_eq!(sign_extend(0xFF, 9), 0xFF);
        assert_eq!(sign_extend(0x100, 9), -256);
    }

    #[test]
    fn instruction_width_split() {
        assert!(!is_32bit_instr(0xBF00)); // NOP
        assert!(!is_32bit_instr(0xDF00)); // SVC
        assert!(is_32bit_instr(0xE800));
        assert!(is_32bit_instr(0xF8C9)); // STR.W prefix
        assert!(!is_32bit_instr(0xE7FF)); // B (16-bit)
    }

    #[test]
    fn condition_codes_follow_flags() {
        let z = 1usize << 30;
        let n = 1usize << 31;
        let c = 1usize << 29;
        let v = 1usize << 28;

        assert!(cond::passed(cond::EQ, z));
        assert!(!cond::passed(cond::EQ, 0));
        assert!(cond::passed(cond::HI, c));
        assert!(!cond::passed(cond::HI, c | z));
        assert!(cond::passed(cond::GE, n | v));
        assert!(cond::passed(cond::GE, 0));
        assert!(cond::passed(cond::LT, n));
        assert!(cond::passed(cond::LT, v));
        assert!(cond::passed(cond::AL, 0));
        assert!(!cond::passed(15, 0));
    }

    #[test]
    fn backward_branch_wraps_past_block() {
        // A branch from near the block start to a negative offset must wrap,
        // so an unsigned bounds check rejects it.
        let target = branch_target_b(0xE7F0, 2); // B .-30
        assert!(target >= BLOCK_SIZE);
    }

    #[test]
    fn fault_codes_round_trip() {
        for raw in 1..=0x20u32 {
            let code = FaultCode::try_from(raw).unwrap();
            assert_eq!(code as u32, raw);
            assert!(!code.describe().is_empty());
        }
        assert!(FaultCode::try_from(0).is_err());
        assert!(FaultCode::try_from(0x21).is_err());
    }
}
