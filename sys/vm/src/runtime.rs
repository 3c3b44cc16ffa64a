// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SVC dispatch, the call/return discipline, event injection, and the
//! program loader.
//!
//! SVCs are delivered like hardware exceptions: the auto-saved register
//! frame goes onto the user stack and the handler works on a saved copy
//! (`UserRegs`), which is written back before execution resumes — so a
//! handler's register mutations are exactly as visible as they would be
//! on the real exception hardware. Calls and returns move the saved
//! frame around the stack rather than touching live registers, and every
//! control transfer out of an SVC re-validates its target against the
//! static validator's verdict for the covering block.

use abi::{
    svc, CallFrame, FaultCode, HwContext, Reg, REG_CPSR, REG_LR, REG_PC,
    REG_SP,
};
use flash_volume::Volume;
use frames::{
    read_call_frame, read_hw_context, write_call_frame, write_hw_context,
};

use crate::mem::{squash, SEGMENT_0_VA};
use crate::{Host, SyscallCtx, Vm};

/// Initial stack placement, as virtual addresses.
#[derive(Copy, Clone, Debug)]
pub struct StackInfo {
    pub limit: u32,
    pub top: u32,
}

/// The saved register view SVC handlers operate on. `hw` mirrors the
/// exception frame on the user stack at `sp`; `r` holds r4–r11, which
/// the exception hardware doesn't auto-save.
#[derive(Default)]
pub(crate) struct UserRegs {
    pub hw: HwContext,
    /// Frame base address. Call/return relocate the frame by moving
    /// this; the write-back on exception exit follows it.
    pub sp: Reg,
    pub r: [Reg; 8],
}

impl UserRegs {
    pub fn get(&self, r: usize) -> u32 {
        match r {
            0 => self.hw.r0,
            1 => self.hw.r1,
            2 => self.hw.r2,
            3 => self.hw.r3,
            4..=11 => squash(self.r[r - 4]),
            12 => self.hw.r12,
            REG_LR => self.hw.lr,
            REG_SP => squash(self.sp).wrapping_add(FRAME_SIZE),
            REG_PC => self.hw.return_addr,
            REG_CPSR => self.hw.xpsr,
            _ => 0,
        }
    }

    pub fn set(&mut self, r: usize, value: u32) {
        match r {
            0 => self.hw.r0 = value,
            1 => self.hw.r1 = value,
            2 => self.hw.r2 = value,
            3 => self.hw.r3 = value,
            4..=11 => self.r[r - 4] = value as Reg,
            12 => self.hw.r12 = value,
            REG_LR => self.hw.lr = value,
            REG_PC => self.hw.return_addr = value,
            REG_CPSR => self.hw.xpsr = value,
            _ => {}
        }
    }

    fn fp(&self) -> u32 {
        squash(self.r[abi::REG_FP - 4])
    }

    fn set_fp(&mut self, value: u32) {
        self.r[abi::REG_FP - 4] = value as Reg;
    }
}

const FRAME_SIZE: u32 = core::mem::size_of::<HwContext>() as u32;
const CALL_FRAME_SIZE: u32 = core::mem::size_of::<CallFrame>() as u32;

/// Byte-level frame marshalling, kept in one place so the accesses stay
/// paired with the zerocopy frame definitions in `abi`.
mod frames {
    use super::{CallFrame, HwContext, Reg, CALL_FRAME_SIZE, FRAME_SIZE};
    use crate::SvmMemory;
    use zerocopy::{FromBytes, IntoBytes};

    pub fn write_hw_context(
        mem: &mut SvmMemory,
        va: Reg,
        ctx: &HwContext,
    ) -> Result<(), ()> {
        let offset = mem.map_ram(va, FRAME_SIZE)?;
        mem.ram_mut()[offset..offset + FRAME_SIZE as usize]
            .copy_from_slice(ctx.as_bytes());
        Ok(())
    }

    pub fn read_hw_context(mem: &SvmMemory, va: Reg) -> Result<HwContext, ()> {
        let offset = mem.map_ram(va, FRAME_SIZE)?;
        Ok(HwContext::read_from_bytes(
            &mem.ram()[offset..offset + FRAME_SIZE as usize],
        )
        .unwrap())
    }

    pub fn write_call_frame(
        mem: &mut SvmMemory,
        va: Reg,
        frame: &CallFrame,
    ) -> Result<(), ()> {
        let offset = mem.map_ram(va, CALL_FRAME_SIZE)?;
        mem.ram_mut()[offset..offset + CALL_FRAME_SIZE as usize]
            .copy_from_slice(frame.as_bytes());
        Ok(())
    }

    pub fn read_call_frame(mem: &SvmMemory, va: Reg) -> Result<CallFrame, ()> {
        let offset = mem.map_ram(va, CALL_FRAME_SIZE)?;
        Ok(CallFrame::read_from_bytes(
            &mem.ram()[offset..offset + CALL_FRAME_SIZE as usize],
        )
        .unwrap())
    }
}

impl<'c> Vm<'c> {
    /// Load a game binary from its volume: configure flash segment 0,
    /// initialize the read-write data segment, zero the BSS. Returns the
    /// entry address (which may carry a stack adjustment in its high
    /// bits, like any call target).
    pub fn load_program(&mut self, volume: Volume) -> Result<u32, FaultCode> {
        let span = volume.payload(self.cache, &*self.dev);

        let mut prefix = [0u8; flash_map::CACHE_BLOCK_SIZE];
        if !span.copy_bytes(self.cache, &*self.dev, 0, &mut prefix) {
            return Err(FaultCode::BadElfHeader);
        }
        let info = elf_image::ProgramInfo::parse(&prefix)
            .map_err(|_| FaultCode::BadElfHeader)?;

        self.mem.set_segment(0, span.clone());

        if let Some(rw) = info.rw {
            let offset = self
                .mem
                .map_ram(rw.vaddr as Reg, rw.file_size)
                .map_err(|()| FaultCode::RwdataSeg)?;
            let (ram, cache, dev) =
                (self.mem.ram_mut(), self.cache, &*self.dev);
            let dst = &mut ram[offset..offset + rw.file_size as usize];
            if !span.copy_bytes(cache, dev, rw.offset, dst) {
                return Err(FaultCode::RwdataSeg);
            }
        }

        if let Some(bss) = info.bss {
            let offset = self
                .mem
                .map_ram(bss.vaddr as Reg, bss.mem_size)
                .map_err(|()| FaultCode::RwdataSeg)?;
            self.mem.ram_mut()[offset..offset + bss.mem_size as usize]
                .fill(0);
        }

        Ok(info.entry)
    }

    /// Arrange for execution to begin at `entry` on the given stack. The
    /// caller then drives `run`.
    pub fn exec(
        &mut self,
        entry: u32,
        stack: StackInfo,
    ) -> Result<(), FaultCode> {
        self.regs = [0; abi::NUM_REGS];
        self.event = None;
        self.event_frame = 0;
        self.pending_exit = false;

        self.stack_limit = stack.limit as Reg;
        self.stack_top = stack.top as Reg;
        self.stack_low_water = stack.top as Reg;

        let adjust = svc::sp_adjust_bytes(entry);
        let sp = stack.top.wrapping_sub(adjust);
        self.mem
            .map_ram(sp as Reg, adjust)
            .map_err(|()| FaultCode::BadStack)?;
        self.regs[REG_SP] = sp as Reg;
        self.stack_low_water = sp as Reg;

        self.regs[REG_PC] = self.validate_target(entry)? as Reg;
        Ok(())
    }

    /// Resolve and check a branch target: low 24 bits name a
    /// bundle-aligned offset in flash segment 0, and the covering block
    /// must certify that bundle.
    fn validate_target(&self, addr: u32) -> Result<u32, FaultCode> {
        let va = SEGMENT_0_VA | (addr & 0x00FF_FFFC);
        self.mem
            .map_ro_code(self.cache, &*self.dev, va as Reg)
            .map_err(|()| FaultCode::BadCodeAddress)?;
        Ok(va)
    }

    //
    // Exception emulation. On target hardware this is what the exception
    // entry/exit microarchitecture does; the emulator spells it out.
    //

    fn enter_exception(&mut self, return_addr: u32) -> Result<(), FaultCode> {
        let sp = squash(self.regs[REG_SP]).wrapping_sub(FRAME_SIZE) as Reg;
        let ctx = HwContext {
            r0: squash(self.regs[0]),
            r1: squash(self.regs[1]),
            r2: squash(self.regs[2]),
            r3: squash(self.regs[3]),
            r12: squash(self.regs[12]),
            lr: squash(self.regs[REG_LR]),
            return_addr,
            xpsr: squash(self.regs[REG_CPSR]),
        };
        write_hw_context(&mut self.mem, sp, &ctx)
            .map_err(|()| FaultCode::BadStack)?;
        self.regs[REG_SP] = sp;
        self.user_regs.sp = sp;
        self.note_stack_extent(squash(sp));
        Ok(())
    }

    fn save_user_regs(&mut self) {
        if let Ok(ctx) = read_hw_context(&self.mem, self.user_regs.sp) {
            self.user_regs.hw = ctx;
        }
        for i in 0..8 {
            self.user_regs.r[i] = self.regs[4 + i];
        }
    }

    fn restore_user_regs(&mut self) -> Result<(), FaultCode> {
        write_hw_context(&mut self.mem, self.user_regs.sp, &self.user_regs.hw)
            .map_err(|()| FaultCode::BadStack)?;
        for i in 0..8 {
            self.regs[4 + i] = self.user_regs.r[i];
        }
        Ok(())
    }

    fn exit_exception(&mut self) -> Result<(), FaultCode> {
        let sp = self.user_regs.sp;
        let ctx = read_hw_context(&self.mem, sp)
            .map_err(|()| FaultCode::BadStack)?;
        self.regs[0] = ctx.r0 as Reg;
        self.regs[1] = ctx.r1 as Reg;
        self.regs[2] = ctx.r2 as Reg;
        self.regs[3] = ctx.r3 as Reg;
        self.regs[12] = ctx.r12 as Reg;
        self.regs[REG_LR] = ctx.lr as Reg;
        self.regs[REG_CPSR] = ctx.xpsr as Reg;
        self.regs[REG_SP] = squash(sp).wrapping_add(FRAME_SIZE) as Reg;
        self.regs[REG_PC] = ctx.return_addr as Reg;
        Ok(())
    }

    /// Deliver one SVC: frame in, dispatch, frame out.
    pub(crate) fn emulate_svc(
        &mut self,
        imm8: u8,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        let return_addr = self.pc();
        self.enter_exception(return_addr)?;
        self.save_user_regs();

        self.svc_dispatch(imm8, host)?;

        self.restore_user_regs()?;
        self.exit_exception()?;

        self.flush_ticks(host)?;
        host.elapse_ticks(crate::cpu::TICKS_PER_SVC)
    }

    fn svc_dispatch(
        &mut self,
        imm8: u8,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        if imm8 == svc::RETURN {
            return self.op_return();
        }

        if imm8 & svc::DIRECT != 0 {
            if imm8 == svc::DIRECT_ABORT {
                return Err(FaultCode::Abort);
            }
            if imm8 == svc::DIRECT_BREAKPOINT {
                host.breakpoint();
                return Ok(());
            }
            if svc::is_call_register_group(imm8) {
                let target = self.user_regs.get(usize::from(imm8 & 7));
                return if imm8 & 0x08 == 0 {
                    self.op_call(target)
                } else {
                    self.op_tailcall(target)
                };
            }
            return Err(FaultCode::ReservedSvc);
        }

        // Indirect operation through the current block's literal pool.
        if usize::from(imm8) >= abi::BUNDLES_PER_BLOCK {
            return Err(FaultCode::ReservedSvc);
        }
        let svc_pc = self.user_regs.hw.return_addr.wrapping_sub(2);
        let literal_va = (svc_pc & !(flash_map::CACHE_BLOCK_MASK as u32))
            .wrapping_add(u32::from(imm8) * 4);
        let literal = self
            .mem
            .read_u32(self.cache, &*self.dev, literal_va as Reg)
            .map_err(|()| FaultCode::CodeFetch)?;

        match svc::IndirectOp::classify(literal) {
            svc::IndirectOp::Call { target } => self.op_call(target),
            svc::IndirectOp::TailCall { target } => self.op_tailcall(target),
            svc::IndirectOp::Syscall { num } => self.op_syscall(num, host),
            svc::IndirectOp::TailSyscall { num } => {
                self.op_syscall(num, host)?;
                self.op_return()
            }
            svc::IndirectOp::Addrop { op, addr } => match op {
                svc::ADDROP_SP_ADJUST => self.user_sp_down(addr),
                svc::ADDROP_LONG_STACK_LDR => self.long_stack(addr, false),
                svc::ADDROP_LONG_STACK_STR => self.long_stack(addr, true),
                _ => Err(FaultCode::ReservedAddrop),
            },
            svc::IndirectOp::FlashAddrop { op, addr } => match op {
                svc::ADDROP_FLASH_BRANCH => self.op_branch(addr),
                svc::ADDROP_FLASH_PRELOAD => {
                    if self.mem.preload(self.cache, &*self.dev, addr as Reg) {
                        Ok(())
                    } else {
                        Err(FaultCode::PreloadAddress)
                    }
                }
                _ => Err(FaultCode::ReservedAddrop),
            },
        }
    }

    fn op_syscall(
        &mut self,
        num: u16,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        host.syscall(num, &mut SyscallCtx { vm: self })
    }

    /// Function entry: apply the target's stack adjustment, then branch.
    fn enter_function(&mut self, target: u32) -> Result<(), FaultCode> {
        self.user_sp_down(svc::sp_adjust_bytes(target))?;
        self.user_regs.hw.return_addr = self.validate_target(target)?;
        Ok(())
    }

    fn op_branch(&mut self, addr: u32) -> Result<(), FaultCode> {
        self.user_regs.hw.return_addr = self.validate_target(addr)?;
        Ok(())
    }

    /// Push a call frame and enter the target. The saved exception frame
    /// relocates below the new call frame, so the interrupted state pops
    /// correctly whenever the exception finally exits.
    fn op_call(&mut self, target: u32) -> Result<(), FaultCode> {
        let frame_va = self.user_regs.sp;
        let frame = CallFrame {
            pc: self.user_regs.hw.return_addr,
            fp: self.user_regs.fp(),
            r2: self.user_regs.hw.r2,
            r3: self.user_regs.hw.r3,
            r4: squash(self.user_regs.r[0]),
            r5: squash(self.user_regs.r[1]),
            r6: squash(self.user_regs.r[2]),
            r7: squash(self.user_regs.r[3]),
        };
        write_call_frame(&mut self.mem, frame_va, &frame)
            .map_err(|()| FaultCode::StackOverflow)?;

        self.user_regs.set_fp(squash(frame_va));
        self.move_user_sp(squash(frame_va).wrapping_sub(FRAME_SIZE))?;
        self.enter_function(target)
    }

    /// Re-enter at `target`, reusing the caller's frame.
    fn op_tailcall(&mut self, target: u32) -> Result<(), FaultCode> {
        let fp = self.user_regs.fp();
        self.move_user_sp(fp.wrapping_sub(FRAME_SIZE))?;
        self.enter_function(target)
    }

    /// Pop the call frame named by FP and return through it. A frame
    /// that doesn't map is stack corruption, not a mere bad branch.
    fn op_return(&mut self) -> Result<(), FaultCode> {
        let fp = self.user_regs.fp();
        let frame = read_call_frame(&self.mem, fp as Reg)
            .map_err(|()| FaultCode::ReturnFrame)?;

        let target = self.validate_target(frame.pc)?;

        self.user_regs.hw.r2 = frame.r2;
        self.user_regs.hw.r3 = frame.r3;
        self.user_regs.r[0] = frame.r4 as Reg;
        self.user_regs.r[1] = frame.r5 as Reg;
        self.user_regs.r[2] = frame.r6 as Reg;
        self.user_regs.r[3] = frame.r7 as Reg;
        self.user_regs.set_fp(frame.fp);
        self.user_regs.sp = fp as Reg;
        self.user_regs.hw.return_addr = target;

        // Returning through the event marker frame retires the event.
        if self.event_frame != 0 && squash(self.event_frame) == fp {
            self.event_frame = 0;
        }
        Ok(())
    }

    /// Lower the (conceptual, pre-exception) user stack pointer by
    /// `bytes`, keeping the relocated exception frame mapped and inside
    /// the stack bounds.
    fn user_sp_down(&mut self, bytes: u32) -> Result<(), FaultCode> {
        if bytes == 0 {
            return Ok(());
        }
        let new = squash(self.user_regs.sp).wrapping_sub(bytes);
        self.move_user_sp(new)
    }

    fn move_user_sp(&mut self, new_sp: u32) -> Result<(), FaultCode> {
        self.mem
            .map_ram(new_sp as Reg, FRAME_SIZE)
            .map_err(|()| FaultCode::StackOverflow)?;
        if new_sp < squash(self.stack_limit) {
            return Err(FaultCode::StackOverflow);
        }
        self.user_regs.sp = new_sp as Reg;
        self.note_stack_extent(new_sp);
        Ok(())
    }

    fn note_stack_extent(&mut self, sp: u32) {
        if sp < squash(self.stack_low_water) {
            self.stack_low_water = sp as Reg;
        }
    }

    /// Long-form stack access addrops: register in bits [23:21], word
    /// offset from the user SP in the rest.
    fn long_stack(&mut self, arg: u32, store: bool) -> Result<(), FaultCode> {
        let reg = ((arg >> 21) & 7) as usize;
        let offset = (arg & 0x001F_FFFF) * 4;
        let va = self.user_regs.get(REG_SP).wrapping_add(offset);

        if store {
            let value = self.user_regs.get(reg);
            self.mem
                .write_u32(va as Reg, value)
                .map_err(|()| FaultCode::LongStackStore)
        } else {
            let offset_in_ram = self
                .mem
                .map_ram(va as Reg, 4)
                .map_err(|()| FaultCode::LongStackLoad)?;
            let bytes: [u8; 4] = self.mem.ram()
                [offset_in_ram..offset_in_ram + 4]
                .try_into()
                .unwrap();
            self.user_regs.set(reg, u32::from_le_bytes(bytes));
            Ok(())
        }
    }

    /// Inject a queued event callback. Only legal between instructions,
    /// at a bundle-aligned PC, with no event already in flight; the
    /// caller checks all three.
    pub(crate) fn dispatch_event(
        &mut self,
    ) -> Result<(), FaultCode> {
        debug_assert!(self.event_frame == 0);
        debug_assert!(self.pc() % abi::BUNDLE_SIZE as u32 == 0);
        let event = self.event.take().unwrap();

        let return_addr = self.pc();
        self.enter_exception(return_addr)?;
        self.save_user_regs();

        self.op_call(event.addr)?;
        for (i, arg) in event.args[..event.num_args].iter().enumerate() {
            self.user_regs.set(i, *arg);
        }
        self.event_frame = self.user_regs.fp() as Reg;

        self.restore_user_regs()?;
        self.exit_exception()
    }
}
