// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interpreter for the permitted instruction subset.
//!
//! Registers are native width so 32-bit arithmetic can be emulated
//! without masking on every operation; flags are always computed from
//! the 32-bit view, and anything that becomes a guest-visible address is
//! squashed on the way out. Only validated code reaches this interpreter,
//! so an undecodable instruction here means the validator and decoder
//! disagree — that's the `CpuSim` fault, and it's a bug report, not a
//! user error.
//!
//! Time: each instruction adds to a scaled cycle counter, and whole
//! ticks are forwarded to the host at taken branches and SVCs. That
//! keeps the emulator's clock in approximate lockstep with simulated
//! hardware without a callback per instruction.

use abi::{cond, instr, FaultCode, Reg, REG_CPSR, REG_PC, REG_SP};

use crate::mem::{is_aligned, squash};
use crate::{Host, Vm};

// Cycle costs, pre-multiplied by RATE_DENOMINATOR. The CPU runs at
// RATE_NUMERATOR / RATE_DENOMINATOR cycles per system tick.
const RATE_NUMERATOR: u32 = 9;
const CPU_FETCH: u32 = 2;
const CPU_LOAD_STORE: u32 = 2;
const CPU_DIVIDE: u32 = 12;
const CPU_PIPELINE_RELOAD: u32 = 4;

/// Don't bother converting to ticks below this many scaled cycles.
const TICK_THRESHOLD: u32 = RATE_NUMERATOR * 16;

/// Fixed cost of the SVC exception round trip, in whole ticks.
pub(crate) const TICKS_PER_SVC: u32 = 24;

impl<'c> Vm<'c> {
    /// Forward accumulated whole ticks to the host's time source.
    pub(crate) fn flush_ticks(
        &mut self,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        if self.cycles >= TICK_THRESHOLD {
            let ticks = self.cycles / RATE_NUMERATOR;
            self.cycles %= RATE_NUMERATOR;
            host.elapse_ticks(ticks)?;
        }
        Ok(())
    }

    /// Execute one instruction (dispatching a queued event first, when
    /// the boundary allows it).
    pub(crate) fn step(&mut self, host: &mut dyn Host) -> Result<(), FaultCode> {
        if self.event.is_some()
            && self.event_frame == 0
            && self.pc() % abi::BUNDLE_SIZE as u32 == 0
        {
            self.dispatch_event()?;
        }

        let first = self.fetch()?;
        if abi::is_32bit_instr(first) {
            let second = self.fetch()?;
            self.execute32((u32::from(first) << 16) | u32::from(second))
        } else {
            self.execute16(first, host)
        }
    }

    /// Fetch the next halfword. Every fetch re-checks that the PC lies
    /// inside the validated prefix of its block, double-checking the
    /// validator and the branch gates against each other.
    fn fetch(&mut self) -> Result<u16, FaultCode> {
        self.cycles += CPU_FETCH;

        let pc = self.regs[REG_PC];
        if !is_aligned(pc, 2) {
            return Err(FaultCode::CodeAlignment);
        }
        let (block, within) = self
            .mem
            .map_ro_code(self.cache, &*self.dev, pc)
            .map_err(|()| FaultCode::CodeFetch)?;

        let offset = within | (squash(pc) as usize & 2);
        let halfword = u16::from_le_bytes(
            block.data()[offset..offset + 2].try_into().unwrap(),
        );
        self.regs[REG_PC] = pc.wrapping_add(2);
        Ok(halfword)
    }

    //
    // Flags. NZCV live in the CPSR register slot; arithmetic flags are
    // computed on 32-bit operands regardless of register width.
    //

    fn get_carry(&self) -> bool {
        cond::carry(self.regs[REG_CPSR])
    }

    fn set_flag(&mut self, bit: u32, value: bool) {
        if value {
            self.regs[REG_CPSR] |= 1 << bit;
        } else {
            self.regs[REG_CPSR] &= !(1 << bit);
        }
    }

    fn set_neg(&mut self, f: bool) {
        self.set_flag(31, f);
    }

    fn set_zero(&mut self, f: bool) {
        self.set_flag(30, f);
    }

    fn set_carry(&mut self, f: bool) {
        self.set_flag(29, f);
    }

    fn set_overflow(&mut self, f: bool) {
        self.set_flag(28, f);
    }

    fn set_nz(&mut self, result: i32) {
        self.set_neg(result < 0);
        self.set_zero(result == 0);
    }

    //
    // ALU primitives, one per flag-setting operation shape.
    //

    fn op_lsl(&mut self, a: Reg, b: u32) -> Reg {
        let a32 = squash(a);
        let result = if b == 0 {
            // Shift by zero leaves the carry alone.
            a32
        } else {
            if b <= 32 {
                self.set_carry((a32 >> (32 - b)) & 1 != 0);
            } else {
                self.set_carry(false);
            }
            if b < 32 {
                a32 << b
            } else {
                0
            }
        };
        self.set_nz(result as i32);
        result as Reg
    }

    fn op_lsr(&mut self, a: Reg, b: u32) -> Reg {
        let a32 = squash(a);
        let result = if b == 0 {
            a32
        } else {
            if b <= 32 {
                self.set_carry((u64::from(a32) >> (b - 1)) & 1 != 0);
            } else {
                self.set_carry(false);
            }
            if b < 32 {
                a32 >> b
            } else {
                0
            }
        };
        self.set_nz(result as i32);
        result as Reg
    }

    fn op_asr(&mut self, a: Reg, b: u32) -> Reg {
        let a32 = squash(a);
        let result = if b == 0 {
            a32
        } else if b < 32 {
            self.set_carry((a32 >> (b - 1)) & 1 != 0);
            ((a32 as i32) >> b) as u32
        } else {
            // Shifts past the width fill with sign.
            self.set_carry(a32 & 0x8000_0000 != 0);
            ((a32 as i32) >> 31) as u32
        };
        self.set_nz(result as i32);
        result as Reg
    }

    fn op_ror(&mut self, a: Reg, b: u32) -> Reg {
        let a32 = squash(a);
        let result = if b == 0 {
            a32
        } else {
            let result = a32.rotate_right(b % 32);
            self.set_carry(result & 0x8000_0000 != 0);
            result
        };
        self.set_nz(result as i32);
        result as Reg
    }

    /// AddWithCarry from the architecture reference: flags from the
    /// 32-bit sums, result kept at full register width.
    fn op_add(&mut self, a: Reg, b: Reg, carry: Reg) -> Reg {
        let unsigned = u64::from(squash(a))
            + u64::from(squash(b))
            + u64::from(squash(carry));
        let signed = i64::from(squash(a) as i32)
            + i64::from(squash(b) as i32)
            + i64::from(squash(carry));

        self.set_nz(signed as i32);
        self.set_overflow(i64::from(signed as i32) != signed);
        self.set_carry(u64::from(unsigned as u32) != unsigned);

        a.wrapping_add(b).wrapping_add(carry)
    }

    fn op_and(&mut self, a: Reg, b: Reg) -> Reg {
        let result = a & b;
        self.set_nz(squash(result) as i32);
        result
    }

    fn op_eor(&mut self, a: Reg, b: Reg) -> Reg {
        let result = a ^ b;
        self.set_nz(squash(result) as i32);
        result
    }

    //
    // 16-bit dispatch.
    //

    fn execute16(
        &mut self,
        instr_hw: u16,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        if (instr_hw & instr::ALU_MASK) == instr::ALU_TEST {
            return self.exec_alu16(instr_hw);
        }
        if (instr_hw & instr::DATA_PROC_MASK) == instr::DATA_PROC_TEST {
            return self.exec_data_proc(instr_hw);
        }
        if (instr_hw & instr::MISC_MASK) == instr::MISC_TEST {
            return self.exec_extend(instr_hw);
        }
        if (instr_hw & instr::MOV_MASK) == instr::MOV_TEST {
            // MOV register, low registers only, flags unaffected.
            let rs = usize::from((instr_hw >> 3) & 7);
            let rd = usize::from(instr_hw & 7);
            self.regs[rd] = self.regs[rs];
            return Ok(());
        }
        if (instr_hw & instr::SVC_MASK) == instr::SVC_TEST {
            return self.emulate_svc((instr_hw & 0xFF) as u8, host);
        }
        if (instr_hw & instr::PC_REL_LDR_MASK) == instr::PC_REL_LDR_TEST {
            return self.exec_ldr_literal(instr_hw);
        }
        if (instr_hw & instr::SP_REL_LDR_STR_MASK)
            == instr::SP_REL_LDR_STR_TEST
        {
            return if instr_hw & (1 << 11) != 0 {
                self.exec_ldr_sp(instr_hw)
            } else {
                self.exec_str_sp(instr_hw)
            };
        }
        if (instr_hw & instr::SP_REL_ADD_MASK) == instr::SP_REL_ADD_TEST {
            // Forming an address from SP: squash first, so stack
            // addresses that have never left registers agree with ones
            // that have round-tripped through guest memory.
            let rd = usize::from((instr_hw >> 8) & 7);
            let imm8 = Reg::from(instr_hw & 0xFF);
            self.regs[rd] = (squash(self.regs[REG_SP]) as Reg)
                .wrapping_add(imm8 << 2);
            return Ok(());
        }
        if (instr_hw & instr::UNCOND_BRANCH_MASK) == instr::UNCOND_BRANCH_TEST
        {
            let pc = self.regs[REG_PC];
            return self.take_branch(abi::branch_target_b(instr_hw, pc), host);
        }
        if (instr_hw & instr::COMPARE_BRANCH_MASK)
            == instr::COMPARE_BRANCH_TEST
        {
            let rn = self.regs[usize::from(instr_hw & 7)];
            let pc = self.regs[REG_PC];
            return self
                .take_branch(abi::branch_target_cbz(instr_hw, pc, rn), host);
        }
        if (instr_hw & instr::COND_BRANCH_MASK) == instr::COND_BRANCH_TEST {
            let pc = self.regs[REG_PC];
            let cpsr = self.regs[REG_CPSR];
            return self.take_branch(
                abi::branch_target_cond_b(instr_hw, pc, cpsr),
                host,
            );
        }
        if instr_hw == instr::NOP {
            return Ok(());
        }

        // Only validated instructions execute, so reaching here means the
        // validator let something through that we can't decode.
        Err(FaultCode::CpuSim)
    }

    fn take_branch(
        &mut self,
        new_pc: Reg,
        host: &mut dyn Host,
    ) -> Result<(), FaultCode> {
        if new_pc != self.regs[REG_PC] {
            self.regs[REG_PC] = new_pc;
            self.cycles += CPU_PIPELINE_RELOAD;
            self.flush_ticks(host)?;
        }
        Ok(())
    }

    /// Shift/add/subtract/move/compare group, keyed by bits [13:11].
    fn exec_alu16(&mut self, i: u16) -> Result<(), FaultCode> {
        let imm5 = u32::from((i >> 6) & 0x1F);
        let rm = usize::from((i >> 3) & 7);
        let rd = usize::from(i & 7);
        let rdn8 = usize::from((i >> 8) & 7);
        let imm8 = Reg::from(i & 0xFF);

        match (i >> 11) & 7 {
            0 => self.regs[rd] = self.op_lsl(self.regs[rm], imm5),
            1 => {
                // LSR #0 encodes a 32-bit shift.
                let shift = if imm5 == 0 { 32 } else { imm5 };
                self.regs[rd] = self.op_lsr(self.regs[rm], shift);
            }
            2 => {
                let shift = if imm5 == 0 { 32 } else { imm5 };
                self.regs[rd] = self.op_asr(self.regs[rm], shift);
            }
            3 => {
                let rn = usize::from((i >> 3) & 7);
                let rm3 = Reg::from((i >> 6) & 7);
                match (i >> 9) & 3 {
                    0 => {
                        let b = self.regs[usize::from((i >> 6) & 7)];
                        self.regs[rd] = self.op_add(self.regs[rn], b, 0);
                    }
                    1 => {
                        let b = self.regs[usize::from((i >> 6) & 7)];
                        self.regs[rd] = self.op_add(self.regs[rn], !b, 1);
                    }
                    2 => self.regs[rd] = self.op_add(self.regs[rn], rm3, 0),
                    _ => self.regs[rd] = self.op_add(self.regs[rn], !rm3, 1),
                }
            }
            4 => {
                self.regs[rdn8] = imm8;
                self.set_nz(imm8 as i32);
            }
            5 => {
                // CMP immediate: flags only.
                self.op_add(self.regs[rdn8], !imm8, 1);
            }
            6 => self.regs[rdn8] = self.op_add(self.regs[rdn8], imm8, 0),
            _ => self.regs[rdn8] = self.op_add(self.regs[rdn8], !imm8, 1),
        }
        Ok(())
    }

    /// Register-to-register data processing, opcode in bits [9:6].
    fn exec_data_proc(&mut self, i: u16) -> Result<(), FaultCode> {
        let rm = usize::from((i >> 3) & 7);
        let rdn = usize::from(i & 7);
        let m = self.regs[rm];
        let dn = self.regs[rdn];

        match (i >> 6) & 0xF {
            0 => self.regs[rdn] = self.op_and(dn, m),
            1 => self.regs[rdn] = self.op_eor(dn, m),
            2 => self.regs[rdn] = self.op_lsl(dn, squash(m) & 0xFF),
            3 => self.regs[rdn] = self.op_lsr(dn, squash(m) & 0xFF),
            4 => self.regs[rdn] = self.op_asr(dn, squash(m) & 0xFF),
            5 => {
                let c = Reg::from(self.get_carry());
                self.regs[rdn] = self.op_add(dn, m, c);
            }
            6 => {
                let c = Reg::from(self.get_carry());
                self.regs[rdn] = self.op_add(dn, !m, c);
            }
            7 => self.regs[rdn] = self.op_ror(dn, squash(m) & 0xFF),
            8 => {
                self.op_and(dn, m); // TST
            }
            9 => self.regs[rdn] = self.op_add(!m, 0, 1), // RSB #0
            10 => {
                self.op_add(dn, !m, 1); // CMP
            }
            11 => {
                self.op_add(dn, m, 0); // CMN
            }
            12 => {
                let result = dn | m;
                self.regs[rdn] = result;
                self.set_nz(squash(result) as i32);
            }
            13 => {
                // MUL: flags from the full 64-bit product.
                let product = u64::from(squash(dn)) * u64::from(squash(m));
                self.regs[rdn] = (product as u32) as Reg;
                self.set_neg((product as i64) < 0);
                self.set_zero(product == 0);
            }
            14 => {
                let result = squash(dn) & !squash(m);
                self.regs[rdn] = result as Reg;
                self.set_nz(result as i32);
            }
            _ => {
                let result = !squash(m);
                self.regs[rdn] = result as Reg;
                self.set_nz(result as i32);
            }
        }
        Ok(())
    }

    /// Sign/zero extension group; bits [7:6] pick the flavor.
    fn exec_extend(&mut self, i: u16) -> Result<(), FaultCode> {
        let rm = usize::from((i >> 3) & 7);
        let rdn = usize::from(i & 7);
        let m = squash(self.regs[rm]);
        self.regs[rdn] = match (i >> 6) & 3 {
            0 => abi::sign_extend(m & 0xFFFF, 16) as u32 as Reg,
            1 => abi::sign_extend(m & 0xFF, 8) as u32 as Reg,
            2 => (m & 0xFFFF) as Reg,
            _ => (m & 0xFF) as Reg,
        };
        Ok(())
    }

    fn exec_ldr_literal(&mut self, i: u16) -> Result<(), FaultCode> {
        let rt = usize::from((i >> 8) & 7);
        let imm8 = Reg::from(i & 0xFF);

        // The pool is addressed from the word-rounded PC.
        let addr =
            ((self.regs[REG_PC].wrapping_add(3)) & !3).wrapping_add(imm8 << 2);
        let value = self
            .mem
            .read_u32(self.cache, &*self.dev, addr)
            .map_err(|()| FaultCode::LoadAddress)?;
        self.regs[rt] = value as Reg;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_str_sp(&mut self, i: u16) -> Result<(), FaultCode> {
        let rt = usize::from((i >> 8) & 7);
        let imm8 = Reg::from(i & 0xFF);
        let addr = self.regs[REG_SP].wrapping_add(imm8 << 2);

        if !is_aligned(addr, 4) {
            return Err(FaultCode::StoreAlignment);
        }
        self.mem
            .write_u32(addr, squash(self.regs[rt]))
            .map_err(|()| FaultCode::StoreAddress)?;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_ldr_sp(&mut self, i: u16) -> Result<(), FaultCode> {
        let rt = usize::from((i >> 8) & 7);
        let imm8 = Reg::from(i & 0xFF);
        let addr = self.regs[REG_SP].wrapping_add(imm8 << 2);

        if !is_aligned(addr, 4) {
            return Err(FaultCode::LoadAlignment);
        }
        let offset = self
            .mem
            .map_ram(addr, 4)
            .map_err(|()| FaultCode::LoadAddress)?;
        let value = u32::from_le_bytes(
            self.mem.ram()[offset..offset + 4].try_into().unwrap(),
        );
        self.regs[rt] = value as Reg;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    //
    // 32-bit dispatch. The first halfword rides in the high 16 bits, so
    // the data-sheet mask tables apply directly.
    //

    fn execute32(&mut self, i: u32) -> Result<(), FaultCode> {
        if (i & instr::STR_MASK) == instr::STR_TEST {
            return self.exec_str32(i);
        }
        if (i & instr::STR_BH_MASK) == instr::STR_BH_TEST {
            return self.exec_str_bh(i);
        }
        if (i & instr::LDR_BH_MASK) == instr::LDR_BH_TEST {
            return self.exec_ldr_bh(i);
        }
        if (i & instr::LDR_MASK) == instr::LDR_TEST {
            return self.exec_ldr32(i);
        }
        if (i & instr::MOVWT_MASK) == instr::MOVWT_TEST {
            return self.exec_movwt(i);
        }
        if (i & instr::DIV_MASK) == instr::DIV_TEST {
            return self.exec_div(i);
        }
        if (i & instr::CLZ_MASK) == instr::CLZ_TEST {
            return self.exec_clz(i);
        }
        Err(FaultCode::CpuSim)
    }

    fn mem_operand(i: u32) -> (Reg, usize, usize) {
        let imm12 = (i & 0xFFF) as Reg;
        let rn = ((i >> 16) & 0xF) as usize;
        let rt = ((i >> 12) & 0xF) as usize;
        (imm12, rn, rt)
    }

    fn exec_str32(&mut self, i: u32) -> Result<(), FaultCode> {
        let (imm12, rn, rt) = Self::mem_operand(i);
        let addr = self.regs[rn].wrapping_add(imm12);

        if !is_aligned(addr, 4) {
            return Err(FaultCode::StoreAlignment);
        }
        self.mem
            .write_u32(addr, squash(self.regs[rt]))
            .map_err(|()| FaultCode::StoreAddress)?;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_ldr32(&mut self, i: u32) -> Result<(), FaultCode> {
        let (imm12, rn, rt) = Self::mem_operand(i);
        let addr = self.regs[rn].wrapping_add(imm12);

        if !is_aligned(addr, 4) {
            return Err(FaultCode::LoadAlignment);
        }
        let value = self
            .mem
            .read_u32(self.cache, &*self.dev, addr)
            .map_err(|()| FaultCode::LoadAddress)?;
        self.regs[rt] = value as Reg;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_str_bh(&mut self, i: u32) -> Result<(), FaultCode> {
        const HALFWORD: u32 = 1 << 21;
        let (imm12, rn, rt) = Self::mem_operand(i);
        let addr = self.regs[rn].wrapping_add(imm12);
        let value = squash(self.regs[rt]);

        if i & HALFWORD != 0 {
            if !is_aligned(addr, 2) {
                return Err(FaultCode::StoreAlignment);
            }
            self.mem
                .write_u16(addr, value as u16)
                .map_err(|()| FaultCode::StoreAddress)?;
        } else {
            self.mem
                .write_u8(addr, value as u8)
                .map_err(|()| FaultCode::StoreAddress)?;
        }
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_ldr_bh(&mut self, i: u32) -> Result<(), FaultCode> {
        const HALFWORD: u32 = 1 << 21;
        const SIGN_EXT: u32 = 1 << 24;
        let (imm12, rn, rt) = Self::mem_operand(i);
        let addr = self.regs[rn].wrapping_add(imm12);

        let value: u32 = match (i & HALFWORD != 0, i & SIGN_EXT != 0) {
            (false, false) => self
                .mem
                .read_u8(self.cache, &*self.dev, addr)
                .map_err(|()| FaultCode::LoadAddress)?
                .into(),
            (false, true) => {
                let b = self
                    .mem
                    .read_u8(self.cache, &*self.dev, addr)
                    .map_err(|()| FaultCode::LoadAddress)?;
                abi::sign_extend(u32::from(b), 8) as u32
            }
            (true, sign) => {
                if !is_aligned(addr, 2) {
                    return Err(FaultCode::LoadAlignment);
                }
                let h = self
                    .mem
                    .read_u16(self.cache, &*self.dev, addr)
                    .map_err(|()| FaultCode::LoadAddress)?;
                if sign {
                    abi::sign_extend(u32::from(h), 16) as u32
                } else {
                    u32::from(h)
                }
            }
        };
        self.regs[rt] = value as Reg;
        self.cycles += CPU_LOAD_STORE;
        Ok(())
    }

    fn exec_movwt(&mut self, i: u32) -> Result<(), FaultCode> {
        const TOP: u32 = 1 << 23;
        let rd = ((i >> 8) & 0xF) as usize;
        let imm16 = (i & 0x0000_00FF)
            | ((i & 0x0000_7000) >> 4)
            | ((i & 0x0400_0000) >> 15)
            | ((i & 0x000F_0000) >> 4);

        self.regs[rd] = if i & TOP != 0 {
            ((squash(self.regs[rd]) & 0xFFFF) | (imm16 << 16)) as Reg
        } else {
            imm16 as Reg
        };
        Ok(())
    }

    fn exec_div(&mut self, i: u32) -> Result<(), FaultCode> {
        const UNSIGNED: u32 = 1 << 21;
        let rn = ((i >> 16) & 0xF) as usize;
        let rd = ((i >> 8) & 0xF) as usize;
        let rm = (i & 0xF) as usize;

        let n = squash(self.regs[rn]);
        let m = squash(self.regs[rm]);

        // Division by zero is architected to produce zero, not fault.
        self.regs[rd] = if m == 0 {
            0
        } else if i & UNSIGNED != 0 {
            (n / m) as Reg
        } else {
            ((n as i32).wrapping_div(m as i32) as u32) as Reg
        };
        self.cycles += CPU_DIVIDE;
        Ok(())
    }

    fn exec_clz(&mut self, i: u32) -> Result<(), FaultCode> {
        let rm1 = ((i >> 16) & 0xF) as usize;
        let rd = ((i >> 8) & 0xF) as usize;
        let rm2 = (i & 0xF) as usize;

        // The architecture requires the two Rm fields to agree.
        if rm1 != rm2 {
            return Err(FaultCode::CpuSim);
        }
        self.regs[rd] = squash(self.regs[rm1]).leading_zeros() as Reg;
        Ok(())
    }
}
