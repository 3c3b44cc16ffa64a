// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote debugger attachment, host builds only in spirit: nothing here
//! is reachable unless the host wires a debug channel to it.
//!
//! Commands arrive as bounded packets of 32-bit words and are answered
//! in kind; the formats live in `abi::debug` so front ends can share
//! them. Stop reasons reuse UNIX signal numbers, which keeps GDB-style
//! front ends happy without a translation table.

use abi::debug::{
    arg_bit, Signal, ARG_MASK, MAX_REPLY_WORDS, M_DETACH, M_IS_STOPPED,
    M_READ_RAM, M_READ_REGISTERS, M_SET_BREAKPOINTS, M_SIGNAL, M_STEP,
    M_WRITE_RAM, M_WRITE_REGISTERS, NUM_BREAKPOINTS, TYPE_MASK,
};
use abi::{Reg, NUM_REGS};
use arrayvec::ArrayVec;

use crate::{ExitReason, Host, Vm};

pub type Reply = ArrayVec<u32, MAX_REPLY_WORDS>;

pub struct DebugTarget {
    /// Breakpoint slots; an address of zero disables a slot.
    breakpoints: [u32; NUM_BREAKPOINTS],
    /// Why the target is stopped; `Running` (zero) when it isn't.
    signal: u32,
}

impl DebugTarget {
    pub fn new() -> Self {
        Self { breakpoints: [0; NUM_BREAKPOINTS], signal: 0 }
    }

    pub fn is_stopped(&self) -> bool {
        self.signal != Signal::Running as u32
    }

    pub fn signal(&self) -> u32 {
        self.signal
    }

    /// Run the target until it hits a breakpoint, is signalled, exits,
    /// or faults. Returns the exit reason if the guest is done for good.
    pub fn run(
        &mut self,
        vm: &mut Vm<'_>,
        host: &mut dyn Host,
    ) -> Option<ExitReason> {
        while !self.is_stopped() {
            if self.at_breakpoint(vm) {
                self.signal = Signal::Trap as u32;
                return None;
            }
            if let Some(reason) = vm.run_slice(host, 1) {
                if let ExitReason::Faulted(report) = &reason {
                    self.signal = Signal::from_fault(report.code) as u32;
                }
                return Some(reason);
            }
        }
        None
    }

    fn at_breakpoint(&self, vm: &Vm<'_>) -> bool {
        let pc = vm.pc();
        self.breakpoints.iter().any(|&bp| bp != 0 && bp == pc)
    }

    /// Service one debugger command, producing its reply.
    pub fn handle_message(
        &mut self,
        vm: &mut Vm<'_>,
        host: &mut dyn Host,
        cmd: &[u32],
        reply: &mut Reply,
    ) {
        reply.clear();
        let Some(&head) = cmd.first() else {
            return;
        };
        let arg = head & ARG_MASK;

        match head & TYPE_MASK {
            M_READ_REGISTERS => {
                for r in 0..NUM_REGS {
                    if arg & arg_bit(r as u32) != 0 {
                        let _ = reply.try_push(vm.reg(r) as u32);
                    }
                }
            }
            M_WRITE_REGISTERS => {
                let mut payload = cmd[1..].iter();
                for r in 0..NUM_REGS {
                    if arg & arg_bit(r as u32) != 0 {
                        if let Some(&value) = payload.next() {
                            vm.set_reg(r, value as Reg);
                        }
                    }
                }
            }
            M_READ_RAM => {
                let count = cmd.get(1).copied().unwrap_or(0) as usize;
                let count = count.min(MAX_REPLY_WORDS * 4);
                let mut bytes = [0u8; MAX_REPLY_WORDS * 4];
                let Ok(offset) = vm.mem.map_ram(arg as Reg, count as u32)
                else {
                    return;
                };
                bytes[..count]
                    .copy_from_slice(&vm.mem.ram()[offset..offset + count]);
                for chunk in bytes[..count].chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    let _ = reply.try_push(u32::from_le_bytes(word));
                }
            }
            M_WRITE_RAM => {
                let count = cmd.get(1).copied().unwrap_or(0) as usize;
                let count = count.min((cmd.len().saturating_sub(2)) * 4);
                let Ok(offset) = vm.mem.map_ram(arg as Reg, count as u32)
                else {
                    return;
                };
                for i in 0..count {
                    let word = cmd[2 + i / 4];
                    vm.mem.ram_mut()[offset + i] =
                        (word >> ((i % 4) * 8)) as u8;
                }
            }
            M_SIGNAL => {
                self.signal = arg;
            }
            M_IS_STOPPED => {
                let _ = reply.try_push(self.signal);
            }
            M_DETACH => {
                self.breakpoints = [0; NUM_BREAKPOINTS];
                self.signal = Signal::Running as u32;
            }
            M_SET_BREAKPOINTS => {
                // The bitmap names which slots follow, one address each.
                let mut payload = cmd[1..].iter();
                for (slot, bp) in self.breakpoints.iter_mut().enumerate() {
                    if arg & (1 << (16 + slot)) != 0 {
                        if let Some(&addr) = payload.next() {
                            *bp = addr;
                        }
                    }
                }
            }
            M_STEP => {
                let _ = vm.run_slice(host, 1);
            }
            _ => {}
        }
    }
}

impl Default for DebugTarget {
    fn default() -> Self {
        Self::new()
    }
}
