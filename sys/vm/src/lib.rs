// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sandboxed virtual machine that runs untrusted game binaries.
//!
//! There is no memory protection hardware between a game and the rest of
//! the system; safety comes from two cooperating checks instead. The
//! static validator proves, one 256-byte code block at a time, that a
//! prefix of the block contains only permitted instructions whose
//! control flow stays inside that prefix — except through SVCs, whose
//! targets the runtime re-checks when they happen. Together that means
//! the interpreter only ever executes certified instructions, and every
//! cross-block transfer passes through a runtime gate.
//!
//! Scheduling is cooperative and single threaded: the VM busy-loops,
//! suspension is expressed as a blocking syscall into the host, and the
//! only asynchronous entry is an event callback dispatched between
//! instructions at bundle-aligned program counters.
//!
//! Faults are unrecoverable from the guest's point of view: the runtime
//! snapshots registers, reports through the host's debug pipe, and
//! terminates the invocation.

#![cfg_attr(not(test), no_std)]

use abi::{FaultCode, Reg, NUM_REGS, REG_PC};
use flash_device::FlashDevice;
use flash_map::BlockCache;

mod cpu;
pub mod debug;
pub mod mem;
mod runtime;
pub mod validator;

pub use mem::SvmMemory;
pub use runtime::StackInfo;

/// A fault snapshot, as delivered to the host debug pipe and shown on
/// the panic screen.
#[derive(Copy, Clone, Debug)]
pub struct FaultReport {
    pub code: FaultCode,
    /// Virtual code address at the time of the fault.
    pub pc: u32,
    /// ISA-visible register values.
    pub regs: [u32; NUM_REGS],
}

#[derive(Copy, Clone, Debug)]
pub enum ExitReason {
    /// The guest asked to exit through the host.
    Exited,
    Faulted(FaultReport),
}

/// An event callback waiting to be injected.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    /// Target address, in the same form branch literals use.
    pub addr: u32,
    pub args: [u32; 8],
    pub num_args: usize,
}

/// The host side of the VM: the syscall table and the collaborators the
/// core deliberately doesn't own.
pub trait Host {
    /// Dispatch one syscall. Handlers must be bounded-time; anything
    /// long-running is expressed as an event completion later.
    fn syscall(
        &mut self,
        num: u16,
        ctx: &mut SyscallCtx<'_, '_>,
    ) -> Result<(), FaultCode>;

    /// Whole ticks of simulated time, forwarded at branches and SVCs.
    /// The host's watchdog may answer with `NotResponding`.
    fn elapse_ticks(&mut self, _ticks: u32) -> Result<(), FaultCode> {
        Ok(())
    }

    /// The debug pipe: a fault was taken.
    fn fault(&mut self, _report: &FaultReport) {}

    /// A guest breakpoint trap.
    fn breakpoint(&mut self) {}
}

pub struct Vm<'c> {
    regs: [Reg; NUM_REGS],
    pub mem: SvmMemory,
    cache: &'c BlockCache,
    dev: &'c mut dyn FlashDevice,

    // Cycle accounting, pre-multiplied by the rate denominator.
    cycles: u32,

    // Exception frame bookkeeping; see runtime.rs.
    user_regs: runtime::UserRegs,

    stack_limit: Reg,
    stack_top: Reg,
    stack_low_water: Reg,

    event: Option<Event>,
    event_frame: Reg,

    pending_exit: bool,
}

impl<'c> Vm<'c> {
    pub fn new(cache: &'c BlockCache, dev: &'c mut dyn FlashDevice) -> Self {
        Self {
            regs: [0; NUM_REGS],
            mem: SvmMemory::new(),
            cache,
            dev,
            cycles: 0,
            user_regs: runtime::UserRegs::default(),
            stack_limit: 0,
            stack_top: 0,
            stack_low_water: 0,
            event: None,
            event_frame: 0,
            pending_exit: false,
        }
    }

    pub fn reg(&self, r: usize) -> Reg {
        self.regs[r]
    }

    pub fn set_reg(&mut self, r: usize, value: Reg) {
        self.regs[r] = value;
    }

    pub fn cache(&self) -> &'c BlockCache {
        self.cache
    }

    /// Virtual code address of the next instruction.
    pub fn pc(&self) -> u32 {
        mem::squash(self.regs[REG_PC])
    }

    /// Lowest stack address the guest has touched, for diagnostics.
    pub fn stack_low_water(&self) -> u32 {
        mem::squash(self.stack_low_water)
    }

    /// Queue an event callback, to be injected between instructions at
    /// the next bundle-aligned PC with no other event in flight. At most
    /// one may be queued; returns false if the slot is taken.
    pub fn post_event(&mut self, event: Event) -> bool {
        if self.event.is_some() {
            return false;
        }
        self.event = Some(event);
        true
    }

    /// Frame pointer of the in-flight event handler, zero when none.
    pub fn event_frame(&self) -> u32 {
        mem::squash(self.event_frame)
    }

    /// Run until the guest exits or faults.
    pub fn run(&mut self, host: &mut dyn Host) -> ExitReason {
        loop {
            if let Some(reason) = self.run_slice(host, usize::MAX) {
                return reason;
            }
        }
    }

    /// Execute at most `max_instructions`, returning early on exit or
    /// fault. `None` means the budget ran out with the guest healthy.
    pub fn run_slice(
        &mut self,
        host: &mut dyn Host,
        max_instructions: usize,
    ) -> Option<ExitReason> {
        for _ in 0..max_instructions {
            if self.pending_exit {
                return Some(ExitReason::Exited);
            }
            if let Err(code) = self.step(host) {
                return Some(ExitReason::Faulted(self.take_fault(host, code)));
            }
        }
        None
    }

    /// Record a fault: snapshot state, tell the debug pipe, terminate.
    fn take_fault(
        &mut self,
        host: &mut dyn Host,
        code: FaultCode,
    ) -> FaultReport {
        let mut regs = [0u32; NUM_REGS];
        for (i, slot) in regs.iter_mut().enumerate() {
            *slot = mem::squash(self.regs[i]);
        }
        let report = FaultReport { code, pc: self.pc(), regs };
        host.fault(&report);
        self.pending_exit = true;
        report
    }
}

/// The view an SVC handler gets of the interrupted guest.
///
/// Mutations made here land in the saved register frame, so they are
/// visible to the guest when it resumes — this is the hypercall ABI's
/// way of returning values.
pub struct SyscallCtx<'a, 'c> {
    pub(crate) vm: &'a mut Vm<'c>,
}

impl SyscallCtx<'_, '_> {
    /// Syscall argument registers r0..r7.
    pub fn arg(&self, index: usize) -> u32 {
        debug_assert!(index < 8);
        self.vm.user_regs.get(index)
    }

    /// 64-bit syscall result, returned in r0:r1.
    pub fn set_result(&mut self, value: u64) {
        self.vm.user_regs.set(0, value as u32);
        self.vm.user_regs.set(1, (value >> 32) as u32);
    }

    /// Read any register through the saved-frame view.
    pub fn reg(&self, r: usize) -> u32 {
        self.vm.user_regs.get(r)
    }

    /// Write any register through the saved-frame view; the guest sees
    /// the new value when it resumes.
    pub fn set_reg(&mut self, r: usize, value: u32) {
        self.vm.user_regs.set(r, value);
    }

    pub fn mem(&mut self) -> &mut SvmMemory {
        &mut self.vm.mem
    }

    /// Copy guest memory into a host buffer, faulting the usual way on
    /// a bad address.
    pub fn copy_in(&mut self, dst: &mut [u8], va: u32) -> Result<(), FaultCode> {
        let Vm { mem, cache, dev, .. } = &mut *self.vm;
        if mem.copy_ro(cache, &**dev, dst, va as Reg) {
            Ok(())
        } else {
            Err(FaultCode::SyscallAddress)
        }
    }

    /// Copy a host buffer into guest RAM.
    pub fn copy_out(&mut self, va: u32, src: &[u8]) -> Result<(), FaultCode> {
        let offset = self
            .vm
            .mem
            .map_ram(va as Reg, src.len() as u32)
            .map_err(|()| FaultCode::SyscallAddress)?;
        self.vm.mem.ram_mut()[offset..offset + src.len()]
            .copy_from_slice(src);
        Ok(())
    }

    /// NUL-terminated guest string copy with a destination bound.
    pub fn copy_string(
        &mut self,
        dst: &mut [u8],
        va: u32,
    ) -> Result<(), FaultCode> {
        let Vm { mem, cache, dev, .. } = &mut *self.vm;
        if mem.strlcpy_ro(cache, &**dev, dst, va as Reg) {
            Ok(())
        } else {
            Err(FaultCode::SyscallAddress)
        }
    }

    pub fn flash(&mut self) -> (&BlockCache, &mut dyn FlashDevice) {
        (self.vm.cache, &mut *self.vm.dev)
    }

    /// Ask the main loop to stop after this syscall returns.
    pub fn request_exit(&mut self) {
        self.vm.pending_exit = true;
    }

    pub fn post_event(&mut self, event: Event) -> bool {
        self.vm.post_event(event)
    }
}
