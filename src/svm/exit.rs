// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `#VMEXIT` dispatcher.

use bit_field::BitField;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use super::definitions::{SvmExitCode, SvmFeatureFlags, SvmIntercept, vector};
use super::emulate::EmulationResult;
use super::emulated::EmulatedCpu;
use super::vcpu::SvmVcpu;
use super::vmcb::{SvmExitInfo, VIntr};
use crate::hal::SvmHal;
use crate::regs::GeneralRegistersDiff;
use crate::vmm::{
    DomainControl, GuestFault, HypercallStatus, Instr, P2mType, TaskSwitchReason, VmmServices,
};

/// What happens to the guest `RIP` once a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitAction {
    /// Resume at the current `RIP`. Either the instruction is re-executed,
    /// a fault was injected or the handler already moved `RIP`.
    Resume,
    /// Retire the intercepted instruction, which is one of the given ones.
    Advance(&'static [Instr]),
    /// The exit cannot be handled. The domain is crashed.
    Crash,
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Handles the `#VMEXIT` recorded in the VMCB.
    pub(super) fn handle_exit(&mut self, vmm: &mut impl VmmServices) {
        // The guest may have changed its TPR through CR8 without exiting.
        vmm.set_tpr((self.vmcb().control.vtpr() & 0x0f) << 4);

        let info = self.vmcb().exit_info();
        trace!(
            "[SVM] #VMEXIT {:x?} @ rip {:#x}: info1={:#x} info2={:#x}",
            info.exit_code, info.guest_rip, info.exit_info_1, info.exit_info_2
        );

        let before = self.guest_regs;
        let action = if info.exit_code == Ok(SvmExitCode::Invalid) {
            self.vmcb().dump("handle_exit");
            ExitAction::Crash
        } else {
            self.requeue_interrupted_event();
            match info.exit_code {
                Ok(code) => self.dispatch(vmm, code, &info),
                Err(_) => ExitAction::Crash,
            }
        };

        match action {
            ExitAction::Resume => {}
            ExitAction::Advance(instrs) => {
                if let Some(len) = self.instruction_length(vmm, instrs, &info) {
                    self.update_guest_eip(vmm, len);
                }
            }
            ExitAction::Crash => {
                error!(
                    "[SVM] unexpected #VMEXIT: exit code = {:#x}, exitinfo1 = {:#x}, exitinfo2 = {:#x}",
                    self.vmcb().control.exit_code.get(),
                    info.exit_info_1,
                    info.exit_info_2
                );
                vmm.crash_domain();
            }
        }

        let diff = GeneralRegistersDiff::new(before, self.guest_regs);
        if !diff.is_same() {
            trace!("[SVM] {:?}", diff);
        }

        self.vmcb().control.set_vtpr((vmm.tpr() & 0xff) >> 4);
    }

    fn dispatch(
        &mut self,
        vmm: &mut impl VmmServices,
        code: SvmExitCode,
        info: &SvmExitInfo,
    ) -> ExitAction {
        use SvmExitCode::*;

        match code {
            // Taken by the host after STGI.
            Intr | Nmi | Smi => {
                trace!("[SVM] asynchronous exit {:?}", code);
                ExitAction::Resume
            }
            Exception(vector::DB) => {
                if !vmm.debugger_attached() {
                    return ExitAction::Crash;
                }
                vmm.pause_for_debugger();
                ExitAction::Resume
            }
            Exception(vector::BP) => {
                if !vmm.debugger_attached() {
                    return ExitAction::Crash;
                }
                // The INT3 intercept does not move RIP past the instruction.
                if let Some(len) = self.instruction_length(vmm, &[Instr::Int3], info) {
                    self.update_guest_eip(vmm, len);
                }
                vmm.pause_for_debugger();
                ExitAction::Resume
            }
            Exception(vector::NM) => {
                self.fpu_dirty_intercept();
                ExitAction::Resume
            }
            Exception(vector::PF) => {
                let va = info.exit_info_2;
                let error_code = info.exit_info_1 as u32;
                if vmm.paging_fault(va, error_code, &self.guest_regs) {
                    trace!("[SVM] #PF va={:#x} ec={:#x} fixed", va, error_code);
                } else {
                    self.inject_exception(vmm, vector::PF, Some(error_code), va);
                }
                ExitAction::Resume
            }
            Exception(vector::MC) => {
                // Already handled by the host machine-check handler.
                trace!("[SVM] #MC exit");
                ExitAction::Resume
            }
            Vintr => {
                let ct = &self.vmcb().control;
                ct.int_control.modify(VIntr::V_IRQ::CLEAR);
                ct.set_intercept(SvmIntercept::VINTR, false);
                ExitAction::Resume
            }
            Invd | Wbinvd => {
                self.wbinvd_intercept(&*vmm);
                ExitAction::Advance(&[Instr::Invd, Instr::Wbinvd])
            }
            TaskSwitch => {
                self.handle_task_switch(vmm, info);
                ExitAction::Resume
            }
            Cpuid => {
                let (leaf, subleaf) = (self.guest_regs.eax(), self.guest_regs.ecx());
                let res = self.cpuid_intercept(&*vmm, leaf, subleaf);
                self.guest_regs.rax = res.eax as u64;
                self.guest_regs.rbx = res.ebx as u64;
                self.guest_regs.rcx = res.ecx as u64;
                self.guest_regs.rdx = res.edx as u64;
                ExitAction::Advance(&[Instr::Cpuid])
            }
            Hlt => {
                self.handle_hlt(vmm, info);
                ExitAction::Resume
            }
            CrRead(_) | CrWrite(_) | Invlpg | Invlpga | Ioio => {
                self.emulate_or_gp(vmm);
                ExitAction::Resume
            }
            Vmmcall => {
                self.handle_vmmcall(vmm, info);
                ExitAction::Resume
            }
            DrRead(_) | DrWrite(_) => {
                // Hand the debug registers to the guest and re-execute.
                trace!("[SVM] debug register access");
                self.restore_debug_registers();
                ExitAction::Resume
            }
            Msr => {
                if info.exit_info_1 == 0 {
                    match self.msr_read_intercept(vmm) {
                        EmulationResult::Okay => ExitAction::Advance(&[Instr::Rdmsr]),
                        EmulationResult::Exception => ExitAction::Resume,
                    }
                } else {
                    match self.msr_write_intercept(vmm) {
                        EmulationResult::Okay => ExitAction::Advance(&[Instr::Wrmsr]),
                        EmulationResult::Exception => ExitAction::Resume,
                    }
                }
            }
            Shutdown => {
                vmm.triple_fault();
                ExitAction::Resume
            }
            Rdtscp | Monitor | Mwait | Vmrun | Vmload | Vmsave | Stgi | Clgi | Skinit => {
                self.inject_exception(vmm, vector::UD, None, 0);
                ExitAction::Resume
            }
            Npf => {
                self.handle_nested_page_fault(vmm, info.exit_info_2);
                ExitAction::Resume
            }
            _ => ExitAction::Crash,
        }
    }

    /// Length of the intercepted instruction.
    ///
    /// Taken from `next_rip` when the CPU saves it, otherwise decoded from
    /// guest memory. `None` means decoding failed and a fault was raised
    /// instead.
    fn instruction_length(
        &mut self,
        vmm: &mut impl VmmServices,
        expected: &[Instr],
        info: &SvmExitInfo,
    ) -> Option<u8> {
        if self.features.contains(SvmFeatureFlags::NRIPS) && info.guest_next_rip != 0 {
            let len = info.guest_next_rip.wrapping_sub(info.guest_rip);
            return Some(u8::try_from(len).unwrap_or(0));
        }
        match vmm.instruction_length(info.guest_rip, expected) {
            Ok(len) => Some(len),
            Err(fault) => {
                debug!("[SVM] cannot decode {:?} at {:#x}", expected, info.guest_rip);
                self.raise_fault(vmm, fault);
                None
            }
        }
    }

    fn raise_fault(&mut self, domain: &mut impl DomainControl, fault: GuestFault) {
        self.inject_exception(domain, fault.vector, fault.error_code, fault.cr2);
    }

    /// Hands the intercepted instruction to the generic emulator and applies
    /// what it asked for. `#GP(0)` if it cannot be emulated.
    fn emulate_or_gp(&mut self, vmm: &mut impl VmmServices) {
        let mut cpu = EmulatedCpu::new(self);
        let handled = vmm.handle_mmio(&mut cpu);
        let (cr_writes, faults) = cpu.into_effects();

        for (cr, value) in cr_writes {
            trace!("[SVM] emulated write {:?} <- {:#x}", cr, value);
            self.set_guest_cr(vmm, cr, value);
        }
        for fault in faults {
            self.raise_fault(vmm, fault);
        }
        if !handled {
            self.inject_exception(vmm, vector::GP, Some(0), 0);
        }
    }

    fn handle_task_switch(&mut self, vmm: &mut impl VmmServices, info: &SvmExitInfo) {
        let info2 = info.exit_info_2;
        let reason = if info2.get_bit(36) {
            TaskSwitchReason::Iret
        } else if info2.get_bit(38) {
            TaskSwitchReason::Jmp
        } else {
            TaskSwitchReason::CallOrInt
        };
        let error_code = info2.get_bit(44).then_some(info2 as u32);

        // A task gate in the IDT may leave the event in EXITINTINFO. The
        // emulated switch delivers it, so it must not be injected again.
        self.vmcb().control.event_inj.set(0);
        vmm.task_switch(info.exit_info_1 as u16, reason, error_code);
    }

    fn handle_hlt(&mut self, vmm: &mut impl VmmServices, info: &SvmExitInfo) {
        let ack = vmm.pending_irq();
        let Some(len) = self.instruction_length(vmm, &[Instr::Hlt], info) else {
            return;
        };
        self.update_guest_eip(vmm, len);

        let wake = self.event_pending()
            || ack.is_some_and(|ack| !self.interrupt_blocked(&*vmm, ack));
        if wake {
            trace!("[SVM] hlt with interrupt pending");
            return;
        }
        trace!("[SVM] hlt");
        vmm.halt(self.vmcb().state.rflags.get());
    }

    fn handle_vmmcall(&mut self, vmm: &mut impl VmmServices, info: &SvmExitInfo) {
        let Some(len) = self.instruction_length(vmm, &[Instr::Vmmcall], info) else {
            return;
        };
        trace!("[SVM] vmmcall eax={:#x}", self.guest_regs.rax);

        match vmm.hypercall(&mut self.guest_regs) {
            // Retried on the next entry.
            HypercallStatus::Preempted => {}
            status => {
                self.update_guest_eip(vmm, len);
                if status == HypercallStatus::Invalidate {
                    vmm.send_invalidate_req();
                }
            }
        }
    }

    fn handle_nested_page_fault(&mut self, vmm: &mut impl VmmServices, gpa: u64) {
        let gfn = gpa >> 12;
        if vmm.p2m_type(gfn) == P2mType::MmioDm {
            self.emulate_or_gp(vmm);
            return;
        }

        // The fault is not checked to be a write, so read faults on log-dirty
        // pages also mark them dirty.
        vmm.mark_dirty(gfn);
        vmm.change_type(gfn, P2mType::RamLogDirty, P2mType::Ram);
    }
}
