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

//! Scheduling a vCPU on and off a physical CPU.
//!
//! While a vCPU is current, the hidden state loaded by `VMLOAD` (FS, GS, TR,
//! LDTR and the syscall MSRs) belongs to the guest. The host copy lives in the
//! root VMCB of the physical CPU and is swapped back when the vCPU leaves.

use axerrno::{AxResult, ax_err};
use tock_registers::interfaces::{ReadWriteable, Writeable};

use super::definitions::vector;
use super::percpu::SvmCpuTable;
use super::vcpu::SvmVcpu;
use super::vmcb::VmcbTlbControl;
use crate::hal::{HostPhysAddr, SvmHal};
use crate::vmm::{AsidAllocator, VmmServices};

fn root_vmcb_of<H: SvmHal, const N: usize>(
    cpus: &SvmCpuTable<H, N>,
    cpu: usize,
) -> AxResult<HostPhysAddr> {
    match cpus.root_vmcb(cpu) {
        Some(pa) => Ok(pa),
        None => ax_err!(BadState, "SVM is not enabled on this CPU"),
    }
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Takes the vCPU off the current physical CPU.
    pub fn ctxt_switch_from<const N: usize>(&mut self, cpus: &SvmCpuTable<H, N>) -> AxResult {
        let cpu = H::current_cpu();
        let root = root_vmcb_of(cpus, cpu)?;

        self.fpu_leave();
        self.save_dr();
        self.sync_vmcb();
        H::vmload(root);

        self.current = false;
        trace!("[SVM] vCPU switched out on CPU {}", cpu);
        Ok(())
    }

    /// Makes the vCPU current on this physical CPU.
    pub fn ctxt_switch_to<const N: usize>(&mut self, cpus: &SvmCpuTable<H, N>) -> AxResult {
        let cpu = H::current_cpu();
        let root = root_vmcb_of(cpus, cpu)?;

        self.restore_dr();
        H::vmsave(root);
        H::vmload(self.vmcb.phys_addr());

        self.current = true;
        trace!("[SVM] vCPU switched in on CPU {}", cpu);
        Ok(())
    }

    /// Prepares the VMCB for the next `VMRUN` on the current CPU.
    pub(super) fn do_resume(&mut self, vmm: &mut impl VmmServices) {
        let debug_state = vmm.debugger_attached();
        if self.state.debug_state_latch != debug_state {
            self.state.debug_state_latch = debug_state;
            let ct = &self.vmcb().control;
            ct.set_exception_intercept(vector::DB, debug_state);
            ct.set_exception_intercept(vector::BP, debug_state);
        }

        let cpu = H::current_cpu();
        if self.state.launch_core != Some(cpu) {
            debug!(
                "[SVM] vCPU moves from CPU {:?} to CPU {}",
                self.state.launch_core, cpu
            );
            self.state.launch_core = Some(cpu);
            vmm.migrate_timers(cpu);
            // ASIDs are per physical CPU.
            self.invalidate_asid();
        }
        self.assign_asid(vmm, cpu);

        self.vmcb().control.set_vtpr((vmm.tpr() & 0xff) >> 4);
    }

    fn assign_asid(&mut self, asids: &mut impl AsidAllocator, cpu: usize) {
        let ct = &self.vmcb.as_vmcb().control;
        if self.state.asid_generation == asids.generation(cpu) {
            ct.tlb_control.modify(VmcbTlbControl::CONTROL::DoNothing);
            return;
        }

        let (asid, generation) = asids.assign(cpu);
        self.state.asid_generation = generation;
        ct.guest_asid.set(asid);
        ct.tlb_control.modify(VmcbTlbControl::CONTROL::FlushGuestTlb);
        trace!("[SVM] CPU {}: ASID {} (generation {})", cpu, asid, generation);
    }

    /// Retires every ASID of the current CPU, so each vCPU running there
    /// starts with a clean TLB.
    pub fn flush_guest_tlbs(&mut self, asids: &mut impl AsidAllocator) {
        asids.bump_generation(H::current_cpu());
    }
}
