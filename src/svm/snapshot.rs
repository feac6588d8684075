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

//! Save and restore of the virtualization-relevant CPU state.

use axerrno::{AxResult, ax_err_type};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::Cr0Flags;

use super::event::PendingEvent;
use super::sync::GuestCr;
use super::vcpu::SvmVcpu;
use super::vmcb::NestedCtl;
use crate::hal::SvmHal;
use crate::vmm::VmmServices;

/// Guest PAT installed with nested paging: WB, WT, UC-, UC in both halves.
const NESTED_GUEST_PAT: u64 = 0x0007_0406_0007_0406;

/// CPU state carried across save/restore and migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,

    /// Raw `EVENTINJ` descriptor, zero unless the event must be delivered
    /// again after restore.
    pub pending_event: u32,
    pub error_code: u32,

    pub msr_kernel_gs_base: u64,
    pub msr_lstar: u64,
    pub msr_star: u64,
    pub msr_cstar: u64,
    pub msr_syscall_mask: u64,
    pub msr_efer: u64,
    /// Always all ones: every field above is meaningful.
    pub msr_flags: u64,

    /// Guest TSC at the time of the save.
    pub tsc: u64,
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Captures the CPU context of the vCPU.
    pub fn save_ctxt(&mut self) -> CpuContext {
        if self.current {
            self.sync_vmcb();
        }

        let event = self.pending_event();
        let (pending_event, error_code) = if event.needs_reinjection() {
            event.encode()
        } else {
            (0, 0)
        };

        let st = &self.vmcb.as_vmcb().state;
        CpuContext {
            cr0: self.state.guest_cr[0],
            cr2: self.state.guest_cr[2],
            cr3: self.state.guest_cr[3],
            cr4: self.state.guest_cr[4],
            sysenter_cs: st.sysenter_cs.get(),
            sysenter_esp: st.sysenter_esp.get(),
            sysenter_eip: st.sysenter_eip.get(),
            pending_event,
            error_code,
            msr_kernel_gs_base: st.kernel_gs_base.get(),
            msr_lstar: st.lstar.get(),
            msr_star: st.star.get(),
            msr_cstar: st.cstar.get(),
            msr_syscall_mask: st.sfmask.get(),
            msr_efer: self.state.guest_efer,
            msr_flags: !0,
            tsc: self.guest_time(),
        }
    }

    /// Loads a CPU context saved by [`SvmVcpu::save_ctxt`].
    ///
    /// A context with a malformed pending event, or whose `CR3` does not
    /// reference guest RAM when shadow paging is used, is rejected before
    /// anything is modified. The domain is crashed in that case.
    pub fn load_ctxt(&mut self, vmm: &mut impl VmmServices, ctxt: &CpuContext) -> AxResult {
        let event = match self.check_ctxt(vmm, ctxt) {
            Ok(event) => event,
            Err(err) => {
                error!("[SVM] CPU context restore failed");
                vmm.crash_domain();
                return Err(err);
            }
        };

        if self.current {
            self.sync_vmcb();
        }
        self.load_cpu_state(ctxt);

        if !vmm.hap_enabled() {
            if Cr0Flags::from_bits_truncate(self.state.guest_cr[0]).contains(Cr0Flags::PAGING) {
                vmm.put_guest_table(self.state.guest_table);
            }
            self.state.guest_table = if Cr0Flags::from_bits_truncate(ctxt.cr0)
                .contains(Cr0Flags::PAGING)
            {
                ctxt.cr3
            } else {
                0
            };
        }

        self.state.guest_cr[0] = ctxt.cr0 | Cr0Flags::EXTENSION_TYPE.bits();
        self.state.guest_cr[2] = ctxt.cr2;
        self.state.guest_cr[3] = ctxt.cr3;
        self.state.guest_cr[4] = ctxt.cr4;
        for cr in [GuestCr::Cr0, GuestCr::Cr2, GuestCr::Cr4] {
            self.update_guest_cr(&*vmm, cr);
        }

        let vmcb = self.vmcb();
        vmcb.state.sysenter_cs.set(ctxt.sysenter_cs);
        vmcb.state.sysenter_esp.set(ctxt.sysenter_esp);
        vmcb.state.sysenter_eip.set(ctxt.sysenter_eip);

        if vmm.hap_enabled() {
            vmcb.control.nested_ctl.modify(NestedCtl::NP_ENABLE::SET);
            vmcb.state.g_pat.set(NESTED_GUEST_PAT);
            vmcb.control.nested_cr3.set(vmm.p2m_root());
        }

        if !event.is_none() {
            debug!(
                "[SVM] Re-injecting {:#x}, {:#x}",
                ctxt.pending_event, ctxt.error_code
            );
            if event.needs_reinjection() {
                self.set_pending_event(event);
            }
        }

        self.state.hw_cr3 = vmm.update_paging_modes();
        self.update_guest_cr(&*vmm, GuestCr::Cr3);

        if self.current {
            H::vmload(self.vmcb.phys_addr());
        }
        Ok(())
    }

    /// Validates `ctxt` and pins its page-table root. Modifies nothing else.
    fn check_ctxt(&self, vmm: &mut impl VmmServices, ctxt: &CpuContext) -> AxResult<PendingEvent> {
        let event = PendingEvent::decode(ctxt.pending_event, ctxt.error_code).map_err(|raw| {
            error!("[SVM] invalid pending event {:#x}", raw);
            ax_err_type!(InvalidData)
        })?;

        let paging = Cr0Flags::from_bits_truncate(ctxt.cr0).contains(Cr0Flags::PAGING);
        if !vmm.hap_enabled() && paging && !vmm.get_guest_table(ctxt.cr3) {
            error!("[SVM] invalid CR3 value {:#x}", ctxt.cr3);
            return Err(ax_err_type!(InvalidData));
        }
        Ok(event)
    }

    fn load_cpu_state(&mut self, ctxt: &CpuContext) {
        let st = &self.vmcb().state;
        st.kernel_gs_base.set(ctxt.msr_kernel_gs_base);
        st.lstar.set(ctxt.msr_lstar);
        st.star.set(ctxt.msr_star);
        st.cstar.set(ctxt.msr_cstar);
        st.sfmask.set(ctxt.msr_syscall_mask);

        self.state.guest_efer = ctxt.msr_efer;
        self.update_guest_efer();
        self.set_guest_time(ctxt.tsc);
    }
}
