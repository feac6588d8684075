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

use core::fmt::{Debug, Formatter, Result};

use axerrno::{AxResult, ax_err};
use raw_cpuid::CpuIdResult;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::Cr0Flags;

use super::definitions::{SvmFeatureFlags, SvmIntercept, vector};
use super::emulate::{self, EmulationResult};
use super::snapshot::CpuContext;
use super::structs::{IOPm, MSRPm, VmcbFrame};
use super::sync::{GuestCr, InterruptShadow, Segment};
use super::vmcb::{InterceptCrRw, NestedCtl, SegmentRegister, VIntr, VmcbStruct};
use crate::fpu::GuestFpu;
use crate::hal::SvmHal;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmm::{AsidAllocator, CpuidPolicy, DomainControl, GuestPaging, VirtualLapic, VmmServices};

/// Guest PAT at reset: WB, WT, UC-, UC in both halves.
const RESET_GUEST_PAT: u64 = 0x0007_0406_0007_0406;

/// Software shadow of the guest state that is not always held by the VMCB.
#[derive(Debug, Clone, Default)]
pub struct VCpuVirtState {
    /// `DR0`-`DR7`. Entries 4 and 5 are unused.
    pub debugreg: [u64; 8],
    /// The debug registers are loaded in hardware and not intercepted.
    pub dr_dirty: bool,
    /// `EFER` as written by the guest.
    pub guest_efer: u64,
    /// `CR0`-`CR4` as seen by the guest. `CR1` is unused.
    pub guest_cr: [u64; 5],
    /// Page-table root the hardware uses as `CR3`.
    pub hw_cr3: u64,
    /// Guest page-table root pinned for shadow paging.
    pub guest_table: u64,
    /// ASID generation of `guest_asid`. 0 forces a new ASID.
    pub asid_generation: u64,
    /// Physical CPU of the last `VMRUN`.
    pub launch_core: Option<usize>,
    /// Debugger state the exception intercepts were configured for.
    pub debug_state_latch: bool,
}

/// A vCPU backed by AMD-SVM.
pub struct SvmVcpu<H: SvmHal> {
    pub(super) guest_regs: GeneralRegisters,
    pub(super) vmcb: VmcbFrame<H::MmHal>,
    iopm: IOPm<H::MmHal>,
    pub(super) msrpm: MSRPm<H::MmHal>,
    pub(super) state: VCpuVirtState,
    pub(super) fpu: GuestFpu,
    pub(super) features: SvmFeatureFlags,
    /// The VMCB holds the current hidden segment state of the guest.
    pub(super) vmcb_in_sync: bool,
    /// The VMCB is loaded on the physical CPU we run on.
    pub(super) current: bool,
    launched: bool,
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Creates a vCPU in its reset state: protected mode without paging,
    /// flat segments.
    pub fn new(vmm: &(impl DomainControl + GuestPaging), features: SvmFeatureFlags) -> AxResult<Self> {
        let mut vcpu = Self {
            guest_regs: GeneralRegisters::default(),
            vmcb: VmcbFrame::new()?,
            iopm: IOPm::intercept_all()?,
            msrpm: MSRPm::intercept_all()?,
            state: VCpuVirtState::default(),
            fpu: GuestFpu::new(),
            features,
            vmcb_in_sync: true,
            current: false,
            launched: false,
        };
        vcpu.setup_vmcb_control(vmm);
        vcpu.setup_vmcb_guest(vmm);

        info!(
            "[SVM] created SvmVcpu (vmcb: {:#x}, hap: {})",
            vcpu.vmcb.phys_addr(),
            vmm.hap_enabled()
        );
        Ok(vcpu)
    }

    fn setup_vmcb_control(&mut self, vmm: &(impl DomainControl + GuestPaging)) {
        // The hidden state of these is switched by VMLOAD/VMSAVE.
        for msr in [
            Msr::IA32_FS_BASE,
            Msr::IA32_GS_BASE,
            Msr::IA32_KERNEL_GSBASE,
            Msr::IA32_STAR,
            Msr::IA32_LSTAR,
            Msr::IA32_CSTAR,
            Msr::IA32_FMASK,
        ] {
            self.msrpm.set_read_intercept(msr as u32, false);
            self.msrpm.set_write_intercept(msr as u32, false);
        }

        let hap = vmm.hap_enabled();
        let ct = &self.vmcb.as_vmcb().control;
        for intc in [
            SvmIntercept::INTR,
            SvmIntercept::NMI,
            SvmIntercept::SMI,
            SvmIntercept::CPUID,
            SvmIntercept::INVD,
            SvmIntercept::HLT,
            SvmIntercept::INVLPGA,
            SvmIntercept::IOIO_PROT,
            SvmIntercept::MSR_PROT,
            SvmIntercept::TASK_SWITCH,
            SvmIntercept::SHUTDOWN,
            SvmIntercept::VMRUN,
            SvmIntercept::VMMCALL,
            SvmIntercept::VMLOAD,
            SvmIntercept::VMSAVE,
            SvmIntercept::STGI,
            SvmIntercept::CLGI,
            SvmIntercept::SKINIT,
            SvmIntercept::RDTSCP,
            SvmIntercept::WBINVD,
            SvmIntercept::MONITOR,
            SvmIntercept::MWAIT,
        ] {
            ct.set_intercept(intc, true);
        }
        ct.set_intercept(SvmIntercept::INVLPG, !hap);

        // CR2 is never intercepted, CR3 only under shadow paging.
        ct.intercept_cr.write(
            InterceptCrRw::READ_CR0::SET
                + InterceptCrRw::READ_CR4::SET
                + InterceptCrRw::READ_CR8::SET
                + InterceptCrRw::WRITE_CR0::SET
                + InterceptCrRw::WRITE_CR4::SET
                + InterceptCrRw::WRITE_CR8::SET,
        );
        if !hap {
            ct.intercept_cr
                .modify(InterceptCrRw::READ_CR3::SET + InterceptCrRw::WRITE_CR3::SET);
        }

        ct.intercept_dr.set(!0);
        ct.set_exception_intercept(vector::NM, true);
        ct.set_exception_intercept(vector::MC, true);
        ct.set_exception_intercept(vector::PF, !hap);

        ct.int_control.write(VIntr::V_INTR_MASKING::SET);
        ct.iopm_base_pa.set(self.iopm.phys_addr().as_usize() as u64);
        ct.msrpm_base_pa.set(self.msrpm.phys_addr().as_usize() as u64);
        ct.tsc_offset.set(0);

        if hap {
            ct.nested_ctl.modify(NestedCtl::NP_ENABLE::SET);
            ct.nested_cr3.set(vmm.p2m_root());
        }
    }

    fn setup_vmcb_guest(&mut self, vmm: &impl DomainControl) {
        let st = &self.vmcb.as_vmcb().state;

        // Flat 4GB segments: 32-bit code, read/write data.
        st.cs.set(0, 0, !0, 0xc9b);
        for seg in [&st.ds, &st.es, &st.fs, &st.gs, &st.ss] {
            seg.set(0, 0, !0, 0xc93);
        }
        st.ldtr.set(0, 0, 0, 0);
        st.tr.set(0, 0, 0xff, 0x8b);
        st.gdtr.set(0, 0, 0, 0);
        st.idtr.set(0, 0, 0, 0);
        st.cpl.set(0);

        st.rflags.set(0x2);
        st.dr6.set(0xffff_0ff0);
        st.dr7.set(0x400);
        st.g_pat.set(RESET_GUEST_PAT);
        self.state.debugreg[6] = 0xffff_0ff0;
        self.state.debugreg[7] = 0x400;

        self.state.guest_cr[0] = (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::EXTENSION_TYPE).bits();
        self.update_guest_cr(vmm, GuestCr::Cr0);
        self.update_guest_cr(vmm, GuestCr::Cr2);
        self.update_guest_cr(vmm, GuestCr::Cr4);
        self.state.guest_efer = 0;
        self.update_guest_efer();
    }

    /// Typed view of the VMCB.
    pub(crate) fn vmcb(&self) -> &VmcbStruct {
        self.vmcb.as_vmcb()
    }

    pub fn regs(&self) -> &GeneralRegisters {
        &self.guest_regs
    }

    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.guest_regs
    }

    pub fn rip(&self) -> u64 {
        self.vmcb().state.rip.get()
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.vmcb().state.rip.set(rip);
    }

    pub fn virt_state(&self) -> &VCpuVirtState {
        &self.state
    }

    /// The vCPU is loaded on the current physical CPU.
    pub fn is_current(&self) -> bool {
        self.current
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    pub fn guest_cr(&self, cr: GuestCr) -> u64 {
        self.state.guest_cr[cr as usize]
    }

    /// Changes a guest control register on behalf of the emulator and
    /// refreshes the paging mode if needed.
    pub fn set_guest_cr(&mut self, vmm: &mut impl VmmServices, cr: GuestCr, value: u64) {
        self.state.guest_cr[cr as usize] = value;
        if cr == GuestCr::Cr2 {
            self.update_guest_cr(&*vmm, cr);
            return;
        }
        if cr != GuestCr::Cr3 {
            self.update_guest_cr(&*vmm, cr);
        }
        self.state.hw_cr3 = vmm.update_paging_modes();
        self.update_guest_cr(&*vmm, GuestCr::Cr3);
    }

    /// Runs the guest until the next `#VMEXIT` and handles it.
    ///
    /// The vCPU must have been switched in with
    /// [`SvmVcpu::ctxt_switch_to`] on this physical CPU.
    pub fn run(&mut self, vmm: &mut impl VmmServices) -> AxResult {
        if !self.current {
            return ax_err!(BadState, "vCPU is not loaded on this CPU");
        }

        self.do_resume(vmm);

        self.vmcb().state.rax.set(self.guest_regs.rax);
        H::vmrun(self.vmcb.phys_addr(), &mut self.guest_regs);
        self.guest_regs.rax = self.vmcb().state.rax.get();
        self.vmcb_in_sync = false;
        self.launched = true;

        self.handle_exit(vmm);
        Ok(())
    }
}

impl<H: SvmHal> Debug for SvmVcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let st = &self.vmcb().state;
        f.debug_struct("SvmVcpu")
            .field("guest_regs", &self.guest_regs)
            .field("rip", &st.rip.get())
            .field("rsp", &st.rsp.get())
            .field("rflags", &st.rflags.get())
            .field("cr0", &st.cr0.get())
            .field("cr3", &st.cr3.get())
            .field("cr4", &st.cr4.get())
            .field("efer", &st.efer.get())
            .field("vmcb", &self.vmcb.phys_addr())
            .field("iopm", &self.iopm.phys_addr())
            .field("msrpm", &self.msrpm.phys_addr())
            .field("state", &self.state)
            .field("fpu", &self.fpu)
            .field("current", &self.current)
            .field("launched", &self.launched)
            .finish()
    }
}

/// Hooks the generic hypervisor calls into a hardware backend.
pub trait VirtBackend {
    fn save_cpu_ctxt(&mut self) -> CpuContext;
    fn load_cpu_ctxt(&mut self, vmm: &mut impl VmmServices, ctxt: &CpuContext) -> AxResult;

    fn get_segment_register(&mut self, seg: Segment) -> SegmentRegister;
    fn set_segment_register(&mut self, seg: Segment, reg: &SegmentRegister);
    fn interrupt_shadow(&self) -> InterruptShadow;
    fn set_interrupt_shadow(&mut self, shadow: InterruptShadow);
    /// 0 real mode, 1 virtual-8086, 2/4 16/32-bit protected mode, 8 long mode.
    fn guest_x86_mode(&self) -> u8;

    fn update_guest_cr(&mut self, domain: &impl DomainControl, cr: GuestCr);
    fn update_guest_efer(&mut self);
    fn flush_guest_tlbs(&mut self, asids: &mut impl AsidAllocator);
    fn set_tsc_offset(&mut self, offset: u64);

    fn inject_exception(
        &mut self,
        domain: &mut impl DomainControl,
        vector: u8,
        error_code: Option<u32>,
        cr2: u64,
    );
    fn event_pending(&self) -> bool;

    fn init_hypercall_page(&self, page: &mut [u8]);

    fn fpu_dirty_intercept(&mut self);
    fn invlpg_intercept(&mut self, paging: &mut impl GuestPaging, va: u64);
    fn wbinvd_intercept(&mut self, domain: &impl DomainControl);
    fn cpuid_intercept(
        &mut self,
        vmm: &(impl CpuidPolicy + VirtualLapic + DomainControl),
        leaf: u32,
        subleaf: u32,
    ) -> CpuIdResult;
    fn msr_read_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult;
    fn msr_write_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult;
}

impl<H: SvmHal> VirtBackend for SvmVcpu<H> {
    fn save_cpu_ctxt(&mut self) -> CpuContext {
        self.save_ctxt()
    }

    fn load_cpu_ctxt(&mut self, vmm: &mut impl VmmServices, ctxt: &CpuContext) -> AxResult {
        self.load_ctxt(vmm, ctxt)
    }

    fn get_segment_register(&mut self, seg: Segment) -> SegmentRegister {
        Self::get_segment_register(self, seg)
    }

    fn set_segment_register(&mut self, seg: Segment, reg: &SegmentRegister) {
        Self::set_segment_register(self, seg, reg)
    }

    fn interrupt_shadow(&self) -> InterruptShadow {
        Self::interrupt_shadow(self)
    }

    fn set_interrupt_shadow(&mut self, shadow: InterruptShadow) {
        Self::set_interrupt_shadow(self, shadow)
    }

    fn guest_x86_mode(&self) -> u8 {
        Self::guest_x86_mode(self)
    }

    fn update_guest_cr(&mut self, domain: &impl DomainControl, cr: GuestCr) {
        Self::update_guest_cr(self, domain, cr)
    }

    fn update_guest_efer(&mut self) {
        Self::update_guest_efer(self)
    }

    fn flush_guest_tlbs(&mut self, asids: &mut impl AsidAllocator) {
        Self::flush_guest_tlbs(self, asids)
    }

    fn set_tsc_offset(&mut self, offset: u64) {
        Self::set_tsc_offset(self, offset)
    }

    fn inject_exception(
        &mut self,
        domain: &mut impl DomainControl,
        vector: u8,
        error_code: Option<u32>,
        cr2: u64,
    ) {
        Self::inject_exception(self, domain, vector, error_code, cr2)
    }

    fn event_pending(&self) -> bool {
        Self::event_pending(self)
    }

    fn init_hypercall_page(&self, page: &mut [u8]) {
        emulate::init_hypercall_page(page)
    }

    fn fpu_dirty_intercept(&mut self) {
        Self::fpu_dirty_intercept(self)
    }

    fn invlpg_intercept(&mut self, paging: &mut impl GuestPaging, va: u64) {
        Self::invlpg_intercept(self, paging, va)
    }

    fn wbinvd_intercept(&mut self, domain: &impl DomainControl) {
        Self::wbinvd_intercept(self, domain)
    }

    fn cpuid_intercept(
        &mut self,
        vmm: &(impl CpuidPolicy + VirtualLapic + DomainControl),
        leaf: u32,
        subleaf: u32,
    ) -> CpuIdResult {
        Self::cpuid_intercept(self, vmm, leaf, subleaf)
    }

    fn msr_read_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult {
        Self::msr_read_intercept(self, vmm)
    }

    fn msr_write_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult {
        Self::msr_write_intercept(self, vmm)
    }
}
