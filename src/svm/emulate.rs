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

//! Emulation of the instructions and MSRs the backend intercepts itself.

use bit_field::BitField;
use raw_cpuid::CpuIdResult;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::{Cr0Flags, EferFlags};
use x86_64::registers::rflags::RFlags;

use super::definitions::{SvmFeatureFlags, vector};
use super::vcpu::SvmVcpu;
use super::vmcb::VirtExt;
use crate::hal::SvmHal;
use crate::msr::Msr;
use crate::vmm::{CpuidPolicy, DomainControl, GuestPaging, VirtualLapic, VmmServices};

/// Longest legal x86 instruction.
const MAX_INSTRUCTION_LEN: u8 = 15;

/// `MC4_MISC.Locked`: the threshold register is owned by firmware.
const MC4_MISC_LOCKED: u64 = 1 << 61;

/// Hypercall number of `HYPERVISOR_iret`, which guests may not call through
/// the page.
const HYPERCALL_IRET: usize = 23;
const HYPERCALL_STUB_SIZE: usize = 32;

/// Outcome of an emulated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationResult {
    /// The access completed and the instruction can be retired.
    Okay,
    /// A fault was injected into the guest instead.
    Exception,
}

enum LongModeWrite {
    Done,
    Unhandled,
    Exception,
}

/// Fills a hypercall page with one 32-byte stub per hypercall:
/// `mov eax, <nr>; vmmcall; ret`.
pub fn init_hypercall_page(page: &mut [u8]) {
    for (nr, stub) in page.chunks_exact_mut(HYPERCALL_STUB_SIZE).enumerate() {
        stub[0] = 0xb8;
        stub[1..5].copy_from_slice(&(nr as u32).to_le_bytes());
        stub[5..8].copy_from_slice(&[0x0f, 0x01, 0xd9]);
        stub[8] = 0xc3;
    }

    // `iret` is not available through the page: `ud2`.
    let iret = HYPERCALL_IRET * HYPERCALL_STUB_SIZE;
    if let Some(stub) = page.get_mut(iret..iret + 2) {
        stub.copy_from_slice(&[0x0f, 0x0b]);
    }
}

/// EFER bits a guest may set, given `CPUID.80000001H:EDX` of its policy.
fn efer_allowed(ext_edx: u32) -> EferFlags {
    let mut allowed = EferFlags::empty();
    allowed.set(EferFlags::SYSTEM_CALL_EXTENSIONS, ext_edx.get_bit(11));
    allowed.set(EferFlags::NO_EXECUTE_ENABLE, ext_edx.get_bit(20));
    allowed.set(EferFlags::FAST_FXSAVE_FXRSTOR, ext_edx.get_bit(25));
    allowed.set(EferFlags::LONG_MODE_ENABLE, ext_edx.get_bit(29));
    allowed
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Retires an emulated instruction of `len` bytes.
    pub(super) fn update_guest_eip(&mut self, domain: &mut impl DomainControl, len: u8) {
        if len == 0 || len > MAX_INSTRUCTION_LEN {
            error!("[SVM] bad instruction length {}", len);
            domain.crash_domain();
            return;
        }

        let vmcb = self.vmcb();
        vmcb.state
            .rip
            .set(vmcb.state.rip.get().wrapping_add(len as u64));
        let mut rflags = RFlags::from_bits_retain(vmcb.state.rflags.get());
        rflags.remove(RFlags::RESUME_FLAG);
        vmcb.state.rflags.set(rflags.bits());
        vmcb.control.set_interrupt_shadow(false);

        if rflags.contains(RFlags::TRAP_FLAG) {
            self.inject_exception(domain, vector::DB, None, 0);
        }
    }

    /// Guest view of the time-stamp counter.
    pub fn guest_time(&self) -> u64 {
        H::rdtsc().wrapping_add(self.vmcb().control.tsc_offset.get())
    }

    pub fn set_guest_time(&mut self, tsc: u64) {
        self.set_tsc_offset(tsc.wrapping_sub(H::rdtsc()));
    }

    pub fn set_tsc_offset(&mut self, offset: u64) {
        self.vmcb().control.tsc_offset.set(offset);
    }

    /// `WBINVD`/`INVD` only matter if a device could observe the caches.
    pub fn wbinvd_intercept(&mut self, domain: &impl DomainControl) {
        if domain.has_passthrough_devices() {
            H::wbinvd_all_cpus();
        }
    }

    pub fn invlpg_intercept(&mut self, paging: &mut impl GuestPaging, va: u64) {
        trace!("[SVM] invlpg {:#x}", va);
        paging.invlpg(va);
        self.invalidate_asid();
    }

    /// Computes the CPUID leaf reported to the guest.
    pub fn cpuid_intercept(
        &mut self,
        vmm: &(impl CpuidPolicy + VirtualLapic + DomainControl),
        leaf: u32,
        subleaf: u32,
    ) -> CpuIdResult {
        const SSSE3: usize = 9;
        const SSE4_1: usize = 19;
        const SSE4_2: usize = 20;
        const HTT: usize = 28;

        const EXT_APIC: usize = 9;
        const EXT_PAE: usize = 6;
        const EXT_PSE36: usize = 17;
        // LAHF_LM, CR8_LEGACY, ABM, SSE4A, MISALIGNSSE, 3DNOWPREFETCH.
        const EXT_ECX_ALLOWED: u32 = (1 << 0) | (1 << 4) | (1 << 5) | (1 << 6) | (1 << 7) | (1 << 8);
        // Features shared with leaf 1 plus SYSCALL, MP, NX, MMXEXT, FFXSR and LM.
        const EXT_EDX_ALLOWED: u32 = 0x0183_f3ff
            | (1 << 11)
            | (1 << 19)
            | (1 << 20)
            | (1 << 22)
            | (1 << 25)
            | (1 << 29);

        let mut res = vmm.cpuid(leaf, subleaf);
        match leaf {
            0x1 => {
                // Intel-only instruction set extensions.
                res.ecx.set_bit(SSSE3, false);
                res.ecx.set_bit(SSE4_1, false);
                res.ecx.set_bit(SSE4_2, false);
            }
            0x8000_0001 => {
                if vmm.hw_disabled() {
                    res.edx.set_bit(EXT_APIC, false);
                }
                if !vmm.pae_enabled() {
                    res.edx.set_bit(EXT_PAE, false);
                }
                res.edx.set_bit(EXT_PSE36, false);
                res.ecx &= EXT_ECX_ALLOWED;
                res.edx &= EXT_EDX_ALLOWED;
            }
            0x8000_0007 | 0x8000_000a => {
                // Power management and SVM are not exposed.
                res = CpuIdResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                };
            }
            0x8000_0008 => {
                if !vmm.cpuid(0x1, 0).edx.get_bit(HTT) {
                    res.ecx &= 0xffff_ff00;
                }
            }
            _ => {}
        }

        trace!(
            "[SVM] cpuid {:#x}: {:#x} {:#x} {:#x} {:#x}",
            leaf, res.eax, res.ebx, res.ecx, res.edx
        );
        res
    }

    /// Emulates `RDMSR` with the MSR index in `ECX`.
    pub fn msr_read_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult {
        let msr = self.guest_regs.ecx();
        let value = match Msr::try_from(msr) {
            Ok(Msr::IA32_TSC) => self.guest_time(),
            Ok(Msr::IA32_APIC_BASE) => vmm.apic_base(),
            Ok(Msr::IA32_EFER) => self.state.guest_efer,
            Ok(m) if m.is_mc4_threshold() => MC4_MISC_LOCKED,
            Ok(Msr::IA32_EBC_FREQUENCY_ID) => 0,
            Ok(Msr::VM_HSAVE_PA) => return self.msr_gp(vmm, msr),
            Ok(m) if m.is_mc_status() => 0,
            Ok(Msr::IA32_DEBUGCTL) => self.vmcb().state.dbgctl.get(),
            Ok(Msr::IA32_LASTBRANCH_FROM_IP) => self.vmcb().state.br_from.get(),
            Ok(Msr::IA32_LASTBRANCH_TO_IP) => self.vmcb().state.br_to.get(),
            Ok(Msr::IA32_LASTINT_FROM_IP) => self.vmcb().state.last_excp_from.get(),
            Ok(Msr::IA32_LASTINT_TO_IP) => self.vmcb().state.last_excp_to.get(),
            _ => match vmm
                .rdmsr_hypervisor_regs(msr)
                .or_else(|| H::rdmsr_safe(msr))
            {
                Some(value) => value,
                None => return self.msr_gp(vmm, msr),
            },
        };

        self.guest_regs.set_edx_eax(value);
        trace!("[SVM] rdmsr {:#x} -> {:#x}", msr, value);
        EmulationResult::Okay
    }

    /// Emulates `WRMSR` with the MSR index in `ECX` and the value in
    /// `EDX:EAX`.
    pub fn msr_write_intercept(&mut self, vmm: &mut impl VmmServices) -> EmulationResult {
        let msr = self.guest_regs.ecx();
        let value = self.guest_regs.get_edx_eax();
        trace!("[SVM] wrmsr {:#x} <- {:#x}", msr, value);

        match Msr::try_from(msr) {
            Ok(Msr::IA32_TSC) => {
                self.set_guest_time(value);
                vmm.reset_periodic_timers();
            }
            Ok(Msr::IA32_APIC_BASE) => vmm.set_apic_base(value),
            Ok(Msr::VM_HSAVE_PA) => return self.msr_gp(vmm, msr),
            Ok(Msr::IA32_DEBUGCTL) => {
                self.vmcb().state.dbgctl.set(value);
                if value != 0 && self.features.contains(SvmFeatureFlags::LBRV) {
                    self.enable_lbr_virtualization();
                }
            }
            Ok(Msr::IA32_LASTBRANCH_FROM_IP) => self.vmcb().state.br_from.set(value),
            Ok(Msr::IA32_LASTBRANCH_TO_IP) => self.vmcb().state.br_to.set(value),
            Ok(Msr::IA32_LASTINT_FROM_IP) => self.vmcb().state.last_excp_from.set(value),
            Ok(Msr::IA32_LASTINT_TO_IP) => self.vmcb().state.last_excp_to.set(value),
            _ => match self.long_mode_msr_write(vmm, msr, value) {
                LongModeWrite::Done => {}
                LongModeWrite::Unhandled => {
                    vmm.wrmsr_hypervisor_regs(msr, value);
                }
                LongModeWrite::Exception => return EmulationResult::Exception,
            },
        }
        EmulationResult::Okay
    }

    /// Lets the guest drive the branch record MSRs directly.
    fn enable_lbr_virtualization(&mut self) {
        self.vmcb()
            .control
            .virt_ext
            .modify(VirtExt::LBR_VIRTUALIZATION::SET);
        for msr in [
            Msr::IA32_DEBUGCTL,
            Msr::IA32_LASTBRANCH_FROM_IP,
            Msr::IA32_LASTBRANCH_TO_IP,
            Msr::IA32_LASTINT_FROM_IP,
            Msr::IA32_LASTINT_TO_IP,
        ] {
            self.msrpm.set_read_intercept(msr as u32, false);
            self.msrpm.set_write_intercept(msr as u32, false);
        }
    }

    /// MSR writes shared with the other hardware backends.
    fn long_mode_msr_write(
        &mut self,
        vmm: &mut impl VmmServices,
        msr: u32,
        value: u64,
    ) -> LongModeWrite {
        match Msr::try_from(msr) {
            Ok(Msr::IA32_EFER) => match self.set_efer(vmm, value) {
                EmulationResult::Okay => LongModeWrite::Done,
                EmulationResult::Exception => LongModeWrite::Exception,
            },
            // Reported as locked, so writes are dropped like on hardware.
            Ok(m) if m.is_mc4_threshold() => LongModeWrite::Done,
            _ => LongModeWrite::Unhandled,
        }
    }

    /// Guest write to `EFER`.
    pub fn set_efer(
        &mut self,
        domain: &mut (impl DomainControl + CpuidPolicy),
        value: u64,
    ) -> EmulationResult {
        let allowed = efer_allowed(domain.cpuid(0x8000_0001, 0).edx);
        let value = value & !EferFlags::LONG_MODE_ACTIVE.bits();

        if value & !allowed.bits() != 0 {
            warn!("[SVM] guest sets reserved EFER bits: {:#x}", value);
            self.inject_exception(domain, vector::GP, Some(0), 0);
            return EmulationResult::Exception;
        }

        let old = self.state.guest_efer;
        let paging = Cr0Flags::from_bits_truncate(self.state.guest_cr[0]).contains(Cr0Flags::PAGING);
        if (value ^ old) & EferFlags::LONG_MODE_ENABLE.bits() != 0 && paging {
            warn!("[SVM] guest changes EFER.LME with paging enabled");
            self.inject_exception(domain, vector::GP, Some(0), 0);
            return EmulationResult::Exception;
        }

        self.state.guest_efer = value | (old & EferFlags::LONG_MODE_ACTIVE.bits());
        self.update_guest_efer();
        EmulationResult::Okay
    }

    fn msr_gp(&mut self, domain: &mut impl DomainControl, msr: u32) -> EmulationResult {
        debug!("[SVM] #GP on access to MSR {:#x}", msr);
        self.inject_exception(domain, vector::GP, Some(0), 0);
        EmulationResult::Exception
    }
}
