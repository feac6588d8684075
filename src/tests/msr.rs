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

use tock_registers::interfaces::{Readable, Writeable};

use super::Fixture;
use crate::msr::Msr;
use crate::svm::PendingEvent;
use crate::svm::definitions::vector;
use crate::svm::vmcb::VirtExt;
use crate::test_utils::mock::hw::{self, MockExit};

const GUEST_RIP: u64 = 0x2000;

fn rdmsr(f: &mut Fixture, msr: u32) {
    f.vcpu.set_rip(GUEST_RIP);
    f.vcpu.regs_mut().rcx = msr as u64;
    f.run(MockExit {
        code: 0x7c,
        info1: 0,
        ..Default::default()
    });
}

fn wrmsr(f: &mut Fixture, msr: u32, value: u64) {
    f.vcpu.set_rip(GUEST_RIP);
    let regs = f.vcpu.regs_mut();
    regs.rcx = msr as u64;
    regs.set_edx_eax(value);
    f.run(MockExit {
        code: 0x7c,
        info1: 1,
        ..Default::default()
    });
}

fn gp(ec: u32) -> PendingEvent {
    PendingEvent::HwException {
        vector: vector::GP,
        error_code: Some(ec),
    }
}

#[test]
fn test_hsave_pa_raises_gp() {
    let mut f = Fixture::new();
    rdmsr(&mut f, Msr::VM_HSAVE_PA as u32);
    assert_eq!(f.vcpu.pending_event(), gp(0));
    assert_eq!(f.vcpu.rip(), GUEST_RIP);

    wrmsr(&mut f, Msr::VM_HSAVE_PA as u32, 0x1000);
    assert_eq!(f.vcpu.pending_event(), gp(0));
    assert_eq!(f.vcpu.rip(), GUEST_RIP);
    // The host value is untouched.
    assert_ne!(hw::with(|hw| hw.msr(Msr::VM_HSAVE_PA as u32)), 0x1000);
}

#[test]
fn test_tsc_write_moves_offset() {
    let mut f = Fixture::new();
    let host_tsc = hw::with(|hw| hw.tsc);

    wrmsr(&mut f, Msr::IA32_TSC as u32, host_tsc + 5000);
    assert_eq!(f.vcpu.vmcb().control.tsc_offset.get(), 5000);
    assert_eq!(f.vmm.timer_resets, 1);
    assert_eq!(f.vcpu.rip(), GUEST_RIP + 2);

    hw::with(|hw| hw.tsc += 10);
    rdmsr(&mut f, Msr::IA32_TSC as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), host_tsc + 5010);
    assert_eq!(f.vcpu.rip(), GUEST_RIP + 2);
}

#[test]
fn test_debugctl_enables_lbr_virtualization() {
    let mut f = Fixture::new();
    wrmsr(&mut f, Msr::IA32_DEBUGCTL as u32, 0);
    assert!(!f.vcpu.vmcb().control.virt_ext.is_set(VirtExt::LBR_VIRTUALIZATION));

    wrmsr(&mut f, Msr::IA32_DEBUGCTL as u32, 1);
    assert!(f.vcpu.vmcb().control.virt_ext.is_set(VirtExt::LBR_VIRTUALIZATION));
    assert_eq!(f.vcpu.vmcb().state.dbgctl.get(), 1);

    f.vcpu.vmcb().state.br_from.set(0xffff_8000_0000_1234);
    rdmsr(&mut f, Msr::IA32_LASTBRANCH_FROM_IP as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0xffff_8000_0000_1234);
}

#[test]
fn test_debugctl_without_lbrv() {
    let mut f = Fixture::new();
    f.vcpu = crate::svm::SvmVcpu::new(&f.vmm, crate::svm::SvmFeatureFlags::NRIPS).unwrap();
    f.vcpu.ctxt_switch_to(&f.cpus).unwrap();
    wrmsr(&mut f, Msr::IA32_DEBUGCTL as u32, 1);
    assert!(!f.vcpu.vmcb().control.virt_ext.is_set(VirtExt::LBR_VIRTUALIZATION));
    assert_eq!(f.vcpu.vmcb().state.dbgctl.get(), 1);
}

#[test]
fn test_machine_check_registers() {
    let mut f = Fixture::new();
    rdmsr(&mut f, Msr::IA32_MC4_MISC as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 1 << 61);

    // Writes to a locked threshold register are dropped.
    wrmsr(&mut f, Msr::F10_MC4_MISC2 as u32, 0x1234);
    assert!(!f.vcpu.event_pending());
    assert!(f.vmm.hypervisor_msr_writes.is_empty());

    f.vcpu.regs_mut().rax = 0xdead;
    rdmsr(&mut f, Msr::IA32_MC2_STATUS as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0);
}

#[test]
fn test_apic_base_goes_to_lapic() {
    let mut f = Fixture::new();
    wrmsr(&mut f, Msr::IA32_APIC_BASE as u32, 0xfee0_0800);
    assert_eq!(f.vmm.apic_base, 0xfee0_0800);

    rdmsr(&mut f, Msr::IA32_APIC_BASE as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0xfee0_0800);
}

#[test]
fn test_unknown_msrs() {
    let mut f = Fixture::new();
    // Hypervisor-defined range first.
    f.vmm.hypervisor_msrs.insert(0x4000_0000, 0x5678);
    rdmsr(&mut f, 0x4000_0000);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0x5678);

    // Then the host value, if the host has the MSR.
    hw::with(|hw| hw.set_msr(0x8b, 0x42));
    rdmsr(&mut f, 0x8b);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0x42);
    assert!(!f.vcpu.event_pending());

    rdmsr(&mut f, 0xc000_dead);
    assert_eq!(f.vcpu.pending_event(), gp(0));

    wrmsr(&mut f, 0x4000_0001, 7);
    assert_eq!(f.vmm.hypervisor_msr_writes, [(0x4000_0001, 7)]);
    assert_eq!(f.vcpu.rip(), GUEST_RIP + 2);
}

#[test]
fn test_efer_writes() {
    let mut f = Fixture::new();
    // SCE | LME | NXE
    wrmsr(&mut f, Msr::IA32_EFER as u32, 0x901);
    assert!(!f.vcpu.event_pending());
    assert_eq!(f.vcpu.virt_state().guest_efer, 0x901);
    // SVME stays on, LME only with LMA.
    assert_eq!(f.vcpu.vmcb().state.efer.get(), 0x1801);

    rdmsr(&mut f, Msr::IA32_EFER as u32);
    assert_eq!(f.vcpu.regs().get_edx_eax(), 0x901);

    // SVME is reserved for the guest.
    wrmsr(&mut f, Msr::IA32_EFER as u32, 0x1000);
    assert_eq!(f.vcpu.pending_event(), gp(0));
    assert_eq!(f.vcpu.virt_state().guest_efer, 0x901);
    assert_eq!(f.vcpu.rip(), GUEST_RIP);
}

#[test]
fn test_efer_lme_change_with_paging_faults() {
    let mut f = Fixture::new();
    let cr0 = f.vcpu.guest_cr(crate::svm::GuestCr::Cr0) | (1 << 31);
    f.vcpu.set_guest_cr(&mut f.vmm, crate::svm::GuestCr::Cr0, cr0);

    wrmsr(&mut f, Msr::IA32_EFER as u32, 0x100);
    assert_eq!(f.vcpu.pending_event(), gp(0));
    assert_eq!(f.vcpu.virt_state().guest_efer, 0);
}

#[test]
fn test_efer_bits_follow_cpuid_policy() {
    let mut f = Fixture::new();
    // 64-bit capable, but without NX.
    f.vmm.cpuid.insert(
        (0x8000_0001, 0),
        raw_cpuid::CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 1 << 29 | 1 << 11,
        },
    );

    wrmsr(&mut f, Msr::IA32_EFER as u32, 0x101);
    assert!(!f.vcpu.event_pending());
    assert_eq!(f.vcpu.virt_state().guest_efer, 0x101);

    wrmsr(&mut f, Msr::IA32_EFER as u32, 0x901);
    assert_eq!(f.vcpu.pending_event(), gp(0));
    assert_eq!(f.vcpu.virt_state().guest_efer, 0x101);
    assert_eq!(f.vcpu.rip(), GUEST_RIP);
}
