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

use axerrno::AxError;
use tock_registers::interfaces::{Readable, Writeable};

use super::Fixture;
use crate::svm::definitions::vector;
use crate::svm::vmcb::NestedCtl;
use crate::svm::{CpuContext, GuestMode, PendingEvent, SvmVcpu};
use crate::test_utils::mock::{MockHal, MockVmm, hw};

const PG: u64 = 1 << 31;

fn fresh_vcpu(f: &Fixture) -> SvmVcpu<MockHal> {
    SvmVcpu::new(&f.vmm, f.cpus.features()).unwrap()
}

#[test]
fn test_save_restore_round_trip() {
    let mut f = Fixture::new();
    f.run_code(0x60);

    let st = &f.vcpu.vmcb().state;
    st.sysenter_cs.set(0x10);
    st.sysenter_esp.set(0x8000);
    st.sysenter_eip.set(0xc000_1000);
    st.lstar.set(0xffff_8000_0010_0000);
    st.star.set(0x0023_0010_0000_0000);
    st.kernel_gs_base.set(0x1234);
    st.sfmask.set(0x4700);
    f.vcpu.inject_exception(&mut f.vmm, vector::GP, Some(0x18), 0);

    let saves = hw::with(|hw| hw.vmsaves.len());
    let ctxt = f.vcpu.save_ctxt();
    // The hidden state is pulled from the CPU first.
    assert_eq!(hw::with(|hw| hw.vmsaves.len()), saves + 1);

    assert_eq!(ctxt.cr0, 0x11);
    assert_eq!(ctxt.sysenter_eip, 0xc000_1000);
    assert_eq!(ctxt.msr_lstar, 0xffff_8000_0010_0000);
    assert_eq!(ctxt.msr_syscall_mask, 0x4700);
    assert_eq!((ctxt.pending_event, ctxt.error_code), (0x8000_0b0d, 0x18));
    assert_eq!(ctxt.msr_flags, !0);
    assert_eq!(ctxt.tsc, hw::with(|hw| hw.tsc));

    let mut other = fresh_vcpu(&f);
    other.load_ctxt(&mut f.vmm, &ctxt).unwrap();
    assert_eq!(other.save_ctxt(), ctxt);
    assert_eq!(
        other.pending_event(),
        PendingEvent::HwException {
            vector: vector::GP,
            error_code: Some(0x18)
        }
    );

    let vmcb = other.vmcb();
    assert!(vmcb.control.nested_ctl.is_set(NestedCtl::NP_ENABLE));
    assert_eq!(vmcb.control.nested_cr3.get(), f.vmm.p2m_root);
    assert_eq!(vmcb.state.g_pat.get(), 0x0007_0406_0007_0406);
    assert_eq!(vmcb.state.cr3.get(), f.vmm.hw_cr3);
    assert_eq!(f.vmm.crashed, 0);
}

#[test]
fn test_regenerated_events_not_saved() {
    let mut f = Fixture::new();
    f.vcpu.inject_exception(&mut f.vmm, vector::BP, None, 0);
    let ctxt = f.vcpu.save_ctxt();
    assert_eq!((ctxt.pending_event, ctxt.error_code), (0, 0));
}

#[test]
fn test_restore_skips_regenerated_events() {
    let mut f = Fixture::new();
    let mut ctxt = f.vcpu.save_ctxt();
    ctxt.pending_event = PendingEvent::SwInterrupt(0x80).encode().0;

    let mut other = fresh_vcpu(&f);
    other.load_ctxt(&mut f.vmm, &ctxt).unwrap();
    assert!(!other.event_pending());
}

#[test]
fn test_restore_real_mode() {
    let mut f = Fixture::new();
    let ctxt = CpuContext {
        cr0: 0,
        tsc: 42,
        ..Default::default()
    };
    f.vcpu.load_ctxt(&mut f.vmm, &ctxt).unwrap();
    assert_eq!(f.vcpu.guest_mode(), GuestMode::Real);
    // ET is hardwired.
    assert_eq!(f.vcpu.save_ctxt().cr0, 0x10);
    assert_eq!(f.vcpu.guest_time(), 42);
}

#[test]
fn test_restore_rejects_malformed_event() {
    let mut f = Fixture::new();
    let before = f.vcpu.save_ctxt();

    let mut bad = before;
    bad.cr4 = 0x20;
    bad.sysenter_cs = 0x60;
    // Event type 1 is reserved.
    bad.pending_event = 0x8000_0120;

    assert_eq!(f.vcpu.load_ctxt(&mut f.vmm, &bad), Err(AxError::InvalidData));
    assert_eq!(f.vmm.crashed, 1);
    assert_eq!(f.vcpu.save_ctxt(), before);
}

#[test]
fn test_shadow_restore_pins_cr3() {
    let mut f = Fixture::with_vmm(MockVmm::shadow());
    let mut ctxt = f.vcpu.save_ctxt();
    ctxt.cr0 |= PG;
    ctxt.cr3 = 0x3000;

    f.vcpu.load_ctxt(&mut f.vmm, &ctxt).unwrap();
    assert_eq!(f.vmm.pinned_tables, [0x3000]);
    assert_eq!(f.vcpu.virt_state().guest_table, 0x3000);
    assert_eq!(f.vcpu.virt_state().hw_cr3, f.vmm.hw_cr3);
    assert_eq!(f.vcpu.vmcb().state.cr3.get(), f.vmm.hw_cr3);
    // Nested paging stays off.
    assert!(!f.vcpu.vmcb().control.nested_ctl.is_set(NestedCtl::NP_ENABLE));

    ctxt.cr3 = 0x6000;
    f.vcpu.load_ctxt(&mut f.vmm, &ctxt).unwrap();
    assert_eq!(f.vmm.released_tables, [0x3000]);
    assert_eq!(f.vmm.pinned_tables, [0x3000, 0x6000]);
}

#[test]
fn test_shadow_restore_rejects_bad_cr3() {
    let mut f = Fixture::with_vmm(MockVmm::shadow());
    f.vmm.valid_guest_tables = false;
    let before = f.vcpu.save_ctxt();

    let mut bad = before;
    bad.cr0 |= PG;
    bad.cr3 = 0xdead_0000;
    assert_eq!(f.vcpu.load_ctxt(&mut f.vmm, &bad), Err(AxError::InvalidData));
    assert_eq!(f.vmm.crashed, 1);
    assert!(f.vmm.pinned_tables.is_empty());
    assert_eq!(f.vcpu.save_ctxt(), before);

    // Without paging CR3 is not looked at.
    bad.cr0 &= !PG;
    f.vcpu.load_ctxt(&mut f.vmm, &bad).unwrap();
    assert_eq!(f.vmm.crashed, 1);
}
