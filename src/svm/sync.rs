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

//! Lazy synchronization between the VMCB, the hardware and the software view
//! of guest state.
//!
//! Three groups of state are moved only when needed:
//!
//! - FPU: loaded on the first guest use, trapped through `#NM`.
//! - `DR0`-`DR3`: loaded only while a breakpoint is armed in `DR7`.
//! - Hidden segment state of FS, GS, TR and LDTR: only written to the VMCB
//!   by `VMSAVE`, so the VMCB copy is stale while the vCPU is current.

use bitflags::bitflags;
use tock_registers::interfaces::{Readable, Writeable};
use x86_64::registers::control::{Cr0Flags, Cr4Flags, EferFlags};
use x86_64::registers::rflags::RFlags;

use super::definitions::vector;
use super::vcpu::SvmVcpu;
use super::vmcb::{SegmentAttr, SegmentRegister};
use crate::hal::SvmHal;
use crate::vmm::{DomainControl, IntAck, IntSource, VirtualLapic};

/// Bits of `DR7` that arm a breakpoint (L0-L3, G0-G3).
const DR7_ACTIVE_MASK: u64 = 0xff;

bitflags! {
    /// Interrupt shadow as seen by the generic hypervisor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptShadow: u32 {
        /// Shadow after `STI`.
        const STI = 1 << 0;
        /// Shadow after `MOV SS` or `POP SS`.
        const MOV_SS = 1 << 1;
        /// NMIs blocked until the next `IRET`. Not tracked by this backend.
        const NMI = 1 << 2;
    }
}

/// Segment registers by logical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Gdtr,
    Idtr,
    Ldtr,
}

impl Segment {
    /// Segments whose hidden state is only transferred by `VMSAVE`/`VMLOAD`.
    pub const fn is_lazy(self) -> bool {
        matches!(self, Self::Fs | Self::Gs | Self::Tr | Self::Ldtr)
    }
}

/// Control registers shadowed in software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GuestCr {
    Cr0 = 0,
    Cr2 = 2,
    Cr3 = 3,
    Cr4 = 4,
}

/// Execution mode of the guest, by default operand size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuestMode {
    Real = 0,
    Virtual8086 = 1,
    Protected16 = 2,
    Protected32 = 4,
    Long64 = 8,
}

impl<H: SvmHal> SvmVcpu<H> {
    /// Hands the hardware FPU to the guest and stops trapping `#NM`.
    pub(super) fn fpu_enter(&mut self) {
        self.fpu.setup::<H>();
        self.vmcb()
            .control
            .set_exception_intercept(vector::NM, false);
    }

    /// Takes the FPU back from the guest.
    ///
    /// If the guest runs with `CR0.TS` clear, its next FPU instruction must
    /// trap so that the state can be loaded again.
    pub(super) fn fpu_leave(&mut self) {
        self.fpu.save::<H>();

        let guest_cr0 = Cr0Flags::from_bits_truncate(self.state.guest_cr[0]);
        if !guest_cr0.contains(Cr0Flags::TASK_SWITCHED) {
            let vmcb = self.vmcb();
            vmcb.control.set_exception_intercept(vector::NM, true);
            vmcb.state
                .cr0
                .set(vmcb.state.cr0.get() | Cr0Flags::TASK_SWITCHED.bits());
        }
    }

    /// `#NM` intercept: the guest touched the FPU.
    pub fn fpu_dirty_intercept(&mut self) {
        self.fpu_enter();

        let guest_cr0 = Cr0Flags::from_bits_truncate(self.state.guest_cr[0]);
        if !guest_cr0.contains(Cr0Flags::TASK_SWITCHED) {
            let st = &self.vmcb().state;
            st.cr0.set(st.cr0.get() & !Cr0Flags::TASK_SWITCHED.bits());
        }
    }

    /// Moves the guest debug registers from hardware back to the shadow and
    /// re-arms the debug register intercepts.
    pub(super) fn save_dr(&mut self) {
        if !self.state.dr_dirty {
            return;
        }
        self.state.dr_dirty = false;

        let vmcb = self.vmcb.as_vmcb();
        vmcb.control.intercept_dr.set(!0);
        for i in 0..4 {
            self.state.debugreg[i] = H::read_debugreg(i);
        }
        self.state.debugreg[6] = vmcb.state.dr6.get();
        self.state.debugreg[7] = vmcb.state.dr7.get();
    }

    /// Loads the guest debug registers into hardware and lets the guest
    /// access them directly.
    pub(super) fn restore_debug_registers(&mut self) {
        if self.state.dr_dirty {
            return;
        }
        self.state.dr_dirty = true;

        let vmcb = self.vmcb();
        vmcb.control.intercept_dr.set(0);
        for i in 0..4 {
            H::write_debugreg(i, self.state.debugreg[i]);
        }
        vmcb.state.dr6.set(self.state.debugreg[6]);
        vmcb.state.dr7.set(self.state.debugreg[7]);
    }

    /// `DR7` itself travels with the VMCB. The other debug registers only
    /// matter while a breakpoint is armed.
    pub(super) fn restore_dr(&mut self) {
        if self.state.debugreg[7] & DR7_ACTIVE_MASK != 0 {
            self.restore_debug_registers();
        }
    }

    /// Writes the hidden segment state of the running guest into the VMCB.
    pub(super) fn sync_vmcb(&mut self) {
        if self.vmcb_in_sync {
            return;
        }
        self.vmcb_in_sync = true;
        H::vmsave(self.vmcb.phys_addr());
    }

    pub fn get_segment_register(&mut self, seg: Segment) -> SegmentRegister {
        if seg.is_lazy() {
            self.sync_vmcb();
        }

        let st = &self.vmcb().state;
        match seg {
            Segment::Cs => st.cs.load(),
            Segment::Ds => st.ds.load(),
            Segment::Es => st.es.load(),
            Segment::Fs => st.fs.load(),
            Segment::Gs => st.gs.load(),
            Segment::Ss => {
                // The VMCB keeps the authoritative privilege level in CPL.
                let mut reg = st.ss.load();
                reg.set_dpl(st.cpl.get());
                reg
            }
            Segment::Tr => st.tr.load(),
            Segment::Gdtr => st.gdtr.load(),
            Segment::Idtr => st.idtr.load(),
            Segment::Ldtr => st.ldtr.load(),
        }
    }

    pub fn set_segment_register(&mut self, seg: Segment, reg: &SegmentRegister) {
        let sync = seg.is_lazy() && self.current;
        if sync {
            self.sync_vmcb();
        }

        let st = &self.vmcb().state;
        match seg {
            Segment::Cs => st.cs.store(reg),
            Segment::Ds => st.ds.store(reg),
            Segment::Es => st.es.store(reg),
            Segment::Fs => st.fs.store(reg),
            Segment::Gs => st.gs.store(reg),
            Segment::Ss => {
                st.ss.store(reg);
                st.cpl.set(reg.dpl());
            }
            Segment::Tr => st.tr.store(reg),
            Segment::Gdtr => st.gdtr.store(reg),
            Segment::Idtr => st.idtr.store(reg),
            Segment::Ldtr => st.ldtr.store(reg),
        }

        if sync {
            H::vmload(self.vmcb.phys_addr());
        }
    }

    /// The VMCB has a single shadow bit, reported as both kinds.
    pub fn interrupt_shadow(&self) -> InterruptShadow {
        if self.vmcb().control.interrupt_shadow() {
            InterruptShadow::STI | InterruptShadow::MOV_SS
        } else {
            InterruptShadow::empty()
        }
    }

    pub fn set_interrupt_shadow(&mut self, shadow: InterruptShadow) {
        self.vmcb()
            .control
            .set_interrupt_shadow(shadow.intersects(InterruptShadow::STI | InterruptShadow::MOV_SS));
    }

    pub fn guest_mode(&self) -> GuestMode {
        let st = &self.vmcb().state;
        if !Cr0Flags::from_bits_truncate(self.state.guest_cr[0])
            .contains(Cr0Flags::PROTECTED_MODE_ENABLE)
        {
            return GuestMode::Real;
        }
        if RFlags::from_bits_truncate(st.rflags.get()).contains(RFlags::VIRTUAL_8086_MODE) {
            return GuestMode::Virtual8086;
        }
        if self.long_mode_enabled() && st.cs.attr.is_set(SegmentAttr::L) {
            return GuestMode::Long64;
        }
        if st.cs.attr.is_set(SegmentAttr::DB) {
            GuestMode::Protected32
        } else {
            GuestMode::Protected16
        }
    }

    /// Raw value of [`SvmVcpu::guest_mode`]: 0, 1, 2, 4 or 8.
    pub fn guest_x86_mode(&self) -> u8 {
        self.guest_mode() as u8
    }

    pub(super) fn long_mode_enabled(&self) -> bool {
        EferFlags::from_bits_truncate(self.state.guest_efer).contains(EferFlags::LONG_MODE_ACTIVE)
    }

    /// Propagates a change of the software value of `cr` into the VMCB.
    pub fn update_guest_cr(&mut self, domain: &impl DomainControl, cr: GuestCr) {
        match cr {
            GuestCr::Cr0 => {
                let mut hw_cr0_mask = Cr0Flags::empty();
                let guest_cr0 = Cr0Flags::from_bits_truncate(self.state.guest_cr[0]);
                if !guest_cr0.contains(Cr0Flags::TASK_SWITCHED) {
                    if !self.current {
                        hw_cr0_mask |= Cr0Flags::TASK_SWITCHED;
                    } else if Cr0Flags::from_bits_truncate(self.vmcb().state.cr0.get())
                        .contains(Cr0Flags::TASK_SWITCHED)
                    {
                        self.fpu_enter();
                    }
                }

                let mut cr0 = self.state.guest_cr[0] | hw_cr0_mask.bits();
                if !domain.hap_enabled() {
                    // Shadow paging needs paging and write protection on.
                    cr0 |= (Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT).bits();
                }
                self.vmcb().state.cr0.set(cr0);
            }
            GuestCr::Cr2 => self.vmcb().state.cr2.set(self.state.guest_cr[2]),
            GuestCr::Cr3 => {
                self.vmcb().state.cr3.set(self.state.hw_cr3);
                self.invalidate_asid();
            }
            GuestCr::Cr4 => {
                let mut cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::MACHINE_CHECK_EXCEPTION;
                if domain.hap_enabled() {
                    cr4.remove(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION);
                }
                self.vmcb()
                    .state
                    .cr4
                    .set(cr4.bits() | self.state.guest_cr[4]);
            }
        }
    }

    /// Derives the hardware `EFER` from the guest value. `SVME` must stay
    /// set, and `LME` only takes effect together with `LMA`.
    pub fn update_guest_efer(&mut self) {
        let mut efer = EferFlags::from_bits_retain(self.state.guest_efer);
        efer.insert(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE);
        efer.remove(EferFlags::LONG_MODE_ENABLE);
        if efer.contains(EferFlags::LONG_MODE_ACTIVE) {
            efer.insert(EferFlags::LONG_MODE_ENABLE);
        }
        self.vmcb().state.efer.set(efer.bits());
    }

    /// Forces a fresh ASID on the next `VMRUN`.
    pub(super) fn invalidate_asid(&mut self) {
        self.state.asid_generation = 0;
    }

    /// Whether delivery of `ack` is currently held back by the guest.
    pub(super) fn interrupt_blocked(&self, lapic: &impl VirtualLapic, ack: IntAck) -> bool {
        let rflags = RFlags::from_bits_truncate(self.vmcb().state.rflags.get());
        if ack.source != IntSource::Nmi && !rflags.contains(RFlags::INTERRUPT_FLAG) {
            return true;
        }
        if !self.interrupt_shadow().is_empty() {
            return true;
        }
        if ack.source == IntSource::Lapic {
            let tpr = lapic.tpr() & 0xf0;
            if (tpr >> 4) >= (ack.vector as u32 >> 4) {
                return true;
            }
        }
        false
    }
}
