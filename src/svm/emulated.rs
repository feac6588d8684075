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


//! Access to the vCPU for the generic instruction emulator.

use alloc::vec::Vec;

use tock_registers::interfaces::Readable;

use super::sync::{GuestCr, InterruptShadow, Segment};
use super::vcpu::SvmVcpu;
use super::vmcb::SegmentRegister;
use crate::hal::SvmHal;
use crate::regs::GeneralRegisters;
use crate::vmm::GuestFault;

/// The vCPU as seen by [`GuestEmulator::handle_mmio`].
///
/// Registers, `RIP`, segments and the interrupt shadow are accessed
/// directly. Control register writes and faults need the generic layer, so
/// they are recorded and applied once the emulator returns: control
/// registers first, in order, then the faults through the usual
/// exception-combining rules.
///
/// [`GuestEmulator::handle_mmio`]: crate::vmm::GuestEmulator::handle_mmio
pub struct EmulatedCpu<'a, H: SvmHal> {
    vcpu: &'a mut SvmVcpu<H>,
    cr_writes: Vec<(GuestCr, u64)>,
    faults: Vec<GuestFault>,
}

impl<'a, H: SvmHal> EmulatedCpu<'a, H> {
    pub(super) fn new(vcpu: &'a mut SvmVcpu<H>) -> Self {
        Self {
            vcpu,
            cr_writes: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn regs(&mut self) -> &mut GeneralRegisters {
        &mut self.vcpu.guest_regs
    }

    pub fn rip(&self) -> u64 {
        self.vcpu.rip()
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.vcpu.set_rip(rip);
    }

    pub fn rflags(&self) -> u64 {
        self.vcpu.vmcb().state.rflags.get()
    }

    pub fn cpl(&self) -> u8 {
        self.vcpu.vmcb().state.cpl.get()
    }

    /// Guest value of `cr`, including writes made during this emulation.
    pub fn guest_cr(&self, cr: GuestCr) -> u64 {
        self.cr_writes
            .iter()
            .rev()
            .find(|(c, _)| *c == cr)
            .map_or_else(|| self.vcpu.guest_cr(cr), |(_, value)| *value)
    }

    pub fn guest_efer(&self) -> u64 {
        self.vcpu.state.guest_efer
    }

    pub fn segment(&mut self, seg: Segment) -> SegmentRegister {
        self.vcpu.get_segment_register(seg)
    }

    pub fn set_segment(&mut self, seg: Segment, reg: &SegmentRegister) {
        self.vcpu.set_segment_register(seg, reg);
    }

    pub fn interrupt_shadow(&self) -> InterruptShadow {
        self.vcpu.interrupt_shadow()
    }

    pub fn set_interrupt_shadow(&mut self, shadow: InterruptShadow) {
        self.vcpu.set_interrupt_shadow(shadow);
    }

    /// `MOV CRn, reg` or `CLTS`/`LMSW` retired by the emulator.
    pub fn write_cr(&mut self, cr: GuestCr, value: u64) {
        self.cr_writes.push((cr, value));
    }

    /// Raises `fault` in the guest instead of retiring the instruction.
    pub fn raise(&mut self, fault: GuestFault) {
        self.faults.push(fault);
    }

    pub(super) fn into_effects(self) -> (Vec<(GuestCr, u64)>, Vec<GuestFault>) {
        (self.cr_writes, self.faults)
    }
}
