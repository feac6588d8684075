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

//! AMD-SVM per-CPU enable/disable logic
//!
//! References (AMD APM v2 *System Programming*), § 15.4 Enabling SVM:
//!  1. check if the CPU supports SVM and the firmware did not lock it off
//!  2. allocate the Host-Save Area and write its address to `VM_HSAVE_PA`
//!  3. set `EFER.SVME` (bit 12)
//!  4. clearing `EFER.SVME` disables SVM again

use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use spin::{Mutex, Once};
use x86_64::registers::control::EferFlags;

use super::definitions::SvmFeatureFlags;
use super::structs::VmcbFrame;
use crate::frame::PhysFrame;
use crate::hal::{HostPhysAddr, SvmHal};
use crate::msr::Msr;
use crate::vmm::AsidAllocator;

/// `VM_CR.SVMDIS`: SVM disabled by firmware.
const VM_CR_SVMDIS: usize = 4;

/// Whether the CPU implements SVM (`CPUID Fn8000_0001_ECX[SVM]`).
pub fn has_hardware_support<H: SvmHal>() -> bool {
    H::cpuid(0x8000_0001, 0).ecx.get_bit(2)
}

/// Reads the optional SVM features of the current CPU.
pub fn probe_features<H: SvmHal>() -> SvmFeatureFlags {
    if H::cpuid(0x8000_0000, 0).eax < 0x8000_000a {
        return SvmFeatureFlags::empty();
    }
    SvmFeatureFlags::from_bits_truncate(H::cpuid(0x8000_000a, 0).edx)
}

/// Per-core state for AMD-SVM.
///
/// (AMD64 APM Vol.2, Section 15.30.4) `VM_HSAVE_PA` holds the physical
/// address of a 4KB block where `VMRUN` saves host state. The root VMCB keeps
/// the host's hidden segment state while a vCPU's VMCB is loaded.
pub struct SvmPerCpuState<H: SvmHal> {
    cpu_id: usize,
    hsave_page: PhysFrame<H::MmHal>,
    root_vmcb: VmcbFrame<H::MmHal>,
}

impl<H: SvmHal> SvmPerCpuState<H> {
    pub fn new(cpu_id: usize) -> AxResult<Self> {
        Ok(Self {
            cpu_id,
            hsave_page: PhysFrame::alloc_zero()?,
            root_vmcb: VmcbFrame::new()?,
        })
    }

    /// Returns true if SVM is enabled on this core (`EFER.SVME == 1`).
    pub fn is_enabled(&self) -> bool {
        EferFlags::from_bits_truncate(H::rdmsr(Msr::IA32_EFER as u32))
            .contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)
    }

    pub fn hardware_enable(&mut self) -> AxResult {
        if !has_hardware_support::<H>() {
            return ax_err!(Unsupported, "CPU does not support AMD-SVM");
        }
        if H::rdmsr(Msr::VM_CR as u32).get_bit(VM_CR_SVMDIS) {
            return ax_err!(Unsupported, "AMD SVM Extension is disabled in BIOS");
        }
        if self.is_enabled() {
            return ax_err!(ResourceBusy, "SVM already enabled");
        }

        let mut efer = EferFlags::from_bits_truncate(H::rdmsr(Msr::IA32_EFER as u32));
        efer.insert(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE);
        let hsave_pa = self.hsave_page.start_paddr().as_usize() as u64;
        unsafe {
            H::wrmsr(Msr::IA32_EFER as u32, efer.bits());
            H::wrmsr(Msr::VM_HSAVE_PA as u32, hsave_pa);
        }

        info!(
            "[SVM] enabled on CPU {} (HSAVE @ {:#x}).",
            self.cpu_id, hsave_pa
        );
        Ok(())
    }

    pub fn hardware_disable(&mut self) -> AxResult {
        if !self.is_enabled() {
            return ax_err!(BadState, "SVM is not enabled");
        }
        let mut efer = EferFlags::from_bits_truncate(H::rdmsr(Msr::IA32_EFER as u32));
        efer.remove(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE);
        unsafe {
            H::wrmsr(Msr::IA32_EFER as u32, efer.bits());
            H::wrmsr(Msr::VM_HSAVE_PA as u32, 0);
        }
        info!("[SVM] disabled on CPU {}.", self.cpu_id);
        Ok(())
    }

    pub fn root_vmcb(&self) -> HostPhysAddr {
        self.root_vmcb.phys_addr()
    }
}

/// Registry of the per-CPU SVM resources, indexed by physical CPU id.
pub struct SvmCpuTable<H: SvmHal, const N: usize> {
    cpus: [Mutex<Option<SvmPerCpuState<H>>>; N],
    features: Once<SvmFeatureFlags>,
}

impl<H: SvmHal, const N: usize> SvmCpuTable<H, N> {
    pub const fn new() -> Self {
        Self {
            cpus: [const { Mutex::new(None) }; N],
            features: Once::new(),
        }
    }

    /// Brings SVM up on `cpu`. The boot CPU also records the SVM feature
    /// flags shared by all CPUs.
    pub fn cpu_up(&self, cpu: usize, asids: &mut impl AsidAllocator) -> AxResult {
        let Some(slot) = self.cpus.get(cpu) else {
            return ax_err!(InvalidInput, "CPU id out of range");
        };
        let mut slot = slot.lock();
        if slot.is_some() {
            return ax_err!(ResourceBusy, "SVM already enabled");
        }

        let mut state = SvmPerCpuState::<H>::new(cpu)?;
        state.hardware_enable()?;
        asids.init_cpu(cpu);
        *slot = Some(state);

        if cpu == 0 {
            let features = *self.features.call_once(probe_features::<H>);
            info!("[SVM] feature flags: {:?}", features);
        }
        Ok(())
    }

    /// Turns SVM off on `cpu` and releases its resources.
    pub fn cpu_down(&self, cpu: usize) -> AxResult {
        let Some(slot) = self.cpus.get(cpu) else {
            return ax_err!(InvalidInput, "CPU id out of range");
        };
        let mut slot = slot.lock();
        match slot.as_mut() {
            Some(state) => state.hardware_disable()?,
            None => return ax_err!(BadState, "SVM is not enabled"),
        }
        *slot = None;
        Ok(())
    }

    /// Physical address of the root VMCB of `cpu`, if SVM is up there.
    pub fn root_vmcb(&self, cpu: usize) -> Option<HostPhysAddr> {
        self.cpus
            .get(cpu)
            .and_then(|slot| slot.lock().as_ref().map(|state| state.root_vmcb()))
    }

    /// SVM feature flags recorded by the boot CPU.
    pub fn features(&self) -> SvmFeatureFlags {
        self.features.get().copied().unwrap_or(SvmFeatureFlags::empty())
    }
}

impl<H: SvmHal, const N: usize> Default for SvmCpuTable<H, N> {
    fn default() -> Self {
        Self::new()
    }
}
