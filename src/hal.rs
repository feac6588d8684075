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

//! Hardware abstraction layer of the SVM backend.
//!
//! The backend never touches host memory management or privileged
//! instructions directly. Everything goes through [`SvmHal`], whose default
//! methods execute the real instructions, so a host only has to provide the
//! few operations that depend on its own kernel.

use core::arch::asm;

use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::CpuIdResult;
use x86_64::registers::control::{Cr0, Cr0Flags};

use crate::fpu::FxsaveArea;
use crate::regs::GeneralRegisters;
use crate::svm::instructions;

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// Frame allocation and address translation provided by the host kernel.
pub trait MmHal {
    /// Allocates a 4K-sized physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Deallocates a frame returned by [`MmHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Allocates `count` physically contiguous, 4K-aligned frames.
    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr>;
    /// Deallocates frames returned by [`MmHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize);
    /// Converts a host physical address to a host virtual address that can
    /// be dereferenced.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}

/// Per-CPU hardware operations used by the SVM backend.
pub trait SvmHal: Sized {
    /// Memory management of the host.
    type MmHal: MmHal;

    /// Index of the physical CPU the caller runs on.
    fn current_cpu() -> usize;

    /// Reads an MSR, returning `None` instead of faulting if the MSR does not
    /// exist. Requires exception fixup support from the host kernel.
    fn rdmsr_safe(msr: u32) -> Option<u64>;

    /// Writes back and invalidates the caches of every physical CPU.
    fn wbinvd_all_cpus();

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        raw_cpuid::cpuid!(leaf, subleaf)
    }

    fn rdmsr(msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    /// # Safety
    ///
    /// The caller must ensure that the write has no unsafe side effects on
    /// the host.
    unsafe fn wrmsr(msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    fn rdtsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Enters the guest described by the VMCB at `vmcb`, with the general
    /// purpose registers in `regs`, and returns on `#VMEXIT`.
    fn vmrun(vmcb: HostPhysAddr, regs: &mut GeneralRegisters) {
        unsafe { instructions::svm_run(vmcb.as_usize() as u64, regs) }
    }

    /// Stores the hidden processor state (FS, GS, TR, LDTR, syscall MSRs)
    /// into the VMCB at `vmcb`.
    fn vmsave(vmcb: HostPhysAddr) {
        unsafe { instructions::vmsave(vmcb.as_usize() as u64) }
    }

    /// Loads the hidden processor state from the VMCB at `vmcb`.
    fn vmload(vmcb: HostPhysAddr) {
        unsafe { instructions::vmload(vmcb.as_usize() as u64) }
    }

    /// Reads one of the breakpoint address registers `DR0`-`DR3`.
    fn read_debugreg(index: usize) -> u64 {
        let value = unsafe {
            match index {
                0 => x86::debugregs::dr0(),
                1 => x86::debugregs::dr1(),
                2 => x86::debugregs::dr2(),
                _ => x86::debugregs::dr3(),
            }
        };
        value as u64
    }

    /// Writes one of the breakpoint address registers `DR0`-`DR3`.
    fn write_debugreg(index: usize, value: u64) {
        let value = value as usize;
        unsafe {
            match index {
                0 => x86::debugregs::dr0_write(value),
                1 => x86::debugregs::dr1_write(value),
                2 => x86::debugregs::dr2_write(value),
                _ => x86::debugregs::dr3_write(value),
            }
        }
    }

    /// Puts the FPU into its power-on state.
    fn fpu_init() {
        unsafe { asm!("fninit", options(nomem, nostack)) }
    }

    fn fpu_save(area: &mut FxsaveArea) {
        unsafe { core::arch::x86_64::_fxsave64(area.as_mut_ptr()) }
    }

    fn fpu_restore(area: &FxsaveArea) {
        unsafe { core::arch::x86_64::_fxrstor64(area.as_ptr()) }
    }

    /// Clears `CR0.TS` of the host.
    fn clts() {
        unsafe { asm!("clts", options(nomem, nostack)) }
    }

    /// Sets `CR0.TS` of the host.
    fn stts() {
        unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::TASK_SWITCHED)) }
    }
}
