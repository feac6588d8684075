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

//! Wrappers of the AMD-SVM instructions.
//!
//! Reference: AMD64 APM Vol.2, Chapter 15 "Secure Virtual Machine".
//! Unlike the VMX instructions these report no status: an illegal operand
//! raises `#GP` or `#UD` right away.

use core::arch::asm;

use crate::regs::GeneralRegisters;

/// Stores hidden processor state into the VMCB at `vmcb_pa` (`vmsave rax`).
#[inline(always)]
pub unsafe fn vmsave(vmcb_pa: u64) {
    unsafe { asm!("vmsave rax", in("rax") vmcb_pa, options(nostack, preserves_flags)) }
}

/// Loads hidden processor state from the VMCB at `vmcb_pa` (`vmload rax`).
#[inline(always)]
pub unsafe fn vmload(vmcb_pa: u64) {
    unsafe { asm!("vmload rax", in("rax") vmcb_pa, options(nostack, preserves_flags)) }
}

/// Sets the global interrupt flag.
#[inline(always)]
pub unsafe fn stgi() {
    unsafe { asm!("stgi", options(nostack, preserves_flags)) }
}

/// Clears the global interrupt flag.
#[inline(always)]
pub unsafe fn clgi() {
    unsafe { asm!("clgi", options(nostack, preserves_flags)) }
}

/// Runs the guest until the next `#VMEXIT`.
///
/// Guest `RAX`, `RSP`, `RIP` and `RFLAGS` live in the VMCB. The other general
/// purpose registers are swapped with `regs` around `VMRUN`. Host `RAX` and
/// `RSP` are restored by hardware from the host save area.
///
/// # Safety
///
/// `vmcb_pa` must point to a valid VMCB and SVM must be enabled on this CPU.
pub unsafe fn svm_run(vmcb_pa: u64, regs: &mut GeneralRegisters) {
    let regs = regs as *mut GeneralRegisters;
    unsafe {
        clgi();
        asm!(
            "push rbp",
            "push rbx",
            "push rdi",
            "mov rcx, [rdi + 0x08]",
            "mov rdx, [rdi + 0x10]",
            "mov rbx, [rdi + 0x18]",
            "mov rbp, [rdi + 0x28]",
            "mov rsi, [rdi + 0x30]",
            "mov r8,  [rdi + 0x40]",
            "mov r9,  [rdi + 0x48]",
            "mov r10, [rdi + 0x50]",
            "mov r11, [rdi + 0x58]",
            "mov r12, [rdi + 0x60]",
            "mov r13, [rdi + 0x68]",
            "mov r14, [rdi + 0x70]",
            "mov r15, [rdi + 0x78]",
            "mov rdi, [rdi + 0x38]",
            "vmrun rax",
            "push rdi",
            "mov rdi, [rsp + 8]",
            "mov [rdi + 0x08], rcx",
            "mov [rdi + 0x10], rdx",
            "mov [rdi + 0x18], rbx",
            "mov [rdi + 0x28], rbp",
            "mov [rdi + 0x30], rsi",
            "mov [rdi + 0x40], r8",
            "mov [rdi + 0x48], r9",
            "mov [rdi + 0x50], r10",
            "mov [rdi + 0x58], r11",
            "mov [rdi + 0x60], r12",
            "mov [rdi + 0x68], r13",
            "mov [rdi + 0x70], r14",
            "mov [rdi + 0x78], r15",
            "pop qword ptr [rdi + 0x38]",
            "pop rdi",
            "pop rbx",
            "pop rbp",
            inout("rax") vmcb_pa => _,
            inout("rdi") regs => _,
            out("rcx") _,
            out("rdx") _,
            out("rsi") _,
            out("r8") _,
            out("r9") _,
            out("r10") _,
            out("r11") _,
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
        stgi();
    }
}
