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

//! Interfaces of the generic hypervisor consumed by the SVM backend.
//!
//! The backend does not own the virtual interrupt controller, the memory
//! virtualization layer or the instruction emulator. Each operation that
//! needs them receives a `&mut impl VmmServices` for its duration.

use raw_cpuid::CpuIdResult;

use crate::hal::SvmHal;
use crate::regs::GeneralRegisters;
use crate::svm::EmulatedCpu;
use crate::svm::definitions::vector;

/// Origin of a pending interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSource {
    Pic,
    Lapic,
    Nmi,
}

/// An interrupt the virtual interrupt controller wants to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntAck {
    pub source: IntSource,
    pub vector: u8,
}

/// The virtual local APIC of the vCPU.
pub trait VirtualLapic {
    /// Current value of the task-priority register.
    fn tpr(&self) -> u32;
    fn set_tpr(&mut self, tpr: u32);
    /// Value of the `IA32_APIC_BASE` MSR.
    fn apic_base(&self) -> u64;
    fn set_apic_base(&mut self, value: u64);
    /// The APIC is globally disabled through `IA32_APIC_BASE`.
    fn hw_disabled(&self) -> bool;
    /// Highest-priority interrupt waiting for delivery, if any.
    fn pending_irq(&self) -> Option<IntAck>;
}

/// P2M type of a guest frame, as far as this backend cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mType {
    /// Normal read-write RAM.
    Ram,
    /// RAM write-protected for dirty logging.
    RamLogDirty,
    /// Emulated MMIO, handled by the device model.
    MmioDm,
    /// Passed-through MMIO.
    MmioDirect,
    Invalid,
}

/// Guest memory virtualization.
pub trait GuestPaging {
    /// Tries to resolve a guest page fault in the shadow or nested tables.
    /// Returns `true` if the fault was consumed.
    fn paging_fault(&mut self, va: u64, error_code: u32, regs: &GeneralRegisters) -> bool;
    /// Recomputes the paging mode after a control register change and
    /// returns the page-table root the hardware must use as `CR3`.
    fn update_paging_modes(&mut self) -> u64;
    /// Translates the guest page-table root and takes a reference on it.
    /// Fails if the frame is not ordinary RAM.
    fn get_guest_table(&mut self, cr3: u64) -> bool;
    /// Drops the reference taken by [`GuestPaging::get_guest_table`].
    fn put_guest_table(&mut self, cr3: u64);
    /// Physical address of the host table root used for nested paging.
    fn p2m_root(&self) -> u64;
    fn p2m_type(&self, gfn: u64) -> P2mType;
    fn mark_dirty(&mut self, gfn: u64);
    fn change_type(&mut self, gfn: u64, from: P2mType, to: P2mType);
    /// Invalidates the shadow translation of `va`.
    fn invlpg(&mut self, va: u64);
}

/// Instructions whose length is needed to advance the guest `RIP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Cpuid,
    Hlt,
    Rdmsr,
    Wrmsr,
    Invd,
    Wbinvd,
    Vmmcall,
    Int3,
}

impl Instr {
    /// Encoding without prefixes, for decoders matching guest bytes.
    pub const fn opcode(self) -> &'static [u8] {
        match self {
            Self::Cpuid => &[0x0f, 0xa2],
            Self::Hlt => &[0xf4],
            Self::Rdmsr => &[0x0f, 0x32],
            Self::Wrmsr => &[0x0f, 0x30],
            Self::Invd => &[0x0f, 0x08],
            Self::Wbinvd => &[0x0f, 0x09],
            Self::Vmmcall => &[0x0f, 0x01, 0xd9],
            Self::Int3 => &[0xcc],
        }
    }
}

/// Task switch cause, decoded from the exit information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchReason {
    Iret,
    Jmp,
    CallOrInt,
}

/// An exception the emulator wants raised in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFault {
    pub vector: u8,
    pub error_code: Option<u32>,
    /// Faulting address of a `#PF`.
    pub cr2: u64,
}

impl GuestFault {
    /// `#GP` with the given error code.
    pub const fn gp(error_code: u32) -> Self {
        Self {
            vector: vector::GP,
            error_code: Some(error_code),
            cr2: 0,
        }
    }

    pub const fn page_fault(va: u64, error_code: u32) -> Self {
        Self {
            vector: vector::PF,
            error_code: Some(error_code),
            cr2: va,
        }
    }
}

/// The generic instruction emulator.
pub trait GuestEmulator {
    /// Decodes the instruction at `rip`, which must be one of `expected`,
    /// and returns its length including prefixes. Fails with the fault to
    /// raise if the bytes cannot be fetched or do not match.
    fn instruction_length(&mut self, rip: u64, expected: &[Instr]) -> Result<u8, GuestFault>;
    /// Emulates the instruction at the guest `RIP` against the device model
    /// and the vCPU state reachable through `cpu`, moving `RIP` past it on
    /// completion. Returns `false` if the instruction cannot be emulated.
    fn handle_mmio<H: SvmHal>(&mut self, cpu: &mut EmulatedCpu<'_, H>) -> bool;
    fn task_switch(&mut self, selector: u16, reason: TaskSwitchReason, error_code: Option<u32>);
}

/// Time virtualization.
pub trait GuestTime {
    /// Restarts the periodic timers after the guest rewrote its TSC.
    fn reset_periodic_timers(&mut self);
    /// Moves the vCPU's timers to another physical CPU.
    fn migrate_timers(&mut self, cpu: usize);
}

/// Result of the generic hypercall dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallStatus {
    Completed,
    /// The call was preempted and will be retried on the next entry.
    Preempted,
    /// Completed, and the device model must drop its mapping caches.
    Invalidate,
}

/// Domain-wide state and actions.
pub trait DomainControl {
    /// Marks the whole domain as crashed.
    fn crash_domain(&mut self);
    /// Handles a guest triple fault.
    fn triple_fault(&mut self);
    /// The domain uses nested paging.
    fn hap_enabled(&self) -> bool;
    /// The domain exposes PAE to the guest.
    fn pae_enabled(&self) -> bool;
    fn debugger_attached(&self) -> bool;
    fn pause_for_debugger(&mut self);
    /// Devices are passed through, so cache flushes must be honoured.
    fn has_passthrough_devices(&self) -> bool;
    /// Blocks the vCPU until an interrupt arrives.
    fn halt(&mut self, rflags: u64);
    fn hypercall(&mut self, regs: &mut GeneralRegisters) -> HypercallStatus;
    fn send_invalidate_req(&mut self);
}

/// Allocation of address space identifiers.
///
/// Each physical CPU hands out ASIDs in generations. When a generation ends
/// every ASID of that CPU becomes stale. Generations start at 1, so 0 is
/// never current.
pub trait AsidAllocator {
    /// Sets up the ASID state of a physical CPU coming online.
    fn init_cpu(&mut self, cpu: usize);
    /// Current generation of `cpu`.
    fn generation(&self, cpu: usize) -> u64;
    /// Hands out a fresh ASID on `cpu` with the generation it belongs to.
    fn assign(&mut self, cpu: usize) -> (u32, u64);
    /// Ends the current generation of `cpu`.
    fn bump_generation(&mut self, cpu: usize);
}

/// CPUID values and hypervisor-owned MSRs reported by the generic layer.
pub trait CpuidPolicy {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;
    /// Reads an MSR of the hypervisor-reserved range.
    fn rdmsr_hypervisor_regs(&mut self, msr: u32) -> Option<u64>;
    /// Writes an MSR of the hypervisor-reserved range. Returns `false` if
    /// the MSR is not one of them.
    fn wrmsr_hypervisor_regs(&mut self, msr: u32, value: u64) -> bool;
}

/// Everything the SVM backend needs from the generic hypervisor.
pub trait VmmServices:
    VirtualLapic + GuestPaging + GuestEmulator + GuestTime + DomainControl + AsidAllocator + CpuidPolicy
{
}

impl<T> VmmServices for T where
    T: VirtualLapic
        + GuestPaging
        + GuestEmulator
        + GuestTime
        + DomainControl
        + AsidAllocator
        + CpuidPolicy
{
}
