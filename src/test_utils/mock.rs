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

use core::cell::{Cell, RefCell};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::thread_local;
use std::vec::Vec;

use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::CpuIdResult;
use tock_registers::interfaces::{Readable, Writeable};

use crate::fpu::FxsaveArea;
use crate::hal::{HostPhysAddr, HostVirtAddr, MmHal, SvmHal};
use crate::regs::GeneralRegisters;
use crate::svm::vmcb::VmcbStruct;
use crate::svm::{EmulatedCpu, GuestCr, InterruptShadow, Segment, SegmentRegister};
use crate::vmm::{
    AsidAllocator, CpuidPolicy, DomainControl, GuestEmulator, GuestFault, GuestPaging, GuestTime,
    HypercallStatus, Instr, IntAck, P2mType, TaskSwitchReason, VirtualLapic,
};

const PAGE_SIZE: usize = 0x1000;

thread_local! {
    static LIVE_FRAMES: Cell<usize> = const { Cell::new(0) };
    static FAIL_NEXT_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Frames backed by the test process heap. Physical and virtual addresses
/// are identical.
#[derive(Debug)]
pub struct MockMmHal;

impl MockMmHal {
    /// Frames allocated by the current thread and not freed yet.
    pub fn live_frames() -> usize {
        LIVE_FRAMES.with(Cell::get)
    }

    /// Makes the next allocation on this thread fail.
    pub fn fail_next_alloc() {
        FAIL_NEXT_ALLOC.with(|f| f.set(true));
    }

    fn layout(count: usize) -> Layout {
        Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn alloc(count: usize) -> Option<HostPhysAddr> {
        if FAIL_NEXT_ALLOC.with(|f| f.replace(false)) {
            return None;
        }
        let ptr = unsafe { alloc_zeroed(Self::layout(count)) };
        if ptr.is_null() {
            return None;
        }
        LIVE_FRAMES.with(|n| n.set(n.get() + count));
        Some(PhysAddr::from(ptr as usize))
    }

    fn dealloc(paddr: HostPhysAddr, count: usize) {
        unsafe { dealloc(paddr.as_usize() as *mut u8, Self::layout(count)) };
        LIVE_FRAMES.with(|n| n.set(n.get() - count));
    }
}

impl MmHal for MockMmHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        Self::alloc(1)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        Self::dealloc(paddr, 1)
    }

    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr> {
        Self::alloc(count)
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize) {
        Self::dealloc(paddr, count)
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        VirtAddr::from(paddr.as_usize())
    }
}

/// Per-thread model of the physical CPU.
pub mod hw {
    use super::*;
    use crate::svm::SvmFeatureFlags;

    /// `#VMEXIT` the next `VMRUN` reports.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MockExit {
        pub code: u64,
        pub info1: u64,
        pub info2: u64,
        /// Length saved in `next_rip`, 0 if none.
        pub insn_len: u64,
        pub int_info: u32,
        pub int_info_err: u32,
    }

    #[derive(Debug)]
    pub struct MockHw {
        pub cpu: usize,
        pub svm_supported: bool,
        pub features: SvmFeatureFlags,
        /// Overrides of the built-in CPUID leaves.
        pub cpuid: BTreeMap<(u32, u32), CpuIdResult>,
        pub msrs: BTreeMap<u32, u64>,
        pub tsc: u64,
        pub debugregs: [u64; 4],
        pub fpu_inits: usize,
        pub fpu_saves: usize,
        pub fpu_restores: usize,
        /// Host `CR0.TS`.
        pub host_ts: bool,
        pub vmsaves: Vec<HostPhysAddr>,
        pub vmloads: Vec<HostPhysAddr>,
        pub vmruns: usize,
        pub next_exit: Option<MockExit>,
        pub wbinvds: usize,
    }

    impl MockHw {
        fn new() -> Self {
            let mut msrs = BTreeMap::new();
            // SCE | LME | LMA | NXE
            msrs.insert(0xc000_0080, 0xd01);
            Self {
                cpu: 0,
                svm_supported: true,
                features: SvmFeatureFlags::NPT | SvmFeatureFlags::LBRV | SvmFeatureFlags::NRIPS,
                cpuid: BTreeMap::new(),
                msrs,
                tsc: 1_000_000,
                debugregs: [0; 4],
                fpu_inits: 0,
                fpu_saves: 0,
                fpu_restores: 0,
                host_ts: true,
                vmsaves: Vec::new(),
                vmloads: Vec::new(),
                vmruns: 0,
                next_exit: None,
                wbinvds: 0,
            }
        }

        pub fn msr(&self, msr: u32) -> u64 {
            self.msrs.get(&msr).copied().unwrap_or(0)
        }

        pub fn set_msr(&mut self, msr: u32, value: u64) {
            self.msrs.insert(msr, value);
        }
    }

    thread_local! {
        static HW: RefCell<MockHw> = RefCell::new(MockHw::new());
    }

    pub fn reset() {
        HW.with(|hw| *hw.borrow_mut() = MockHw::new());
    }

    pub fn with<R>(f: impl FnOnce(&mut MockHw) -> R) -> R {
        HW.with(|hw| f(&mut hw.borrow_mut()))
    }
}

/// CPU backed by [`hw`].
#[derive(Debug)]
pub struct MockHal;

impl SvmHal for MockHal {
    type MmHal = MockMmHal;

    fn current_cpu() -> usize {
        hw::with(|hw| hw.cpu)
    }

    fn rdmsr_safe(msr: u32) -> Option<u64> {
        hw::with(|hw| hw.msrs.get(&msr).copied())
    }

    fn wbinvd_all_cpus() {
        hw::with(|hw| hw.wbinvds += 1);
    }

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        hw::with(|hw| {
            if let Some(res) = hw.cpuid.get(&(leaf, subleaf)) {
                return *res;
            }
            let mut res = CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            };
            match leaf {
                0x8000_0000 => res.eax = 0x8000_001f,
                0x8000_0001 => res.ecx = (hw.svm_supported as u32) << 2,
                0x8000_000a => res.edx = hw.features.bits(),
                _ => {}
            }
            res
        })
    }

    fn rdmsr(msr: u32) -> u64 {
        hw::with(|hw| hw.msr(msr))
    }

    unsafe fn wrmsr(msr: u32, value: u64) {
        hw::with(|hw| hw.set_msr(msr, value));
    }

    fn rdtsc() -> u64 {
        hw::with(|hw| hw.tsc)
    }

    fn vmrun(vmcb: HostPhysAddr, _regs: &mut GeneralRegisters) {
        let vmcb = unsafe { &*(vmcb.as_usize() as *const VmcbStruct) };
        hw::with(|hw| {
            hw.vmruns += 1;
            let Some(exit) = hw.next_exit.take() else {
                return;
            };
            let ct = &vmcb.control;
            ct.exit_code.set(exit.code);
            ct.exit_info_1.set(exit.info1);
            ct.exit_info_2.set(exit.info2);
            ct.exit_int_info.set(exit.int_info);
            ct.exit_int_info_err.set(exit.int_info_err);
            // The injected event has been delivered.
            ct.event_inj.set(0);
            let next_rip = if exit.insn_len != 0 {
                vmcb.state.rip.get() + exit.insn_len
            } else {
                0
            };
            ct.next_rip.set(next_rip);
        });
    }

    fn vmsave(vmcb: HostPhysAddr) {
        hw::with(|hw| hw.vmsaves.push(vmcb));
    }

    fn vmload(vmcb: HostPhysAddr) {
        hw::with(|hw| hw.vmloads.push(vmcb));
    }

    fn read_debugreg(index: usize) -> u64 {
        hw::with(|hw| hw.debugregs[index])
    }

    fn write_debugreg(index: usize, value: u64) {
        hw::with(|hw| hw.debugregs[index] = value);
    }

    fn fpu_init() {
        hw::with(|hw| hw.fpu_inits += 1);
    }

    fn fpu_save(_area: &mut FxsaveArea) {
        hw::with(|hw| hw.fpu_saves += 1);
    }

    fn fpu_restore(_area: &FxsaveArea) {
        hw::with(|hw| hw.fpu_restores += 1);
    }

    fn clts() {
        hw::with(|hw| hw.host_ts = false);
    }

    fn stts() {
        hw::with(|hw| hw.host_ts = true);
    }
}

/// Generic hypervisor that records every call.
#[derive(Debug)]
pub struct MockVmm {
    pub tpr: u32,
    pub apic_base: u64,
    pub apic_hw_disabled: bool,
    pub pending_irq: Option<IntAck>,

    pub fix_page_faults: bool,
    pub page_faults: Vec<(u64, u32)>,
    /// Returned by `update_paging_modes`.
    pub hw_cr3: u64,
    pub paging_mode_updates: usize,
    pub valid_guest_tables: bool,
    pub pinned_tables: Vec<u64>,
    pub released_tables: Vec<u64>,
    pub p2m_root: u64,
    pub p2m_types: BTreeMap<u64, P2mType>,
    pub dirty: Vec<u64>,
    pub type_changes: Vec<(u64, P2mType, P2mType)>,
    pub invlpgs: Vec<u64>,

    pub decode_ok: bool,
    pub decoded: Vec<(u64, Vec<Instr>)>,
    pub mmio_ok: bool,
    /// Bytes `handle_mmio` moves `RIP` by.
    pub mmio_len: u64,
    pub mmio_calls: usize,
    /// Control register write performed by the emulated instruction.
    pub mmio_cr_write: Option<(GuestCr, u64)>,
    /// Fault raised instead of completing the instruction.
    pub mmio_fault: Option<GuestFault>,
    pub mmio_shadow: Option<InterruptShadow>,
    /// Segment read by the emulator, recorded in `segment_reads`.
    pub mmio_segment: Option<Segment>,
    pub segment_reads: Vec<SegmentRegister>,
    pub task_switches: Vec<(u16, TaskSwitchReason, Option<u32>)>,

    pub timer_resets: usize,
    pub migrations: Vec<usize>,

    pub crashed: usize,
    pub triple_faults: usize,
    pub hap: bool,
    pub pae: bool,
    pub debugger: bool,
    pub debugger_pauses: usize,
    pub passthrough: bool,
    pub halted: Vec<u64>,
    pub hypercall_status: HypercallStatus,
    pub hypercalls: usize,
    pub invalidate_reqs: usize,

    pub asid_cpus_initialised: Vec<usize>,
    pub generations: BTreeMap<usize, u64>,
    pub next_asid: u32,
    pub asids_assigned: Vec<(usize, u32)>,

    /// CPUID leaves of the generic layer. Missing leaves read as all ones.
    pub cpuid: BTreeMap<(u32, u32), CpuIdResult>,
    pub hypervisor_msrs: BTreeMap<u32, u64>,
    pub hypervisor_msr_writes: Vec<(u32, u64)>,
}

impl MockVmm {
    pub fn new() -> Self {
        Self {
            tpr: 0,
            apic_base: 0xfee0_0900,
            apic_hw_disabled: false,
            pending_irq: None,
            fix_page_faults: false,
            page_faults: Vec::new(),
            hw_cr3: 0x5000,
            paging_mode_updates: 0,
            valid_guest_tables: true,
            pinned_tables: Vec::new(),
            released_tables: Vec::new(),
            p2m_root: 0x7000,
            p2m_types: BTreeMap::new(),
            dirty: Vec::new(),
            type_changes: Vec::new(),
            invlpgs: Vec::new(),
            decode_ok: true,
            decoded: Vec::new(),
            mmio_ok: true,
            mmio_len: 3,
            mmio_calls: 0,
            mmio_cr_write: None,
            mmio_fault: None,
            mmio_shadow: None,
            mmio_segment: None,
            segment_reads: Vec::new(),
            task_switches: Vec::new(),
            timer_resets: 0,
            migrations: Vec::new(),
            crashed: 0,
            triple_faults: 0,
            hap: true,
            pae: true,
            debugger: false,
            debugger_pauses: 0,
            passthrough: false,
            halted: Vec::new(),
            hypercall_status: HypercallStatus::Completed,
            hypercalls: 0,
            invalidate_reqs: 0,
            asid_cpus_initialised: Vec::new(),
            generations: BTreeMap::new(),
            next_asid: 1,
            asids_assigned: Vec::new(),
            cpuid: BTreeMap::new(),
            hypervisor_msrs: BTreeMap::new(),
            hypervisor_msr_writes: Vec::new(),
        }
    }

    /// A domain using shadow paging.
    pub fn shadow() -> Self {
        Self {
            hap: false,
            ..Self::new()
        }
    }
}

impl VirtualLapic for MockVmm {
    fn tpr(&self) -> u32 {
        self.tpr
    }

    fn set_tpr(&mut self, tpr: u32) {
        self.tpr = tpr;
    }

    fn apic_base(&self) -> u64 {
        self.apic_base
    }

    fn set_apic_base(&mut self, value: u64) {
        self.apic_base = value;
    }

    fn hw_disabled(&self) -> bool {
        self.apic_hw_disabled
    }

    fn pending_irq(&self) -> Option<IntAck> {
        self.pending_irq
    }
}

impl GuestPaging for MockVmm {
    fn paging_fault(&mut self, va: u64, error_code: u32, _regs: &GeneralRegisters) -> bool {
        self.page_faults.push((va, error_code));
        self.fix_page_faults
    }

    fn update_paging_modes(&mut self) -> u64 {
        self.paging_mode_updates += 1;
        self.hw_cr3
    }

    fn get_guest_table(&mut self, cr3: u64) -> bool {
        if self.valid_guest_tables {
            self.pinned_tables.push(cr3);
        }
        self.valid_guest_tables
    }

    fn put_guest_table(&mut self, cr3: u64) {
        self.released_tables.push(cr3);
    }

    fn p2m_root(&self) -> u64 {
        self.p2m_root
    }

    fn p2m_type(&self, gfn: u64) -> P2mType {
        self.p2m_types.get(&gfn).copied().unwrap_or(P2mType::Ram)
    }

    fn mark_dirty(&mut self, gfn: u64) {
        self.dirty.push(gfn);
    }

    fn change_type(&mut self, gfn: u64, from: P2mType, to: P2mType) {
        self.type_changes.push((gfn, from, to));
    }

    fn invlpg(&mut self, va: u64) {
        self.invlpgs.push(va);
    }
}

impl GuestEmulator for MockVmm {
    fn instruction_length(&mut self, rip: u64, expected: &[Instr]) -> Result<u8, GuestFault> {
        self.decoded.push((rip, expected.to_vec()));
        if !self.decode_ok {
            return Err(GuestFault::gp(0));
        }
        Ok(expected.first().map_or(0, |instr| instr.opcode().len() as u8))
    }

    fn handle_mmio<H: SvmHal>(&mut self, cpu: &mut EmulatedCpu<'_, H>) -> bool {
        self.mmio_calls += 1;
        if let Some(seg) = self.mmio_segment {
            self.segment_reads.push(cpu.segment(seg));
        }
        if let Some(fault) = self.mmio_fault {
            cpu.raise(fault);
            return true;
        }
        if !self.mmio_ok {
            return false;
        }
        if let Some((cr, value)) = self.mmio_cr_write {
            cpu.write_cr(cr, value);
        }
        if let Some(shadow) = self.mmio_shadow {
            cpu.set_interrupt_shadow(shadow);
        }
        cpu.set_rip(cpu.rip() + self.mmio_len);
        true
    }

    fn task_switch(&mut self, selector: u16, reason: TaskSwitchReason, error_code: Option<u32>) {
        self.task_switches.push((selector, reason, error_code));
    }
}

impl GuestTime for MockVmm {
    fn reset_periodic_timers(&mut self) {
        self.timer_resets += 1;
    }

    fn migrate_timers(&mut self, cpu: usize) {
        self.migrations.push(cpu);
    }
}

impl DomainControl for MockVmm {
    fn crash_domain(&mut self) {
        self.crashed += 1;
    }

    fn triple_fault(&mut self) {
        self.triple_faults += 1;
    }

    fn hap_enabled(&self) -> bool {
        self.hap
    }

    fn pae_enabled(&self) -> bool {
        self.pae
    }

    fn debugger_attached(&self) -> bool {
        self.debugger
    }

    fn pause_for_debugger(&mut self) {
        self.debugger_pauses += 1;
    }

    fn has_passthrough_devices(&self) -> bool {
        self.passthrough
    }

    fn halt(&mut self, rflags: u64) {
        self.halted.push(rflags);
    }

    fn hypercall(&mut self, _regs: &mut GeneralRegisters) -> HypercallStatus {
        self.hypercalls += 1;
        self.hypercall_status
    }

    fn send_invalidate_req(&mut self) {
        self.invalidate_reqs += 1;
    }
}

impl AsidAllocator for MockVmm {
    fn init_cpu(&mut self, cpu: usize) {
        self.asid_cpus_initialised.push(cpu);
        self.generations.insert(cpu, 1);
    }

    fn generation(&self, cpu: usize) -> u64 {
        self.generations.get(&cpu).copied().unwrap_or(1)
    }

    fn assign(&mut self, cpu: usize) -> (u32, u64) {
        let asid = self.next_asid;
        self.next_asid += 1;
        self.asids_assigned.push((cpu, asid));
        (asid, self.generation(cpu))
    }

    fn bump_generation(&mut self, cpu: usize) {
        let next = self.generation(cpu) + 1;
        self.generations.insert(cpu, next);
    }
}

impl CpuidPolicy for MockVmm {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        self.cpuid
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or(CpuIdResult {
                eax: !0,
                ebx: !0,
                ecx: !0,
                edx: !0,
            })
    }

    fn rdmsr_hypervisor_regs(&mut self, msr: u32) -> Option<u64> {
        self.hypervisor_msrs.get(&msr).copied()
    }

    fn wrmsr_hypervisor_regs(&mut self, msr: u32, value: u64) -> bool {
        self.hypervisor_msr_writes.push((msr, value));
        self.hypervisor_msrs.contains_key(&msr)
    }
}
