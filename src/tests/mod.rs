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

//! Scenario tests driving a vCPU through mocked `#VMEXIT`s.

mod msr;
mod snapshot;

use crate::svm::{SvmCpuTable, SvmVcpu};
use crate::test_utils::mock::hw::{self, MockExit};
use crate::test_utils::mock::{MockHal, MockVmm};

/// One vCPU loaded on CPU 0 of a two-CPU host.
pub(crate) struct Fixture {
    pub cpus: SvmCpuTable<MockHal, 2>,
    pub vmm: MockVmm,
    pub vcpu: SvmVcpu<MockHal>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_vmm(MockVmm::new())
    }

    pub fn with_vmm(mut vmm: MockVmm) -> Self {
        hw::reset();
        let cpus = SvmCpuTable::new();
        cpus.cpu_up(0, &mut vmm).unwrap();
        let mut vcpu = SvmVcpu::new(&vmm, cpus.features()).unwrap();
        vcpu.ctxt_switch_to(&cpus).unwrap();
        Self { cpus, vmm, vcpu }
    }

    /// Enables SVM on `cpu` and continues on it.
    pub fn bring_up(&mut self, cpu: usize) {
        hw::with(|hw| {
            hw.cpu = cpu;
            // EFER is per CPU, the mock has only one.
            let efer = hw.msr(0xc000_0080) & !(1 << 12);
            hw.set_msr(0xc000_0080, efer);
        });
        self.cpus.cpu_up(cpu, &mut self.vmm).unwrap();
    }

    /// Enters the guest, which exits with `exit`.
    pub fn run(&mut self, exit: MockExit) {
        hw::with(|hw| hw.next_exit = Some(exit));
        self.vcpu.run(&mut self.vmm).unwrap();
    }

    pub fn run_code(&mut self, code: u64) {
        self.run(exit(code));
    }

    /// Physical address of the vCPU's VMCB.
    pub fn vmcb_pa(&self) -> usize {
        self.vcpu.vmcb() as *const _ as usize
    }
}

pub(crate) fn exit(code: u64) -> MockExit {
    MockExit {
        code,
        ..Default::default()
    }
}
