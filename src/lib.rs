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

#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

pub(crate) mod msr;
#[macro_use]
pub(crate) mod regs;
mod fpu;
mod frame;
mod hal;
mod svm;
mod vmm;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use fpu::{FxsaveArea, GuestFpu};
pub use hal::{HostPhysAddr, HostVirtAddr, MmHal, SvmHal};
pub use regs::{GeneralRegisters, GeneralRegistersDiff};
pub use svm::*;
pub use vmm::{
    AsidAllocator, CpuidPolicy, DomainControl, GuestEmulator, GuestFault, GuestPaging, GuestTime,
    HypercallStatus, Instr, IntAck, IntSource, P2mType, TaskSwitchReason, VirtualLapic,
    VmmServices,
};
