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

//! AMD-V (SVM) backend.

pub(crate) mod definitions;
mod emulate;
mod emulated;
mod event;
mod exit;
pub(crate) mod instructions;
mod percpu;
mod snapshot;
pub(crate) mod structs;
mod switch;
mod sync;
mod vcpu;
pub(crate) mod vmcb;

pub use self::definitions::{SvmExitCode, SvmFeatureFlags, SvmIntercept};
pub use self::emulate::{EmulationResult, init_hypercall_page};
pub use self::emulated::EmulatedCpu;
pub use self::event::{ExceptionCombination, PendingEvent, combine_exceptions};
pub use self::percpu::{SvmCpuTable, SvmPerCpuState, has_hardware_support, probe_features};
pub use self::snapshot::CpuContext;
pub use self::sync::{GuestCr, GuestMode, InterruptShadow, Segment};
pub use self::vcpu::{SvmVcpu, VCpuVirtState, VirtBackend};
pub use self::vmcb::{SegmentRegister, SvmExitInfo};
