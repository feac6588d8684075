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

use numeric_enum_macro::numeric_enum;

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
/// Model-specific registers touched by the SVM backend.
pub enum Msr {
    IA32_TSC = 0x10,
    IA32_APIC_BASE = 0x1b,
    /// Intel-only, may be read by guests migrated from Intel hosts.
    IA32_EBC_FREQUENCY_ID = 0x2c,

    IA32_MCG_CAP = 0x179,
    IA32_MCG_STATUS = 0x17a,

    IA32_DEBUGCTL = 0x1d9,
    IA32_LASTBRANCH_FROM_IP = 0x1db,
    IA32_LASTBRANCH_TO_IP = 0x1dc,
    IA32_LASTINT_FROM_IP = 0x1dd,
    IA32_LASTINT_TO_IP = 0x1de,

    IA32_MC0_STATUS = 0x401,
    IA32_MC1_STATUS = 0x405,
    IA32_MC2_STATUS = 0x409,
    IA32_MC3_STATUS = 0x40d,
    IA32_MC4_STATUS = 0x411,
    /// MC4 threshold register.
    IA32_MC4_MISC = 0x413,
    IA32_MC5_STATUS = 0x415,

    IA32_EFER = 0xc000_0080,
    IA32_STAR = 0xc000_0081,
    IA32_LSTAR = 0xc000_0082,
    IA32_CSTAR = 0xc000_0083,
    IA32_FMASK = 0xc000_0084,
    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,

    /// Family 10h additional MC4 threshold registers.
    F10_MC4_MISC1 = 0xc000_0408,
    F10_MC4_MISC2 = 0xc000_0409,
    F10_MC4_MISC3 = 0xc000_040a,

    VM_CR = 0xc001_0114,
    VM_HSAVE_PA = 0xc001_0117,
}
}

impl Msr {
    /// Whether this is one of the MC4 threshold registers the guest sees as locked.
    pub const fn is_mc4_threshold(self) -> bool {
        matches!(
            self,
            Self::IA32_MC4_MISC | Self::F10_MC4_MISC1 | Self::F10_MC4_MISC2 | Self::F10_MC4_MISC3
        )
    }

    /// Whether this is a machine-check capability/status register.
    pub const fn is_mc_status(self) -> bool {
        matches!(
            self,
            Self::IA32_MCG_CAP
                | Self::IA32_MCG_STATUS
                | Self::IA32_MC0_STATUS
                | Self::IA32_MC1_STATUS
                | Self::IA32_MC2_STATUS
                | Self::IA32_MC3_STATUS
                | Self::IA32_MC4_STATUS
                | Self::IA32_MC5_STATUS
        )
    }
}
