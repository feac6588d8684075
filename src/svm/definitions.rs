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

//! Architectural constants of AMD-V.
//!
//! Reference: AMD64 APM Vol.2, Appendix C "SVM Intercept Exit Codes".

#![allow(non_camel_case_types)]

use bitflags::bitflags;

/// `#VMEXIT` code reported in the `EXITCODE` field of the VMCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmExitCode {
    /// Read of `CRn`.
    CrRead(u8),
    /// Write of `CRn`.
    CrWrite(u8),
    /// Read of `DRn`.
    DrRead(u8),
    /// Write of `DRn`.
    DrWrite(u8),
    /// Exception with the given vector.
    Exception(u8),
    Intr,
    Nmi,
    Smi,
    Init,
    Vintr,
    Cr0SelWrite,
    IdtrRead,
    GdtrRead,
    LdtrRead,
    TrRead,
    IdtrWrite,
    GdtrWrite,
    LdtrWrite,
    TrWrite,
    Rdtsc,
    Rdpmc,
    Pushf,
    Popf,
    Cpuid,
    Rsm,
    Iret,
    Swint,
    Invd,
    Pause,
    Hlt,
    Invlpg,
    Invlpga,
    Ioio,
    Msr,
    TaskSwitch,
    FerrFreeze,
    Shutdown,
    Vmrun,
    Vmmcall,
    Vmload,
    Vmsave,
    Stgi,
    Clgi,
    Skinit,
    Rdtscp,
    Icebp,
    Wbinvd,
    Monitor,
    Mwait,
    MwaitConditional,
    Xsetbv,
    /// Nested page fault.
    Npf,
    /// `VMRUN` found an illegal guest state.
    Invalid,
}

impl SvmExitCode {
    pub const INVALID: u64 = u64::MAX;
}

impl TryFrom<u64> for SvmExitCode {
    type Error = u64;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        use SvmExitCode::*;
        let low = code as u8;
        Ok(match code {
            0x00..=0x0f => CrRead(low),
            0x10..=0x1f => CrWrite(low - 0x10),
            0x20..=0x2f => DrRead(low - 0x20),
            0x30..=0x3f => DrWrite(low - 0x30),
            0x40..=0x5f => Exception(low - 0x40),
            0x60 => Intr,
            0x61 => Nmi,
            0x62 => Smi,
            0x63 => Init,
            0x64 => Vintr,
            0x65 => Cr0SelWrite,
            0x66 => IdtrRead,
            0x67 => GdtrRead,
            0x68 => LdtrRead,
            0x69 => TrRead,
            0x6a => IdtrWrite,
            0x6b => GdtrWrite,
            0x6c => LdtrWrite,
            0x6d => TrWrite,
            0x6e => Rdtsc,
            0x6f => Rdpmc,
            0x70 => Pushf,
            0x71 => Popf,
            0x72 => Cpuid,
            0x73 => Rsm,
            0x74 => Iret,
            0x75 => Swint,
            0x76 => Invd,
            0x77 => Pause,
            0x78 => Hlt,
            0x79 => Invlpg,
            0x7a => Invlpga,
            0x7b => Ioio,
            0x7c => Msr,
            0x7d => TaskSwitch,
            0x7e => FerrFreeze,
            0x7f => Shutdown,
            0x80 => Vmrun,
            0x81 => Vmmcall,
            0x82 => Vmload,
            0x83 => Vmsave,
            0x84 => Stgi,
            0x85 => Clgi,
            0x86 => Skinit,
            0x87 => Rdtscp,
            0x88 => Icebp,
            0x89 => Wbinvd,
            0x8a => Monitor,
            0x8b => Mwait,
            0x8c => MwaitConditional,
            0x8d => Xsetbv,
            0x400 => Npf,
            Self::INVALID => Invalid,
            _ => return Err(code),
        })
    }
}

/// Exception vectors used by the backend.
pub mod vector {
    pub const DE: u8 = 0;
    pub const DB: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BP: u8 = 3;
    pub const OF: u8 = 4;
    pub const UD: u8 = 6;
    pub const NM: u8 = 7;
    pub const DF: u8 = 8;
    pub const TS: u8 = 10;
    pub const NP: u8 = 11;
    pub const SS: u8 = 12;
    pub const GP: u8 = 13;
    pub const PF: u8 = 14;
    pub const MC: u8 = 18;
}

/// Instruction and event intercepts of control-area vectors 3 to 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmIntercept {
    // Vector 3
    INTR,
    NMI,
    SMI,
    INIT,
    VINTR,
    CR0_SEL_WRITE,
    IDTR_READ,
    GDTR_READ,
    LDTR_READ,
    TR_READ,
    IDTR_WRITE,
    GDTR_WRITE,
    LDTR_WRITE,
    TR_WRITE,
    RDTSC,
    RDPMC,
    PUSHF,
    POPF,
    CPUID,
    RSM,
    IRET,
    SWINT,
    INVD,
    PAUSE,
    HLT,
    INVLPG,
    INVLPGA,
    IOIO_PROT,
    MSR_PROT,
    TASK_SWITCH,
    FERR_FREEZE,
    SHUTDOWN,
    // Vector 4
    VMRUN,
    VMMCALL,
    VMLOAD,
    VMSAVE,
    STGI,
    CLGI,
    SKINIT,
    RDTSCP,
    ICEBP,
    WBINVD,
    MONITOR,
    MWAIT,
    MWAIT_CONDITIONAL,
    XSETBV,
    RDPRU,
    EFER_WRITE_TRAP,
    // Vector 5
    INVLPGB,
    INVLPGB_ILLEGAL,
    INVPCID,
    MCOMMIT,
    TLBSYNC,
}

impl SvmIntercept {
    /// Returns the intercept vector (3, 4 or 5) and the bit inside it.
    pub const fn position(self) -> (u8, u32) {
        use SvmIntercept::*;
        match self {
            INTR => (3, 0),
            NMI => (3, 1),
            SMI => (3, 2),
            INIT => (3, 3),
            VINTR => (3, 4),
            CR0_SEL_WRITE => (3, 5),
            IDTR_READ => (3, 6),
            GDTR_READ => (3, 7),
            LDTR_READ => (3, 8),
            TR_READ => (3, 9),
            IDTR_WRITE => (3, 10),
            GDTR_WRITE => (3, 11),
            LDTR_WRITE => (3, 12),
            TR_WRITE => (3, 13),
            RDTSC => (3, 14),
            RDPMC => (3, 15),
            PUSHF => (3, 16),
            POPF => (3, 17),
            CPUID => (3, 18),
            RSM => (3, 19),
            IRET => (3, 20),
            SWINT => (3, 21),
            INVD => (3, 22),
            PAUSE => (3, 23),
            HLT => (3, 24),
            INVLPG => (3, 25),
            INVLPGA => (3, 26),
            IOIO_PROT => (3, 27),
            MSR_PROT => (3, 28),
            TASK_SWITCH => (3, 29),
            FERR_FREEZE => (3, 30),
            SHUTDOWN => (3, 31),
            VMRUN => (4, 0),
            VMMCALL => (4, 1),
            VMLOAD => (4, 2),
            VMSAVE => (4, 3),
            STGI => (4, 4),
            CLGI => (4, 5),
            SKINIT => (4, 6),
            RDTSCP => (4, 7),
            ICEBP => (4, 8),
            WBINVD => (4, 9),
            MONITOR => (4, 10),
            MWAIT => (4, 11),
            MWAIT_CONDITIONAL => (4, 12),
            XSETBV => (4, 13),
            RDPRU => (4, 14),
            EFER_WRITE_TRAP => (4, 15),
            INVLPGB => (5, 0),
            INVLPGB_ILLEGAL => (5, 1),
            INVPCID => (5, 2),
            MCOMMIT => (5, 3),
            TLBSYNC => (5, 4),
        }
    }
}

bitflags! {
    /// Optional SVM features, as reported by `CPUID Fn8000_000A_EDX`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SvmFeatureFlags: u32 {
        /// Nested paging.
        const NPT = 1 << 0;
        /// LBR virtualization.
        const LBRV = 1 << 1;
        /// SVM lock.
        const SVML = 1 << 2;
        /// `next_rip` is saved on `#VMEXIT`.
        const NRIPS = 1 << 3;
        const TSC_RATE_MSR = 1 << 4;
        const VMCB_CLEAN = 1 << 5;
        const FLUSH_BY_ASID = 1 << 6;
        const DECODE_ASSISTS = 1 << 7;
        const PAUSE_FILTER = 1 << 10;
        const PAUSE_FILTER_THRESHOLD = 1 << 12;
        const AVIC = 1 << 13;
        const V_VMSAVE_VMLOAD = 1 << 15;
        const VGIF = 1 << 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_ranges() {
        assert_eq!(SvmExitCode::try_from(0x03), Ok(SvmExitCode::CrRead(3)));
        assert_eq!(SvmExitCode::try_from(0x18), Ok(SvmExitCode::CrWrite(8)));
        assert_eq!(SvmExitCode::try_from(0x27), Ok(SvmExitCode::DrRead(7)));
        assert_eq!(SvmExitCode::try_from(0x30), Ok(SvmExitCode::DrWrite(0)));
        assert_eq!(SvmExitCode::try_from(0x4e), Ok(SvmExitCode::Exception(14)));
        assert_eq!(SvmExitCode::try_from(0x5f), Ok(SvmExitCode::Exception(31)));
    }

    #[test]
    fn test_exit_code_singles() {
        assert_eq!(SvmExitCode::try_from(0x72), Ok(SvmExitCode::Cpuid));
        assert_eq!(SvmExitCode::try_from(0x7c), Ok(SvmExitCode::Msr));
        assert_eq!(SvmExitCode::try_from(0x8d), Ok(SvmExitCode::Xsetbv));
        assert_eq!(SvmExitCode::try_from(0x400), Ok(SvmExitCode::Npf));
        assert_eq!(SvmExitCode::try_from(u64::MAX), Ok(SvmExitCode::Invalid));
    }

    #[test]
    fn test_exit_code_unknown() {
        assert_eq!(SvmExitCode::try_from(0x8e), Err(0x8e));
        assert_eq!(SvmExitCode::try_from(0x401), Err(0x401));
        assert_eq!(SvmExitCode::try_from(u64::MAX - 1), Err(u64::MAX - 1));
    }

    #[test]
    fn test_intercept_position() {
        assert_eq!(SvmIntercept::CPUID.position(), (3, 18));
        assert_eq!(SvmIntercept::VMMCALL.position(), (4, 1));
        assert_eq!(SvmIntercept::TLBSYNC.position(), (5, 4));
    }
}
