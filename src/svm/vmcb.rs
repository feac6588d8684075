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

//! AMD-SVM Virtual-Machine Control Block.
//!
//! A VMCB is a single 4 KiB page split into a 1024-byte control area
//! (offset 0x0) and a 3 KiB state-save area (offset 0x400). Every field sits
//! at a fixed offset, so the hypervisor touches it with plain loads and
//! stores. The layout is expressed with tock-registers, which gives typed
//! bitfield accessors for intercept vectors, event injection and friends.
//!
//! Reference: AMD64 APM Vol.2, Appendix B "Layout of VMCB".

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use super::definitions::{SvmExitCode, SvmIntercept};
use super::structs::VmcbFrame;
use crate::hal::MmHal;

register_bitfields![u32,
    pub InterceptCrRw [
        READ_CR0   0,  READ_CR3   3,  READ_CR4   4,  READ_CR8   8,
        WRITE_CR0 16,  WRITE_CR3 19,  WRITE_CR4 20,  WRITE_CR8 24,
    ],

    pub InterceptExceptions [
        DE 0, DB 1, BP 3, OF 4, UD 6, NM 7, DF 8, GP 13, PF 14, MC 18,
    ],

    pub VmcbCleanBits [
        INTERCEPTS  0,
        IOPM        1,
        ASID        2,
        TPR         3,
        NP          4,
        CRx         5,
        DRx         6,
        DT          7,
        SEG         8,
        CR2         9,
        LBR         10,
        AVIC        11,
        CET         12,
    ],

    /// Virtual interrupt control (offset 0x60).
    pub VIntr [
        V_TPR          OFFSET(0)  NUMBITS(8) [],
        V_IRQ          OFFSET(8)  NUMBITS(1) [],
        VGIF           OFFSET(9)  NUMBITS(1) [],
        V_INTR_PRIO    OFFSET(16) NUMBITS(4) [],
        V_IGN_TPR      OFFSET(20) NUMBITS(1) [],
        V_INTR_MASKING OFFSET(24) NUMBITS(1) [],
        AVIC_ENABLE    OFFSET(31) NUMBITS(1) [],
    ],

    /// Guest interrupt state (offset 0x68).
    pub IntState [
        INTERRUPT_SHADOW     0,
        GUEST_INTERRUPT_MASK 1,
    ],

    /// Layout shared by `EVENTINJ` and `EXITINTINFO`.
    pub EventInj [
        VECTOR   OFFSET(0)  NUMBITS(8) [],
        TYPE     OFFSET(8)  NUMBITS(3) [
            ExternalInterrupt = 0,
            Nmi = 2,
            HardwareException = 3,
            SoftwareInterrupt = 4,
            PrivilegedSoftwareException = 5,
            SoftwareException = 6,
        ],
        EV       OFFSET(11) NUMBITS(1) [],
        RESERVED OFFSET(12) NUMBITS(19) [],
        VALID    OFFSET(31) NUMBITS(1) [],
    ],
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE        0,
        SEV_ENABLE       1,
        SEV_ES_ENABLE    2,
        GMET_ENABLE      3,
        SSCheckEn        4,
        VTE_ENABLE       5,
        RO_GPT_EN        6,
        INVLPGB_TLBSYNC  7,
    ],

    pub VirtExt [
        LBR_VIRTUALIZATION    0,
        VIRTUAL_VMSAVE_VMLOAD 1,
    ],
];

register_bitfields![u8,
    pub VmcbTlbControl [
        CONTROL OFFSET(0) NUMBITS(3) [
            DoNothing                = 0,
            FlushAllOnVmrun          = 1,
            FlushGuestTlb            = 3,
            FlushGuestNonGlobalTlb   = 7,
        ]
    ]
];

register_bitfields![u16,
    /// Segment attributes in the packed VMCB format.
    pub SegmentAttr [
        TYPE OFFSET(0)  NUMBITS(4) [],
        S    OFFSET(4)  NUMBITS(1) [],
        DPL  OFFSET(5)  NUMBITS(2) [],
        P    OFFSET(7)  NUMBITS(1) [],
        AVL  OFFSET(8)  NUMBITS(1) [],
        L    OFFSET(9)  NUMBITS(1) [],
        DB   OFFSET(10) NUMBITS(1) [],
        G    OFFSET(11) NUMBITS(1) [],
    ]
];

register_structs![
    pub VmcbControlArea {
        (0x0000 => pub intercept_cr:         ReadWrite<u32, InterceptCrRw::Register>),
        (0x0004 => pub intercept_dr:         ReadWrite<u32>),
        (0x0008 => pub intercept_exceptions: ReadWrite<u32, InterceptExceptions::Register>),
        (0x000C => pub intercept_vector3:    ReadWrite<u32>),
        (0x0010 => pub intercept_vector4:    ReadWrite<u32>),
        (0x0014 => pub intercept_vector5:    ReadWrite<u32>),
        (0x0018 => _reserved_0018),
        (0x003C => pub pause_filter_thresh:  ReadWrite<u16>),
        (0x003E => pub pause_filter_count:   ReadWrite<u16>),

        (0x0040 => pub iopm_base_pa:         ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:        ReadWrite<u64>),
        (0x0050 => pub tsc_offset:           ReadWrite<u64>),

        (0x0058 => pub guest_asid:           ReadWrite<u32>),
        (0x005C => pub tlb_control:          ReadWrite<u8, VmcbTlbControl::Register>),
        (0x005D => _reserved_005D),

        (0x0060 => pub int_control:          ReadWrite<u32, VIntr::Register>),
        (0x0064 => pub int_vector:           ReadWrite<u32>),
        (0x0068 => pub int_state:            ReadWrite<u32, IntState::Register>),
        (0x006C => _reserved_006C),

        (0x0070 => pub exit_code:            ReadWrite<u64>),
        (0x0078 => pub exit_info_1:          ReadWrite<u64>),
        (0x0080 => pub exit_info_2:          ReadWrite<u64>),
        (0x0088 => pub exit_int_info:        ReadWrite<u32, EventInj::Register>),
        (0x008C => pub exit_int_info_err:    ReadWrite<u32>),

        (0x0090 => pub nested_ctl:           ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => pub avic_vapic_bar:       ReadWrite<u64>),
        (0x00A0 => pub ghcb_gpa:             ReadWrite<u64>),

        (0x00A8 => pub event_inj:            ReadWrite<u32, EventInj::Register>),
        (0x00AC => pub event_inj_err:        ReadWrite<u32>),
        (0x00B0 => pub nested_cr3:           ReadWrite<u64>),
        (0x00B8 => pub virt_ext:             ReadWrite<u64, VirtExt::Register>),

        (0x00C0 => pub clean_bits:           ReadWrite<u32, VmcbCleanBits::Register>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:             ReadWrite<u64>),

        (0x00D0 => pub insn_len:             ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:           [ReadWrite<u8>; 15]),

        (0x00E0 => pub avic_backing_page:    ReadWrite<u64>),
        (0x00E8 => _reserved_00E8),

        (0x00F0 => pub avic_logical_id:      ReadWrite<u64>),
        (0x00F8 => pub avic_physical_id:     ReadWrite<u64>),
        (0x0100 => _reserved_0100),

        (0x0108 => pub vmsa_pa:              ReadWrite<u64>),
        (0x0110 => _reserved_0110),

        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16, SegmentAttr::Register>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),

        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),

        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),

        (0x0148 => pub cr4:    ReadWrite<u64>),
        (0x0150 => pub cr3:    ReadWrite<u64>),
        (0x0158 => pub cr0:    ReadWrite<u64>),
        (0x0160 => pub dr7:    ReadWrite<u64>),
        (0x0168 => pub dr6:    ReadWrite<u64>),
        (0x0170 => pub rflags: ReadWrite<u64>),
        (0x0178 => pub rip:    ReadWrite<u64>),
        (0x0180 => _reserved_0180),

        (0x01D8 => pub rsp:    ReadWrite<u64>),
        (0x01E0 => _reserved_01E0),
        (0x01F8 => pub rax:    ReadWrite<u64>),

        (0x0200 => pub star:           ReadWrite<u64>),
        (0x0208 => pub lstar:          ReadWrite<u64>),
        (0x0210 => pub cstar:          ReadWrite<u64>),
        (0x0218 => pub sfmask:         ReadWrite<u64>),
        (0x0220 => pub kernel_gs_base: ReadWrite<u64>),
        (0x0228 => pub sysenter_cs:    ReadWrite<u64>),
        (0x0230 => pub sysenter_esp:   ReadWrite<u64>),
        (0x0238 => pub sysenter_eip:   ReadWrite<u64>),
        (0x0240 => pub cr2:            ReadWrite<u64>),
        (0x0248 => _reserved_0248),

        (0x0268 => pub g_pat:          ReadWrite<u64>),
        (0x0270 => pub dbgctl:         ReadWrite<u64>),
        (0x0278 => pub br_from:        ReadWrite<u64>),
        (0x0280 => pub br_to:          ReadWrite<u64>),
        (0x0288 => pub last_excp_from: ReadWrite<u64>),
        (0x0290 => pub last_excp_to:   ReadWrite<u64>),
        (0x0298 => _reserved_0298),

        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

impl<H: MmHal> VmcbFrame<H> {
    /// Typed view of the VMCB page.
    ///
    /// The page is owned by the frame and stays mapped for its lifetime.
    /// All fields have interior mutability, so a shared reference suffices
    /// for writes.
    pub fn as_vmcb(&self) -> &VmcbStruct {
        unsafe { &*(self.as_mut_ptr() as *const VmcbStruct) }
    }
}

/// A segment register as seen by the generic hypervisor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    /// Packed VMCB attribute format.
    pub attr: u16,
    pub limit: u32,
    pub base: u64,
}

impl SegmentRegister {
    pub fn dpl(&self) -> u8 {
        ((self.attr >> 5) & 0x3) as u8
    }

    pub fn set_dpl(&mut self, dpl: u8) {
        self.attr = (self.attr & !(0x3 << 5)) | (((dpl & 0x3) as u16) << 5);
    }
}

impl VmcbSegment {
    pub fn load(&self) -> SegmentRegister {
        SegmentRegister {
            selector: self.selector.get(),
            attr: self.attr.get(),
            limit: self.limit.get(),
            base: self.base.get(),
        }
    }

    pub fn store(&self, reg: &SegmentRegister) {
        self.selector.set(reg.selector);
        self.attr.set(reg.attr);
        self.limit.set(reg.limit);
        self.base.set(reg.base);
    }

    pub fn set(&self, selector: u16, base: u64, limit: u32, attr: u16) {
        self.store(&SegmentRegister {
            selector,
            attr,
            limit,
            base,
        });
    }
}

impl VmcbControlArea {
    fn intercept_vector(&self, index: u8) -> &ReadWrite<u32> {
        match index {
            3 => &self.intercept_vector3,
            4 => &self.intercept_vector4,
            _ => &self.intercept_vector5,
        }
    }

    pub fn set_intercept(&self, intc: SvmIntercept, enable: bool) {
        let (index, bit) = intc.position();
        let vector = self.intercept_vector(index);
        let value = vector.get();
        vector.set(if enable {
            value | (1 << bit)
        } else {
            value & !(1 << bit)
        });
    }

    pub fn is_intercepted(&self, intc: SvmIntercept) -> bool {
        let (index, bit) = intc.position();
        self.intercept_vector(index).get() & (1 << bit) != 0
    }

    pub fn set_exception_intercept(&self, vector: u8, enable: bool) {
        let mask = 1u32 << vector;
        let value = self.intercept_exceptions.get();
        self.intercept_exceptions.set(if enable {
            value | mask
        } else {
            value & !mask
        });
    }

    pub fn is_exception_intercepted(&self, vector: u8) -> bool {
        self.intercept_exceptions.get() & (1 << vector) != 0
    }

    pub fn interrupt_shadow(&self) -> bool {
        self.int_state.is_set(IntState::INTERRUPT_SHADOW)
    }

    pub fn set_interrupt_shadow(&self, shadow: bool) {
        self.int_state.modify(if shadow {
            IntState::INTERRUPT_SHADOW::SET
        } else {
            IntState::INTERRUPT_SHADOW::CLEAR
        });
    }

    pub fn vtpr(&self) -> u32 {
        self.int_control.read(VIntr::V_TPR)
    }

    pub fn set_vtpr(&self, tpr: u32) {
        self.int_control.modify(VIntr::V_TPR.val(tpr & 0xff));
    }
}

/// Exit information recorded by hardware on `#VMEXIT`.
#[derive(Debug)]
pub struct SvmExitInfo {
    pub exit_code: core::result::Result<SvmExitCode, u64>,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    /// Raw `EXITINTINFO`: the event being delivered when the exit happened.
    pub exit_int_info: u32,
    pub exit_int_info_err: u32,
    pub guest_rip: u64,
    pub guest_next_rip: u64,
}

impl VmcbStruct {
    pub fn exit_info(&self) -> SvmExitInfo {
        SvmExitInfo {
            exit_code: self.control.exit_code.get().try_into(),
            exit_info_1: self.control.exit_info_1.get(),
            exit_info_2: self.control.exit_info_2.get(),
            exit_int_info: self.control.exit_int_info.get(),
            exit_int_info_err: self.control.exit_int_info_err.get(),
            guest_rip: self.state.rip.get(),
            guest_next_rip: self.control.next_rip.get(),
        }
    }

    /// Logs the fields needed to diagnose an invalid guest state.
    pub fn dump(&self, from: &str) {
        let ct = &self.control;
        let st = &self.state;
        error!("Dumping guest's current state at {}...", from);
        error!(
            "intercepts: cr={:#x} dr={:#x} exceptions={:#x} general=[{:#x} {:#x} {:#x}]",
            ct.intercept_cr.get(),
            ct.intercept_dr.get(),
            ct.intercept_exceptions.get(),
            ct.intercept_vector3.get(),
            ct.intercept_vector4.get(),
            ct.intercept_vector5.get(),
        );
        error!(
            "asid={} tlb_control={:#x} nested_ctl={:#x} nested_cr3={:#x}",
            ct.guest_asid.get(),
            ct.tlb_control.get(),
            ct.nested_ctl.get(),
            ct.nested_cr3.get(),
        );
        error!(
            "int_control={:#x} int_state={:#x} event_inj={:#x}/{:#x} exit_int_info={:#x}/{:#x}",
            ct.int_control.get(),
            ct.int_state.get(),
            ct.event_inj.get(),
            ct.event_inj_err.get(),
            ct.exit_int_info.get(),
            ct.exit_int_info_err.get(),
        );
        error!(
            "cr0={:#x} cr2={:#x} cr3={:#x} cr4={:#x} efer={:#x}",
            st.cr0.get(),
            st.cr2.get(),
            st.cr3.get(),
            st.cr4.get(),
            st.efer.get(),
        );
        error!(
            "rip={:#x} rsp={:#x} rflags={:#x} cpl={} dr6={:#x} dr7={:#x}",
            st.rip.get(),
            st.rsp.get(),
            st.rflags.get(),
            st.cpl.get(),
            st.dr6.get(),
            st.dr7.get(),
        );
        for (name, seg) in [
            ("cs", &st.cs),
            ("ds", &st.ds),
            ("es", &st.es),
            ("fs", &st.fs),
            ("gs", &st.gs),
            ("ss", &st.ss),
            ("gdtr", &st.gdtr),
            ("idtr", &st.idtr),
            ("ldtr", &st.ldtr),
            ("tr", &st.tr),
        ] {
            error!("{}: {:x?}", name, seg.load());
        }
    }
}
