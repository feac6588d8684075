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

//! Event injection through the VMCB `EVENTINJ` slot.
//!
//! The slot holds at most one event. A hardware exception raised while
//! another one is still queued is combined with it following the rules of
//! AMD64 APM Vol.2, Section 8.2.9 "Double Fault".

use tock_registers::LocalRegisterCopy;
use tock_registers::interfaces::{Readable, Writeable};
use x86_64::registers::rflags::RFlags;

use super::definitions::vector;
use super::vcpu::SvmVcpu;
use super::vmcb::EventInj;
use crate::hal::SvmHal;
use crate::vmm::DomainControl;

/// `DR6.BS`: the debug exception was caused by single-stepping.
const DR6_BS: u64 = 1 << 14;

/// An event in the layout shared by `EVENTINJ` and `EXITINTINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEvent {
    None,
    ExternalInterrupt(u8),
    Nmi,
    HwException { vector: u8, error_code: Option<u32> },
    /// `INTn`.
    SwInterrupt(u8),
    /// `ICEBP`.
    PrivSwException(u8),
    /// `INT3` or `INTO`.
    SwException(u8),
}

impl PendingEvent {
    /// Decodes a raw event descriptor and its error code.
    ///
    /// Returns `Err` with the raw value if the descriptor is valid but uses
    /// a reserved event type or has reserved bits set.
    pub fn decode(info: u32, error_code: u32) -> Result<Self, u32> {
        let raw = LocalRegisterCopy::<u32, EventInj::Register>::new(info);
        if !raw.is_set(EventInj::VALID) {
            return Ok(Self::None);
        }
        if raw.read(EventInj::RESERVED) != 0 {
            return Err(info);
        }

        let vector = raw.read(EventInj::VECTOR) as u8;
        Ok(match raw.read(EventInj::TYPE) {
            0 => Self::ExternalInterrupt(vector),
            2 => Self::Nmi,
            3 => Self::HwException {
                vector,
                error_code: raw.is_set(EventInj::EV).then_some(error_code),
            },
            4 => Self::SwInterrupt(vector),
            5 => Self::PrivSwException(vector),
            6 => Self::SwException(vector),
            _ => return Err(info),
        })
    }

    /// Encodes the event as `(descriptor, error code)`.
    pub fn encode(&self) -> (u32, u32) {
        let (ty, vector, error_code) = match *self {
            Self::None => return (0, 0),
            Self::ExternalInterrupt(v) => (0, v, None),
            Self::Nmi => (2, vector::NMI, None),
            Self::HwException { vector, error_code } => (3, vector, error_code),
            Self::SwInterrupt(v) => (4, v, None),
            Self::PrivSwException(v) => (5, v, None),
            Self::SwException(v) => (6, v, None),
        };

        let mut raw = LocalRegisterCopy::<u32, EventInj::Register>::new(0);
        raw.write(
            EventInj::VALID::SET
                + EventInj::TYPE.val(ty)
                + EventInj::VECTOR.val(vector as u32)
                + EventInj::EV.val(error_code.is_some() as u32),
        );
        (raw.get(), error_code.unwrap_or(0))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether the event is lost unless injected again after an intercepted
    /// delivery.
    ///
    /// Software interrupts and exceptions are regenerated by re-executing
    /// the instruction. The CPU reports `INT3` and `INTO` as hardware
    /// exceptions without having moved `RIP` past them, so those are
    /// re-executed as well.
    pub fn needs_reinjection(&self) -> bool {
        match *self {
            Self::ExternalInterrupt(_) | Self::Nmi => true,
            Self::HwException { vector, .. } => vector != vector::BP && vector != vector::OF,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

fn exception_class(vector: u8) -> ExceptionClass {
    match vector {
        vector::DE | vector::TS | vector::NP | vector::SS | vector::GP => {
            ExceptionClass::Contributory
        }
        vector::PF => ExceptionClass::PageFault,
        vector::DF => ExceptionClass::DoubleFault,
        _ => ExceptionClass::Benign,
    }
}

/// Outcome of raising an exception while another one is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCombination {
    /// Deliver this vector in place of both.
    Deliver(u8),
    /// The processor shuts down.
    TripleFault,
}

/// Combines a newly raised exception with the one already pending.
pub fn combine_exceptions(pending: u8, new: u8) -> ExceptionCombination {
    use ExceptionClass::*;
    match (exception_class(pending), exception_class(new)) {
        (DoubleFault, Contributory | PageFault) => ExceptionCombination::TripleFault,
        (Contributory, Contributory) | (PageFault, Contributory | PageFault) => {
            ExceptionCombination::Deliver(vector::DF)
        }
        _ => ExceptionCombination::Deliver(new),
    }
}

impl<H: SvmHal> SvmVcpu<H> {
    /// The event currently queued in `EVENTINJ`.
    pub fn pending_event(&self) -> PendingEvent {
        let ct = &self.vmcb().control;
        PendingEvent::decode(ct.event_inj.get(), ct.event_inj_err.get())
            .unwrap_or(PendingEvent::None)
    }

    pub(super) fn set_pending_event(&self, event: PendingEvent) {
        let (info, error_code) = event.encode();
        let ct = &self.vmcb().control;
        ct.event_inj_err.set(error_code);
        ct.event_inj.set(info);
    }

    /// Whether the injection slot is occupied.
    pub fn event_pending(&self) -> bool {
        self.vmcb().control.event_inj.is_set(EventInj::VALID)
    }

    /// Queues a hardware exception for delivery on the next `VMRUN`.
    ///
    /// `cr2` is only used for page faults.
    pub fn inject_exception(
        &mut self,
        domain: &mut impl DomainControl,
        vector: u8,
        error_code: Option<u32>,
        cr2: u64,
    ) {
        let (mut vector, mut error_code) = (vector, error_code);

        let rflags = RFlags::from_bits_truncate(self.vmcb().state.rflags.get());
        if vector == vector::DB && rflags.contains(RFlags::TRAP_FLAG) {
            self.restore_debug_registers();
            let st = &self.vmcb().state;
            st.dr6.set(st.dr6.get() | DR6_BS);
        }

        if let PendingEvent::HwException {
            vector: pending, ..
        } = self.pending_event()
        {
            match combine_exceptions(pending, vector) {
                ExceptionCombination::TripleFault => {
                    warn!(
                        "[SVM] exception {} raised while delivering a double fault",
                        vector
                    );
                    domain.triple_fault();
                    return;
                }
                ExceptionCombination::Deliver(combined) => {
                    vector = combined;
                    if vector == vector::DF {
                        error_code = Some(0);
                    }
                }
            }
        }

        self.set_pending_event(PendingEvent::HwException { vector, error_code });

        if vector == vector::PF {
            self.vmcb().state.cr2.set(cr2);
            self.state.guest_cr[2] = cr2;
            trace!("[SVM] inject #PF va={:#x} ec={:?}", cr2, error_code);
        } else {
            trace!("[SVM] inject exception {} ec={:?}", vector, error_code);
        }
    }

    /// Puts an event that was being delivered at `#VMEXIT` back into the
    /// injection slot if it would otherwise be lost.
    pub(super) fn requeue_interrupted_event(&self) {
        let ct = &self.vmcb().control;
        let info = ct.exit_int_info.get();
        if !ct.exit_int_info.is_set(EventInj::VALID) {
            return;
        }
        match PendingEvent::decode(info, ct.exit_int_info_err.get()) {
            Ok(event) if event.needs_reinjection() => {
                ct.event_inj_err.set(ct.exit_int_info_err.get());
                ct.event_inj.set(info);
            }
            Ok(_) => {}
            Err(raw) => warn!("[SVM] malformed EXITINTINFO {:#x}", raw),
        }
    }
}
