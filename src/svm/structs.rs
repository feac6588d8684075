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

//! Memory-resident structures consumed by the SVM instructions.
//! https://www.amd.com/content/dam/amd/en/documents/processor-tech-docs/programmer-references/24593.pdf

use axerrno::AxResult;

use crate::frame::{ContiguousPhysFrames, PhysFrame};
use crate::hal::{HostPhysAddr, MmHal};

/// Virtual-Machine Control Block (VMCB)
/// One 4 KiB page per vCPU: [control-area | save-area].
#[derive(Debug)]
pub struct VmcbFrame<H: MmHal> {
    page: PhysFrame<H>,
}

impl<H: MmHal> VmcbFrame<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            page: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.page.start_paddr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.page.as_mut_ptr()
    }
}

// (AMD64 APM Vol.2, Section 15.10)
// The I/O Permissions Map occupies 12 Kbytes of contiguous physical memory:
// one bit per port for 64K ports, plus three bits in the third page.
#[derive(Debug)]
pub struct IOPm<H: MmHal> {
    frames: ContiguousPhysFrames<H>,
}

impl<H: MmHal> IOPm<H> {
    pub fn intercept_all() -> AxResult<Self> {
        let mut frames = ContiguousPhysFrames::<H>::alloc(3)?;
        frames.fill(0xFF);
        Ok(Self { frames })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }
}

// (AMD64 APM Vol.2, Section 15.11)
// The MSR permissions map holds two bits (read, write) per MSR for three
// MSR ranges, packed into two contiguous pages.
#[derive(Debug)]
pub struct MSRPm<H: MmHal> {
    frames: ContiguousPhysFrames<H>,
}

impl<H: MmHal> MSRPm<H> {
    pub fn intercept_all() -> AxResult<Self> {
        let mut frames = ContiguousPhysFrames::alloc(2)?;
        frames.fill(0xFF);
        Ok(Self { frames })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    /// Byte offset and bit of the permission bit of `msr`.
    fn locate(msr: u32, is_write: bool) -> Option<(usize, u8)> {
        let (segment, msr_low) = match msr {
            0..=0x1fff => (0usize, msr),
            0xc000_0000..=0xc000_1fff => (1, msr & 0x1fff),
            0xc001_0000..=0xc001_1fff => (2, msr & 0x1fff),
            _ => return None,
        };
        let byte = segment * 2048 + msr_low as usize / 4;
        let bit = ((msr_low & 0b11) * 2) as u8 + is_write as u8;
        Some((byte, bit))
    }

    pub fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        let Some((byte, bit)) = Self::locate(msr, is_write) else {
            warn!("MSR {:#x} is not covered by the MSR permissions map", msr);
            return;
        };

        unsafe {
            let byte_ptr = self.frames.as_mut_ptr().add(byte);
            let old = core::ptr::read_volatile(byte_ptr);
            let new = if intercept {
                old | (1u8 << bit)
            } else {
                old & !(1u8 << bit)
            };
            core::ptr::write_volatile(byte_ptr, new);
        }
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, false, intercept);
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, true, intercept);
    }

    /// Whether accesses of the given direction to `msr` cause a `#VMEXIT`.
    /// MSRs outside the map always do.
    #[cfg(test)]
    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> bool {
        match Self::locate(msr, is_write) {
            Some((byte, bit)) => {
                let value = unsafe { core::ptr::read_volatile(self.frames.as_mut_ptr().add(byte)) };
                value & (1 << bit) != 0
            }
            None => true,
        }
    }
}
