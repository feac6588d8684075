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

use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};

use crate::hal::{HostPhysAddr, MmHal};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: MmHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: MmHal> PhysFrame<H> {
    pub fn alloc() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero() -> AxResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: MmHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("[SVM] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

/// A contiguous block of physical memory frames that will be automatically
/// deallocated when dropped. Used for hardware structures requiring contiguous
/// physical memory (IOPM, MSRPM).
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: MmHal> {
    start_paddr: HostPhysAddr,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: MmHal> ContiguousPhysFrames<H> {
    pub fn alloc(frame_count: usize) -> AxResult<Self> {
        let start_paddr = H::alloc_contiguous_frames(frame_count)
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate contiguous frames failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            frame_count,
            _marker: PhantomData,
        })
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size()) }
    }
}

impl<H: MmHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        H::dealloc_contiguous_frames(self.start_paddr, self.frame_count);
        debug!(
            "[SVM] deallocated ContiguousPhysFrames({:#x}, {} frames)",
            self.start_paddr, self.frame_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::MockMmHal;

    #[test]
    fn test_frame_alloc_zero_and_drop() {
        let before = MockMmHal::live_frames();
        {
            let mut frame = PhysFrame::<MockMmHal>::alloc_zero().unwrap();
            let bytes = unsafe { core::slice::from_raw_parts(frame.as_mut_ptr(), PAGE_SIZE) };
            assert!(bytes.iter().all(|&b| b == 0));
            frame.fill(0xa5);
            assert_eq!(unsafe { *frame.as_mut_ptr().add(PAGE_SIZE - 1) }, 0xa5);
            assert_eq!(MockMmHal::live_frames(), before + 1);
        }
        assert_eq!(MockMmHal::live_frames(), before);
    }

    #[test]
    fn test_contiguous_frames() {
        let mut frames = ContiguousPhysFrames::<MockMmHal>::alloc(3).unwrap();
        frames.fill(0xff);
        assert_eq!(unsafe { *frames.as_mut_ptr().add(3 * PAGE_SIZE - 1) }, 0xff);
        assert_eq!(frames.frame_count(), 3);
        assert_eq!(frames.size(), 3 * PAGE_SIZE);
        assert_eq!(frames.start_paddr().as_usize() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_frame_alloc_failure() {
        MockMmHal::fail_next_alloc();
        let err = PhysFrame::<MockMmHal>::alloc().unwrap_err();
        assert_eq!(err, axerrno::AxError::NoMemory);
    }
}
