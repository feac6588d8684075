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

use crate::hal::SvmHal;

/// Memory image of the x87/SSE state as written by `FXSAVE`.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxsaveArea([u8; 512]);

impl FxsaveArea {
    pub const fn new() -> Self {
        Self([0; 512])
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

impl Default for FxsaveArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Guest floating-point state that is loaded into hardware on demand.
///
/// While the guest does not own the FPU the host keeps `CR0.TS` set, so the
/// first guest FPU instruction traps with `#NM` and [`GuestFpu::setup`] brings
/// the state in.
pub struct GuestFpu {
    area: FxsaveArea,
    /// The guest state currently lives in the hardware FPU.
    dirtied: bool,
    /// `area` holds a real guest image rather than the power-on state.
    initialised: bool,
}

impl GuestFpu {
    pub const fn new() -> Self {
        Self {
            area: FxsaveArea::new(),
            dirtied: false,
            initialised: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtied
    }

    /// Makes the hardware FPU hold the guest state.
    pub fn setup<H: SvmHal>(&mut self) {
        if self.dirtied {
            return;
        }
        H::clts();
        self.dirtied = true;
        if self.initialised {
            H::fpu_restore(&self.area);
        } else {
            H::fpu_init();
            self.initialised = true;
        }
    }

    /// Writes the hardware FPU back to memory and re-arms `CR0.TS` on the
    /// host. Does nothing if the guest never touched the FPU.
    pub fn save<H: SvmHal>(&mut self) {
        if !self.dirtied {
            return;
        }
        H::fpu_save(&mut self.area);
        H::stts();
        self.dirtied = false;
    }
}

impl Default for GuestFpu {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for GuestFpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestFpu")
            .field("dirtied", &self.dirtied)
            .field("initialised", &self.initialised)
            .finish()
    }
}
