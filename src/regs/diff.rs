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

use super::GeneralRegisters;
use alloc::format;
use core::fmt::Debug;

/// The registers an exit handler changed, for tracing.
pub struct GeneralRegistersDiff {
    old: GeneralRegisters,
    new: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const INDEX_RANGE: core::ops::Range<u8> = 0..16;
    const RSP_INDEX: u8 = 4;

    pub fn new(old: GeneralRegisters, new: GeneralRegisters) -> Self {
        GeneralRegistersDiff { old, new }
    }

    /// Returns `true` if all general-purpose registers are unchanged.
    pub fn is_same(&self) -> bool {
        self.old == self.new
    }

    /// Iterates over `(name, old, new)` of every changed register.
    pub fn changes(&self) -> impl Iterator<Item = (&'static str, u64, u64)> + '_ {
        Self::INDEX_RANGE
            .filter(|&i| i != Self::RSP_INDEX)
            .map(|i| {
                (
                    GeneralRegisters::register_name(i),
                    self.old.get_reg_of_index(i),
                    self.new.get_reg_of_index(i),
                )
            })
            .filter(|(_, old, new)| old != new)
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GeneralRegistersDiff");
        for (name, old, new) in self.changes() {
            debug.field(name, &format!("{old:#x} -> {new:#x}"));
        }
        debug.finish()
    }
}
