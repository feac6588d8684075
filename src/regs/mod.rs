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

mod diff;

pub use diff::GeneralRegistersDiff;

/// General-Purpose Registers for 64-bit x86 architecture.
///
/// `RSP`, `RIP` and `RFLAGS` of the guest live in the VMCB save area and are
/// not part of this structure. The slot of `RSP` is kept so that the register
/// indices match the ModRM encoding.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

macro_rules! define_reg_getter_setters {
    ($($reg:ident),+) => {
        paste::paste! {
            $(
                #[doc = "Returns the lower 32 bits of `" $reg "`."]
                pub const fn [<e $reg>](&self) -> u32 {
                    self.[<r $reg>] as u32
                }

                #[doc = "Writes the lower 32 bits of `" $reg "`, clearing the upper half."]
                pub fn [<set_e $reg>](&mut self, value: u32) {
                    self.[<r $reg>] = value as u64;
                }

                #[doc = "Returns the lower 16 bits of `" $reg "`."]
                pub const fn $reg(&self) -> u16 {
                    self.[<r $reg>] as u16
                }

                #[doc = "Writes the lower 16 bits of `" $reg "`."]
                pub fn [<set_ $reg>](&mut self, value: u16) {
                    self.[<r $reg>] = (self.[<r $reg>] & !0xffff) | value as u64;
                }
            )+
        }
    };
}

macro_rules! define_legacy_byte_getter_setters {
    ($($reg:ident),+) => {
        paste::paste! {
            $(
                pub const fn [<$reg l>](&self) -> u8 {
                    self.[<r $reg x>] as u8
                }

                pub fn [<set_ $reg l>](&mut self, value: u8) {
                    self.[<r $reg x>] = (self.[<r $reg x>] & !0xff) | value as u64;
                }

                pub const fn [<$reg h>](&self) -> u8 {
                    (self.[<r $reg x>] >> 8) as u8
                }

                pub fn [<set_ $reg h>](&mut self, value: u8) {
                    self.[<r $reg x>] = (self.[<r $reg x>] & !0xff00) | ((value as u64) << 8);
                }
            )+
        }
    };
}

macro_rules! define_extended_getter_setters {
    ($($num:literal),+) => {
        paste::paste! {
            $(
                pub const fn [<r $num d>](&self) -> u32 {
                    self.[<r $num>] as u32
                }

                pub fn [<set_r $num d>](&mut self, value: u32) {
                    self.[<r $num>] = value as u64;
                }

                pub const fn [<r $num w>](&self) -> u16 {
                    self.[<r $num>] as u16
                }

                pub const fn [<r $num b>](&self) -> u8 {
                    self.[<r $num>] as u8
                }
            )+
        }
    };
}

impl GeneralRegisters {
    /// Names of the registers, indexed by their ModRM number.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with the given index.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the general-purpose register of the given index.
    ///
    /// Index 4 (`RSP`) is not stored here and is rejected.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Sets the value of the general-purpose register of the given index.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// `EDX:EAX` as a single 64-bit value, as consumed by `WRMSR`.
    pub fn get_edx_eax(&self) -> u64 {
        ((self.edx() as u64) << 32) | self.eax() as u64
    }

    /// Splits `value` into `EDX:EAX`, as produced by `RDMSR`.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.set_eax(value as u32);
        self.set_edx((value >> 32) as u32);
    }

    define_reg_getter_setters!(ax, cx, dx, bx, bp, si, di);
    define_legacy_byte_getter_setters!(a, b, c, d);
    define_extended_getter_setters!(8, 9, 10, 11, 12, 13, 14, 15);
}
