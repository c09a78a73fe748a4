/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use crate::compiler::ir::CmpOp;

// Condition-code bytes. setcc is encoded as 0F <SETCC_*> /0, the rel32
// conditional jumps as 0F <JCC_*> cd.
pub const SETCC_E: u8 = 0x94;
pub const SETCC_NE: u8 = 0x95;
pub const SETCC_L: u8 = 0x9C;
pub const SETCC_GE: u8 = 0x9D;
pub const SETCC_LE: u8 = 0x9E;
pub const SETCC_G: u8 = 0x9F;

pub const JCC_E: u8 = 0x84;
pub const JCC_NE: u8 = 0x85;
pub const JCC_L: u8 = 0x8C;
pub const JCC_GE: u8 = 0x8D;
pub const JCC_LE: u8 = 0x8E;
pub const JCC_G: u8 = 0x8F;

/// Canonical comparison materialisation: EQ -> sete, NE -> setne, LT -> setl,
/// LE -> setle, GT -> setg, GE -> setge.
pub fn setcc_for(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => SETCC_E,
        CmpOp::Ne => SETCC_NE,
        CmpOp::Lt => SETCC_L,
        CmpOp::Le => SETCC_LE,
        CmpOp::Gt => SETCC_G,
        CmpOp::Ge => SETCC_GE,
    }
}

pub fn jcc_for(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => JCC_E,
        CmpOp::Ne => JCC_NE,
        CmpOp::Lt => JCC_L,
        CmpOp::Le => JCC_LE,
        CmpOp::Gt => JCC_G,
        CmpOp::Ge => JCC_GE,
    }
}

/// The condition that jumps when `op` does not hold, for the false branch of
/// a conditional jump.
pub fn inverse(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Eq => CmpOp::Ne,
        CmpOp::Ne => CmpOp::Eq,
        CmpOp::Lt => CmpOp::Ge,
        CmpOp::Le => CmpOp::Gt,
        CmpOp::Gt => CmpOp::Le,
        CmpOp::Ge => CmpOp::Lt,
    }
}
