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

//! Append-only machine-code buffer with label definitions and rel32 fixup
//! records, plus the x64 instruction encodings the emitter uses. Fixups stay
//! unresolved (displacement zero) until section addresses exist.

use crate::errors::CompileError;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct FixupRel32 {
    /// Offset of the 4-byte displacement field within the buffer.
    pub at: usize,
    pub target: String,
}

/// Registers the emitter addresses directly. The discriminants are the
/// hardware register numbers; values 8+ need a REX extension bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    R8 = 8,
    R9 = 9,
}

impl Reg {
    fn low3(self) -> u8 {
        (self as u8) & 7
    }

    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodeBuffer {
    pub bytes: Vec<u8>,
    pub label_offsets: HashMap<String, usize>,
    pub rel32_fixups: Vec<FixupRel32>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn emit(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn emit_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn emit_u32(&mut self, x: u32) {
        self.bytes.extend_from_slice(&x.to_le_bytes());
    }

    pub fn emit_u64(&mut self, x: u64) {
        self.bytes.extend_from_slice(&x.to_le_bytes());
    }

    pub fn define_label(&mut self, name: &str) -> Result<(), CompileError> {
        if self
            .label_offsets
            .insert(name.to_string(), self.bytes.len())
            .is_some()
        {
            return Err(CompileError::LayoutError {
                reason: format!("Duplicate label definition: {}", name),
            });
        }
        Ok(())
    }

    fn rel32(&mut self, target: &str) {
        self.rel32_fixups.push(FixupRel32 {
            at: self.bytes.len(),
            target: target.to_string(),
        });
        self.emit_u32(0);
    }

    /// Append another buffer, shifting its label offsets and fixup sites.
    /// Per-procedure buffers merge through this in a fixed order.
    pub fn merge(&mut self, other: CodeBuffer) -> Result<(), CompileError> {
        let base = self.bytes.len();
        self.bytes.extend_from_slice(&other.bytes);
        for (label, offset) in other.label_offsets {
            if self
                .label_offsets
                .insert(label.clone(), base + offset)
                .is_some()
            {
                return Err(CompileError::LayoutError {
                    reason: format!("Duplicate label definition: {}", label),
                });
            }
        }
        for fixup in other.rel32_fixups {
            self.rel32_fixups.push(FixupRel32 {
                at: base + fixup.at,
                target: fixup.target,
            });
        }
        Ok(())
    }

    // ---- prologue / epilogue ----

    pub fn push_rbp(&mut self) {
        self.emit(0x55);
    }

    pub fn pop_rbp(&mut self) {
        self.emit(0x5D);
    }

    pub fn mov_rbp_rsp(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xE5]);
    }

    pub fn mov_rsp_rbp(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xEC]);
    }

    pub fn sub_rsp_imm32(&mut self, n: u32) {
        self.emit_slice(&[0x48, 0x81, 0xEC]);
        self.emit_u32(n);
    }

    pub fn add_rsp_imm32(&mut self, n: u32) {
        self.emit_slice(&[0x48, 0x81, 0xC4]);
        self.emit_u32(n);
    }

    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    // ---- immediates and register moves ----

    pub fn mov_rax_imm64(&mut self, x: u64) {
        self.emit_slice(&[0x48, 0xB8]);
        self.emit_u64(x);
    }

    pub fn mov_rcx_imm64(&mut self, x: u64) {
        self.emit_slice(&[0x48, 0xB9]);
        self.emit_u64(x);
    }

    pub fn mov_rax_rcx(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xC8]);
    }

    pub fn mov_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xD0]);
    }

    pub fn mov_rax_r8(&mut self) {
        self.emit_slice(&[0x4C, 0x89, 0xC0]);
    }

    pub fn mov_rax_r9(&mut self) {
        self.emit_slice(&[0x4C, 0x89, 0xC8]);
    }

    pub fn mov_rcx_rax(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xC1]);
    }

    pub fn mov_rdx_rax(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xC2]);
    }

    pub fn mov_rdx_rcx(&mut self) {
        self.emit_slice(&[0x48, 0x89, 0xCA]);
    }

    pub fn mov_rcx_r8(&mut self) {
        self.emit_slice(&[0x4C, 0x89, 0xC1]);
    }

    pub fn mov_r8_rdx(&mut self) {
        self.emit_slice(&[0x49, 0x89, 0xD0]);
    }

    // ---- rbp-relative value slots ----

    /// mov <reg>, qword ptr [rbp + disp32]
    pub fn mov_reg_from_slot(&mut self, reg: Reg, disp: i32) {
        let rex = if reg.is_extended() { 0x4C } else { 0x48 };
        let modrm = 0x80 | (reg.low3() << 3) | 0x05;
        self.emit_slice(&[rex, 0x8B, modrm]);
        self.emit_u32(disp as u32);
    }

    /// mov qword ptr [rbp + disp32], rax
    pub fn mov_slot_from_rax(&mut self, disp: i32) {
        self.emit_slice(&[0x48, 0x89, 0x85]);
        self.emit_u32(disp as u32);
    }

    // ---- arithmetic on rax/rdx/rcx ----

    pub fn add_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x01, 0xD0]);
    }

    pub fn sub_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x29, 0xD0]);
    }

    pub fn imul_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x0F, 0xAF, 0xC2]);
    }

    pub fn and_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x21, 0xD0]);
    }

    pub fn or_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x09, 0xD0]);
    }

    pub fn xor_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x31, 0xD0]);
    }

    // cqo + idiv rcx: dividend in rax, divisor in rcx; quotient to rax,
    // remainder to rdx.
    pub fn cqo(&mut self) {
        self.emit_slice(&[0x48, 0x99]);
    }

    pub fn idiv_rcx(&mut self) {
        self.emit_slice(&[0x48, 0xF7, 0xF9]);
    }

    // shifts by cl
    pub fn shl_rax_cl(&mut self) {
        self.emit_slice(&[0x48, 0xD3, 0xE0]);
    }

    pub fn shr_rax_cl(&mut self) {
        self.emit_slice(&[0x48, 0xD3, 0xE8]);
    }

    pub fn sar_rax_cl(&mut self) {
        self.emit_slice(&[0x48, 0xD3, 0xF8]);
    }

    pub fn neg_rax(&mut self) {
        self.emit_slice(&[0x48, 0xF7, 0xD8]);
    }

    pub fn not_rax(&mut self) {
        self.emit_slice(&[0x48, 0xF7, 0xD0]);
    }

    pub fn test_rax_rax(&mut self) {
        self.emit_slice(&[0x48, 0x85, 0xC0]);
    }

    pub fn cmp_rax_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x39, 0xD0]);
    }

    /// setcc al; movzx rax, al
    pub fn setcc_rax(&mut self, cc: u8) {
        self.emit_slice(&[0x0F, cc, 0xC0]);
        self.emit_slice(&[0x48, 0x0F, 0xB6, 0xC0]);
    }

    pub fn and_rax_imm8(&mut self, x: u8) {
        self.emit_slice(&[0x48, 0x83, 0xE0, x]);
    }

    pub fn shr_rax_imm8(&mut self, x: u8) {
        self.emit_slice(&[0x48, 0xC1, 0xE8, x]);
    }

    // ---- control flow ----

    pub fn jmp(&mut self, label: &str) {
        self.emit(0xE9);
        self.rel32(label);
    }

    pub fn jcc(&mut self, cc: u8, label: &str) {
        self.emit_slice(&[0x0F, cc]);
        self.rel32(label);
    }

    pub fn call_label(&mut self, label: &str) {
        self.emit(0xE8);
        self.rel32(label);
    }

    /// call qword ptr [rip + rel32], for IAT slots.
    pub fn call_iat(&mut self, iat_label: &str) {
        self.emit_slice(&[0xFF, 0x15]);
        self.rel32(iat_label);
    }

    // ---- RIP-relative data references ----

    pub fn lea_rax_rip(&mut self, label: &str) {
        self.emit_slice(&[0x48, 0x8D, 0x05]);
        self.rel32(label);
    }

    pub fn lea_rcx_rip(&mut self, label: &str) {
        self.emit_slice(&[0x48, 0x8D, 0x0D]);
        self.rel32(label);
    }

    pub fn mov_rax_mrip(&mut self, label: &str) {
        self.emit_slice(&[0x48, 0x8B, 0x05]);
        self.rel32(label);
    }

    pub fn mov_mrip_rax(&mut self, label: &str) {
        self.emit_slice(&[0x48, 0x89, 0x05]);
        self.rel32(label);
    }

    // ---- memory forms used by MMIO and the slot block ----

    /// mov eax, dword ptr [rcx + rax*4]
    pub fn mov_eax_scaled_rcx_rax(&mut self) {
        self.emit_slice(&[0x8B, 0x04, 0x81]);
    }

    /// mov dword ptr [rcx + rdx*4], eax
    pub fn mov_scaled_rcx_rdx_eax(&mut self) {
        self.emit_slice(&[0x89, 0x04, 0x91]);
    }

    /// mov qword ptr [rcx + disp8], rax
    pub fn mov_mrcx_disp8_rax(&mut self, disp: u8) {
        self.emit_slice(&[0x48, 0x89, 0x41, disp]);
    }

    // ---- byte ops for the runtime helpers ----

    pub fn xor_rdx_rdx(&mut self) {
        self.emit_slice(&[0x48, 0x31, 0xD2]);
    }

    pub fn xor_r9_r9(&mut self) {
        self.emit_slice(&[0x4D, 0x31, 0xC9]);
    }

    pub fn mov_r9_imm32(&mut self, x: u32) {
        self.emit_slice(&[0x49, 0xC7, 0xC1]);
        self.emit_u32(x);
    }

    pub fn test_r9_r9(&mut self) {
        self.emit_slice(&[0x4D, 0x85, 0xC9]);
    }

    /// mov al, byte ptr [rcx + rdx]
    pub fn mov_al_mrcx_rdx(&mut self) {
        self.emit_slice(&[0x8A, 0x04, 0x11]);
    }

    pub fn cmp_al_imm8(&mut self, x: u8) {
        self.emit_slice(&[0x3C, x]);
    }

    pub fn inc_rdx(&mut self) {
        self.emit_slice(&[0x48, 0xFF, 0xC2]);
    }

    pub fn dec_r8(&mut self) {
        self.emit_slice(&[0x49, 0xFF, 0xC8]);
    }

    /// mov byte ptr [r8], dl
    pub fn mov_mr8_dl(&mut self) {
        self.emit_slice(&[0x41, 0x88, 0x10]);
    }

    /// mov byte ptr [r8], imm8
    pub fn mov_mr8_imm8(&mut self, x: u8) {
        self.emit_slice(&[0x41, 0xC6, 0x00, x]);
    }

    pub fn add_dl_imm8(&mut self, x: u8) {
        self.emit_slice(&[0x80, 0xC2, x]);
    }

    pub fn lea_r8_rsp_disp8(&mut self, disp: u8) {
        self.emit_slice(&[0x4C, 0x8D, 0x44, 0x24, disp]);
    }

    pub fn lea_r9_rsp_disp8(&mut self, disp: u8) {
        self.emit_slice(&[0x4C, 0x8D, 0x4C, 0x24, disp]);
    }

    /// mov qword ptr [rsp + disp8], imm32 (sign-extended)
    pub fn mov_mrsp_disp8_imm32(&mut self, disp: u8, x: u32) {
        self.emit_slice(&[0x48, 0xC7, 0x44, 0x24, disp]);
        self.emit_u32(x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_bytes() {
        let mut code = CodeBuffer::new();
        code.push_rbp();
        code.mov_rbp_rsp();
        code.sub_rsp_imm32(0x20);
        assert_eq!(
            code.bytes,
            vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_imm64_little_endian() {
        let mut code = CodeBuffer::new();
        code.mov_rax_imm64(0x1122334455667788);
        assert_eq!(
            code.bytes,
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_slot_loads_pick_rex_for_extended_registers() {
        let mut code = CodeBuffer::new();
        code.mov_reg_from_slot(Reg::Rcx, -8);
        code.mov_reg_from_slot(Reg::R8, -16);
        assert_eq!(&code.bytes[0..3], &[0x48, 0x8B, 0x8D]);
        assert_eq!(&code.bytes[3..7], &(-8i32).to_le_bytes());
        assert_eq!(&code.bytes[7..10], &[0x4C, 0x8B, 0x85]);
    }

    #[test]
    fn test_jump_records_a_fixup_with_zeroed_displacement() {
        let mut code = CodeBuffer::new();
        code.jmp("lbl$x");
        assert_eq!(code.bytes, vec![0xE9, 0, 0, 0, 0]);
        assert_eq!(code.rel32_fixups.len(), 1);
        assert_eq!(code.rel32_fixups[0].at, 1);
        assert_eq!(code.rel32_fixups[0].target, "lbl$x");
    }

    #[test]
    fn test_duplicate_label_is_an_error() {
        let mut code = CodeBuffer::new();
        code.define_label("a").unwrap();
        assert!(code.define_label("a").is_err());
    }

    #[test]
    fn test_merge_shifts_labels_and_fixups() {
        let mut base = CodeBuffer::new();
        base.emit_slice(&[0x90, 0x90, 0x90]);

        let mut other = CodeBuffer::new();
        other.define_label("proc$f").unwrap();
        other.call_label("proc$g");
        base.merge(other).unwrap();

        assert_eq!(base.label_offsets["proc$f"], 3);
        assert_eq!(base.rel32_fixups[0].at, 4);
        assert_eq!(base.len(), 8);
    }

    #[test]
    fn test_merge_rejects_label_collisions() {
        let mut base = CodeBuffer::new();
        base.define_label("proc$f").unwrap();
        let mut other = CodeBuffer::new();
        other.define_label("proc$f").unwrap();
        assert!(base.merge(other).is_err());
    }

    #[test]
    fn test_setcc_sequence() {
        let mut code = CodeBuffer::new();
        code.setcc_rax(0x9C);
        assert_eq!(code.bytes, vec![0x0F, 0x9C, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]);
    }
}
