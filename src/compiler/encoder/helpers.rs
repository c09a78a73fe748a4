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

//! Fixed runtime helpers prepended to .text: C-string and integer printing
//! over WriteFile, and the process entry trampoline.

use super::code_buffer::CodeBuffer;
use super::constants::{JCC_E, JCC_GE, JCC_NE};
use crate::errors::CompileError;

pub const PRINT_CSTR: &str = "fn$print_cstr";
pub const PRINT_I64: &str = "fn$print_i64";
pub const ENTRY: &str = "entry$main";
pub const STDOUT_GLOBAL: &str = "g$stdout";

/// print_cstr(RCX = pointer to NUL-terminated string)
///
/// Computes the length, then WriteFile(stdout, ptr, len, &written, 0) with
/// the handle cached at g$stdout. The frame covers shadow space, the
/// overlapped slot at [rsp+0x20] and the written slot at [rsp+0x28].
pub fn emit_print_cstr(code: &mut CodeBuffer) -> Result<(), CompileError> {
    code.define_label(PRINT_CSTR)?;
    code.push_rbp();
    code.mov_rbp_rsp();
    code.sub_rsp_imm32(0x40);

    // rdx = strlen(rcx)
    code.xor_rdx_rdx();
    code.define_label("lbl$print_cstr$loop")?;
    code.mov_al_mrcx_rdx();
    code.cmp_al_imm8(0);
    code.jcc(JCC_E, "lbl$print_cstr$done");
    code.inc_rdx();
    code.jmp("lbl$print_cstr$loop");
    code.define_label("lbl$print_cstr$done")?;

    // WriteFile wants RCX=handle, RDX=buffer, R8=length, R9=&written and a
    // zero lpOverlapped on the stack.
    code.mov_r8_rdx();
    code.mov_rdx_rcx();
    code.mov_rax_mrip(STDOUT_GLOBAL);
    code.mov_rcx_rax();
    code.lea_r9_rsp_disp8(0x28);
    code.mov_mrsp_disp8_imm32(0x20, 0);
    code.call_iat("iat$WriteFile");

    code.mov_rsp_rbp();
    code.pop_rbp();
    code.ret();
    Ok(())
}

/// print_i64(RCX = value)
///
/// Converts to ASCII backwards in a stack buffer ending at [rsp+0x50]
/// (NUL-terminated, sign handled), prints it through print_cstr, then emits
/// a newline.
pub fn emit_print_i64(code: &mut CodeBuffer, newline_label: &str) -> Result<(), CompileError> {
    code.define_label(PRINT_I64)?;
    code.push_rbp();
    code.mov_rbp_rsp();
    code.sub_rsp_imm32(0x60);

    code.mov_rax_rcx();
    code.lea_r8_rsp_disp8(0x50);
    code.mov_mr8_imm8(0);

    // r9 = sign flag
    code.xor_r9_r9();
    code.test_rax_rax();
    code.jcc(JCC_GE, "lbl$print_i64$conv");
    code.neg_rax();
    code.mov_r9_imm32(1);
    code.define_label("lbl$print_i64$conv")?;

    code.test_rax_rax();
    code.jcc(JCC_NE, "lbl$print_i64$loop");
    code.dec_r8();
    code.mov_mr8_imm8(b'0');
    code.jmp("lbl$print_i64$sign");

    // divide by ten, store remainder digits backwards
    code.define_label("lbl$print_i64$loop")?;
    code.mov_rcx_imm64(10);
    code.cqo();
    code.idiv_rcx();
    code.add_dl_imm8(b'0');
    code.dec_r8();
    code.mov_mr8_dl();
    code.test_rax_rax();
    code.jcc(JCC_NE, "lbl$print_i64$loop");

    code.define_label("lbl$print_i64$sign")?;
    code.test_r9_r9();
    code.jcc(JCC_E, "lbl$print_i64$write");
    code.dec_r8();
    code.mov_mr8_imm8(b'-');
    code.define_label("lbl$print_i64$write")?;

    code.mov_rcx_r8();
    code.call_label(PRINT_CSTR);
    code.lea_rcx_rip(newline_label);
    code.call_label(PRINT_CSTR);

    code.mov_rsp_rbp();
    code.pop_rbp();
    code.ret();
    Ok(())
}

/// Entry trampoline: cache GetStdHandle(-11) in g$stdout, run proc$main,
/// ExitProcess(0).
pub fn emit_entry(code: &mut CodeBuffer) -> Result<(), CompileError> {
    code.define_label(ENTRY)?;
    code.push_rbp();
    code.mov_rbp_rsp();
    code.sub_rsp_imm32(0x20);

    code.mov_rcx_imm64((-11i64) as u64);
    code.call_iat("iat$GetStdHandle");
    code.mov_mrip_rax(STDOUT_GLOBAL);

    code.call_label("proc$main");

    code.mov_rcx_imm64(0);
    code.call_iat("iat$ExitProcess");

    // not reached
    code.mov_rsp_rbp();
    code.pop_rbp();
    code.ret();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_define_their_entry_labels() {
        let mut code = CodeBuffer::new();
        emit_print_cstr(&mut code).unwrap();
        emit_print_i64(&mut code, "str$nl").unwrap();
        emit_entry(&mut code).unwrap();
        assert_eq!(code.label_offsets[PRINT_CSTR], 0);
        assert!(code.label_offsets.contains_key(PRINT_I64));
        assert!(code.label_offsets.contains_key(ENTRY));
    }

    #[test]
    fn test_entry_references_the_three_imports_and_main() {
        let mut code = CodeBuffer::new();
        emit_entry(&mut code).unwrap();
        let targets: Vec<&str> = code
            .rel32_fixups
            .iter()
            .map(|f| f.target.as_str())
            .collect();
        assert_eq!(
            targets,
            vec![
                "iat$GetStdHandle",
                STDOUT_GLOBAL,
                "proc$main",
                "iat$ExitProcess"
            ]
        );
    }

    #[test]
    fn test_print_helpers_only_reach_writefile_and_each_other() {
        let mut code = CodeBuffer::new();
        emit_print_cstr(&mut code).unwrap();
        emit_print_i64(&mut code, "str$nl").unwrap();
        for fixup in &code.rel32_fixups {
            assert!(
                code.label_offsets.contains_key(&fixup.target)
                    || fixup.target == "iat$WriteFile"
                    || fixup.target == STDOUT_GLOBAL
                    || fixup.target == "str$nl",
                "unexpected reference {}",
                fixup.target
            );
        }
    }
}
