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

//! One-pass x64 emission from the linear IR. Every virtual value owns an
//! 8-byte frame slot at [rbp - 8*(i+1)]; instructions load their operands
//! into RAX/RDX, compute, and store the destination slot. Helpers and the
//! entry trampoline are emitted first, then each procedure into its own
//! buffer, merged in source order.

pub mod code_buffer;
pub mod constants;
pub mod frame;
pub mod helpers;

use crate::compiler::ir::{ArithOp, CmpOp, Inst, IrFunc, IrModule, Value};
use crate::compiler::pe::data::{DataBuilder, RDataBuilder};
use crate::compiler::pe::import_table::ImportSpec;
use crate::errors::CompileError;
use code_buffer::{CodeBuffer, Reg};
use constants::{inverse, jcc_for, setcc_for};
use frame::CallSite;

pub const SLOTS_GLOBAL: &str = "g$slots";
pub const NEWLINE_STR: &str = "str$nl";

const ARG_REGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];

pub struct Artifacts {
    pub code: CodeBuffer,
    pub rdata: RDataBuilder,
    pub data: DataBuilder,
    pub imports: ImportSpec,
}

pub fn emit_module(module: &IrModule) -> Result<Artifacts, CompileError> {
    let mut rdata = RDataBuilder::new();
    for (id, s) in module.strings.iter().enumerate() {
        rdata.add_cstr(&format!("str${}", id), s);
    }
    rdata.add_cstr(NEWLINE_STR, "\n");

    let mut data = DataBuilder::new();
    data.add_u64(helpers::STDOUT_GLOBAL, 0);
    data.add_u64_array(SLOTS_GLOBAL, crate::compiler::ir::SLOT_COUNT);
    for region in &module.mmio {
        data.add_u32_array(&format!("mmio${}", region.name), region.words);
    }

    let mut code = CodeBuffer::new();
    helpers::emit_print_cstr(&mut code)?;
    helpers::emit_print_i64(&mut code, NEWLINE_STR)?;
    helpers::emit_entry(&mut code)?;

    // Per-procedure buffers merge in source order; the merge is the only
    // ordering between them, so procedure emission is free to be farmed out.
    for func in &module.funcs {
        let mut buf = CodeBuffer::new();
        emit_function(&mut buf, func)?;
        code.merge(buf)?;
    }

    Ok(Artifacts {
        code,
        rdata,
        data,
        imports: ImportSpec::kernel32(),
    })
}

fn slot_disp(value: Value) -> i32 {
    -(8 * (value as i32 + 1))
}

fn emit_epilogue(code: &mut CodeBuffer) {
    code.mov_rsp_rbp();
    code.pop_rbp();
    code.ret();
}

// The call-site pad from an aligned body: shadow space only.
fn call_pad() -> u32 {
    CallSite::plan(0, 0).shadow_and_align
}

fn emit_function(code: &mut CodeBuffer, func: &IrFunc) -> Result<(), CompileError> {
    code.define_label(&format!("proc${}", func.name))?;

    code.push_rbp();
    code.mov_rbp_rsp();
    code.sub_rsp_imm32(frame::frame_size(func.next_value));

    // Spill incoming parameter registers to their value slots.
    for index in 0..func.param_count {
        match index {
            0 => code.mov_rax_rcx(),
            1 => code.mov_rax_rdx(),
            2 => code.mov_rax_r8(),
            3 => code.mov_rax_r9(),
            _ => {
                return Err(CompileError::LayoutError {
                    reason: format!(
                        "Procedure {} has more than four parameters",
                        func.name
                    ),
                });
            }
        }
        code.mov_slot_from_rax(slot_disp(index as Value));
    }

    for inst in &func.insts {
        emit_inst(code, inst)?;
    }

    // Fall-off-the-end safety net.
    code.mov_rax_imm64(0);
    emit_epilogue(code);
    Ok(())
}

fn emit_exit_process(code: &mut CodeBuffer, exit_code: u64) {
    code.mov_rcx_imm64(exit_code);
    code.sub_rsp_imm32(call_pad());
    code.call_iat("iat$ExitProcess");
}

fn emit_inst(code: &mut CodeBuffer, inst: &Inst) -> Result<(), CompileError> {
    match inst {
        Inst::Const { dst, imm } => {
            code.mov_rax_imm64(*imm as u64);
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Copy { dst, src } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*src));
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Arith { op, dst, lhs, rhs } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*lhs));
            match op {
                ArithOp::Div | ArithOp::Mod => {
                    code.mov_reg_from_slot(Reg::Rcx, slot_disp(*rhs));
                    code.cqo();
                    code.idiv_rcx();
                    if *op == ArithOp::Mod {
                        code.mov_rax_rdx();
                    }
                }
                ArithOp::Shl | ArithOp::Shr | ArithOp::Sar => {
                    code.mov_reg_from_slot(Reg::Rcx, slot_disp(*rhs));
                    match op {
                        ArithOp::Shl => code.shl_rax_cl(),
                        ArithOp::Shr => code.shr_rax_cl(),
                        _ => code.sar_rax_cl(),
                    }
                }
                _ => {
                    code.mov_reg_from_slot(Reg::Rdx, slot_disp(*rhs));
                    match op {
                        ArithOp::Add => code.add_rax_rdx(),
                        ArithOp::Sub => code.sub_rax_rdx(),
                        ArithOp::Mul => code.imul_rax_rdx(),
                        ArithOp::And => code.and_rax_rdx(),
                        ArithOp::Or => code.or_rax_rdx(),
                        ArithOp::Xor => code.xor_rax_rdx(),
                        _ => unreachable!(),
                    }
                }
            }
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Neg { dst, src } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*src));
            code.neg_rax();
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Not { dst, src } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*src));
            code.not_rax();
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Cmp { op, dst, lhs, rhs } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*lhs));
            code.mov_reg_from_slot(Reg::Rdx, slot_disp(*rhs));
            code.cmp_rax_rdx();
            code.setcc_rax(setcc_for(*op));
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::StrAddr { dst, str_id } => {
            code.lea_rax_rip(&format!("str${}", str_id));
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Call { dst, callee, args } => {
            for (index, arg) in args.iter().enumerate() {
                code.mov_reg_from_slot(ARG_REGS[index], slot_disp(*arg));
            }
            let pad = call_pad();
            code.sub_rsp_imm32(pad);
            code.call_label(&format!("proc${}", callee));
            code.add_rsp_imm32(pad);
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::Ret { value } => {
            match value {
                Some(v) => code.mov_reg_from_slot(Reg::Rax, slot_disp(*v)),
                None => code.mov_rax_imm64(0),
            }
            emit_epilogue(code);
        }

        Inst::Print { value, .. } => {
            code.mov_reg_from_slot(Reg::Rcx, slot_disp(*value));
            let pad = call_pad();
            code.sub_rsp_imm32(pad);
            code.call_label(helpers::PRINT_I64);
            code.add_rsp_imm32(pad);
        }

        Inst::PrintStr { str_id, .. } => {
            code.lea_rcx_rip(&format!("str${}", str_id));
            let pad = call_pad();
            code.sub_rsp_imm32(pad);
            code.call_label(helpers::PRINT_CSTR);
            code.add_rsp_imm32(pad);
        }

        Inst::MmioRead {
            dst,
            region,
            offset,
            guard_id,
        } => {
            let ok_label = format!("lbl$grd{}", guard_id);
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*offset));
            code.and_rax_imm8(3);
            code.test_rax_rax();
            // aligned (the misaligned condition is false) skips the trap
            code.jcc(jcc_for(inverse(CmpOp::Ne)), &ok_label);
            emit_exit_process(code, 0xEE);
            code.define_label(&ok_label)?;

            code.mov_reg_from_slot(Reg::Rax, slot_disp(*offset));
            code.shr_rax_imm8(2);
            code.lea_rcx_rip(&format!("mmio${}", region));
            code.mov_eax_scaled_rcx_rax();
            code.mov_slot_from_rax(slot_disp(*dst));
        }

        Inst::MmioWrite {
            region,
            offset,
            value,
            guard_id,
        } => {
            let ok_label = format!("lbl$grd{}", guard_id);
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*offset));
            code.and_rax_imm8(3);
            code.test_rax_rax();
            code.jcc(jcc_for(inverse(CmpOp::Ne)), &ok_label);
            emit_exit_process(code, 0xEE);
            code.define_label(&ok_label)?;

            code.mov_reg_from_slot(Reg::Rax, slot_disp(*offset));
            code.shr_rax_imm8(2);
            code.mov_rdx_rax();
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*value));
            code.lea_rcx_rip(&format!("mmio${}", region));
            code.mov_scaled_rcx_rdx_eax();
        }

        Inst::Trap { code: exit_value } => match exit_value {
            Some(v) => {
                code.mov_reg_from_slot(Reg::Rcx, slot_disp(*v));
                code.sub_rsp_imm32(call_pad());
                code.call_iat("iat$ExitProcess");
            }
            None => emit_exit_process(code, 1),
        },

        Inst::Halt => emit_exit_process(code, 0),

        Inst::Jmp { target } => code.jmp(target),

        Inst::CondJmp {
            cond,
            label_true,
            label_false,
        } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*cond));
            code.test_rax_rax();
            code.jcc(jcc_for(CmpOp::Ne), label_true);
            code.jmp(label_false);
        }

        Inst::Label { name } => code.define_label(name)?,

        Inst::SlotStore { slot, value } => {
            code.mov_reg_from_slot(Reg::Rax, slot_disp(*value));
            code.lea_rcx_rip(SLOTS_GLOBAL);
            code.mov_mrcx_disp8_rax((*slot * 8) as u8);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::IrFunc;

    fn module_with_main(insts: Vec<Inst>, next_value: Value) -> IrModule {
        let mut func = IrFunc::new("main");
        func.insts = insts;
        func.next_value = next_value;
        IrModule {
            funcs: vec![func],
            ..IrModule::default()
        }
    }

    #[test]
    fn test_const_then_ret_emits_prologue_store_load_epilogue() {
        let mut code = CodeBuffer::new();
        let mut func = IrFunc::new("main");
        func.insts = vec![
            Inst::Const { dst: 0, imm: 14 },
            Inst::Ret { value: Some(0) },
        ];
        func.next_value = 1;
        emit_function(&mut code, &func).unwrap();

        // prologue: push rbp; mov rbp, rsp; sub rsp, 16
        assert_eq!(&code.bytes[0..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(&code.bytes[4..11], &[0x48, 0x81, 0xEC, 0x10, 0, 0, 0]);
        // mov rax, 14; mov [rbp-8], rax
        assert_eq!(&code.bytes[11..13], &[0x48, 0xB8]);
        assert_eq!(&code.bytes[13..21], &14u64.to_le_bytes());
        assert_eq!(&code.bytes[21..24], &[0x48, 0x89, 0x85]);
        assert_eq!(&code.bytes[24..28], &(-8i32).to_le_bytes());
    }

    #[test]
    fn test_print_call_sites_reserve_shadow_space() {
        let mut code = CodeBuffer::new();
        emit_inst(&mut code, &Inst::Print { value: 0, trace_id: 1 }).unwrap();

        // mov rcx, [rbp-8]; sub rsp, 32; call fn$print_i64; add rsp, 32
        let bytes = &code.bytes;
        assert_eq!(&bytes[0..3], &[0x48, 0x8B, 0x8D]);
        assert_eq!(&bytes[7..10], &[0x48, 0x81, 0xEC]);
        assert_eq!(&bytes[10..14], &32u32.to_le_bytes());
        assert_eq!(bytes[14], 0xE8);
        assert_eq!(&bytes[19..22], &[0x48, 0x81, 0xC4]);
        assert_eq!(code.rel32_fixups[0].target, helpers::PRINT_I64);
        assert_eq!(code.rel32_fixups[0].at, 15);
    }

    #[test]
    fn test_division_uses_cqo_idiv_rcx() {
        let mut code = CodeBuffer::new();
        emit_inst(
            &mut code,
            &Inst::Arith { op: ArithOp::Div, dst: 2, lhs: 0, rhs: 1 },
        )
        .unwrap();
        let text = code.bytes;
        // mov rax,[rbp-8]; mov rcx,[rbp-16]; cqo; idiv rcx; mov [rbp-24],rax
        assert_eq!(&text[0..3], &[0x48, 0x8B, 0x85]);
        assert_eq!(&text[7..10], &[0x48, 0x8B, 0x8D]);
        assert_eq!(&text[14..16], &[0x48, 0x99]);
        assert_eq!(&text[16..19], &[0x48, 0xF7, 0xF9]);
    }

    #[test]
    fn test_modulo_moves_remainder_into_rax() {
        let mut code = CodeBuffer::new();
        emit_inst(
            &mut code,
            &Inst::Arith { op: ArithOp::Mod, dst: 2, lhs: 0, rhs: 1 },
        )
        .unwrap();
        // ... cqo; idiv rcx; mov rax, rdx
        assert_eq!(&code.bytes[16..19], &[0x48, 0xF7, 0xF9]);
        assert_eq!(&code.bytes[19..22], &[0x48, 0x89, 0xD0]);
    }

    #[test]
    fn test_comparison_materialises_via_setcc() {
        let mut code = CodeBuffer::new();
        emit_inst(
            &mut code,
            &Inst::Cmp { op: crate::compiler::ir::CmpOp::Lt, dst: 2, lhs: 0, rhs: 1 },
        )
        .unwrap();
        // cmp rax, rdx; setl al; movzx rax, al
        let text = code.bytes;
        assert_eq!(&text[14..17], &[0x48, 0x39, 0xD0]);
        assert_eq!(&text[17..20], &[0x0F, 0x9C, 0xC0]);
        assert_eq!(&text[20..24], &[0x48, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_mmio_read_guards_alignment_then_scales() {
        let mut code = CodeBuffer::new();
        emit_inst(
            &mut code,
            &Inst::MmioRead {
                dst: 1,
                region: "R".to_string(),
                offset: 0,
                guard_id: 7,
            },
        )
        .unwrap();
        let text = &code.bytes;
        // and rax, 3 follows the first slot load
        assert_eq!(&text[7..11], &[0x48, 0x83, 0xE0, 0x03]);
        // guard label was defined and the trap path references ExitProcess
        assert!(code.label_offsets.contains_key("lbl$grd7"));
        assert!(
            code.rel32_fixups
                .iter()
                .any(|f| f.target == "iat$ExitProcess")
        );
        // shr rax, 2 and the scaled dword load appear after the guard
        let ok = code.label_offsets["lbl$grd7"];
        assert_eq!(&text[ok + 7..ok + 11], &[0x48, 0xC1, 0xE8, 0x02]);
        assert!(text.windows(3).any(|w| w == [0x8B, 0x04, 0x81]));
    }

    #[test]
    fn test_module_emission_prepends_helpers_and_entry() {
        let module = module_with_main(vec![Inst::Ret { value: None }], 0);
        let art = emit_module(&module).unwrap();
        assert_eq!(art.code.label_offsets[helpers::PRINT_CSTR], 0);
        let entry = art.code.label_offsets[helpers::ENTRY];
        let main = art.code.label_offsets["proc$main"];
        assert!(entry > 0);
        assert!(main > entry);
        // data side has the stdout cache and the slot block
        assert!(art.data.label_offsets.contains_key(helpers::STDOUT_GLOBAL));
        assert!(art.data.label_offsets.contains_key(SLOTS_GLOBAL));
        // rdata interns the helper newline
        assert!(art.rdata.label_offsets.contains_key(NEWLINE_STR));
    }
}
