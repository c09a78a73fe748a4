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

//! Linear three-address IR over virtual values, and the AST-to-IR lowering.
//!
//! Expression lowering is bottom-up and stackless: every subexpression
//! writes into a fresh virtual value. Short-circuit and ternary expressions
//! lower to synthetic label pairs; `&&`/`||` normalise to 0/1 exactly once,
//! at the merge point.

use crate::ast::{BinOp, Expr, NodeMeta, UnOp};
use crate::compiler::blocks::{Block, BlockProgram, Terminator};
use crate::errors::CompileError;
use crate::stable_id::{
    self, GUARD_KIND_READ, GUARD_KIND_WRITE, IdCandidate, IrAnchor, RULE_MMIO_ALIGN,
    RULE_PRINT_TRACE, best_key_for_node, sym_id,
};
use std::collections::HashMap;

pub type Value = u32;
pub type StrId = u32;

/// Number of 8-byte result slots backing `call ... into slot N`.
pub const SLOT_COUNT: u32 = 16;

/// The maximum number of register-passed arguments the emitter supports.
pub const MAX_CALL_ARGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Const { dst: Value, imm: i64 },
    Copy { dst: Value, src: Value },
    Arith { op: ArithOp, dst: Value, lhs: Value, rhs: Value },
    Neg { dst: Value, src: Value },
    Not { dst: Value, src: Value },
    Cmp { op: CmpOp, dst: Value, lhs: Value, rhs: Value },
    StrAddr { dst: Value, str_id: StrId },
    Call { dst: Value, callee: String, args: Vec<Value> },
    Ret { value: Option<Value> },
    Print { value: Value, trace_id: u32 },
    PrintStr { str_id: StrId, trace_id: u32 },
    MmioRead { dst: Value, region: String, offset: Value, guard_id: u32 },
    MmioWrite { region: String, offset: Value, value: Value, guard_id: u32 },
    Trap { code: Option<Value> },
    Halt,
    Jmp { target: String },
    CondJmp { cond: Value, label_true: String, label_false: String },
    Label { name: String },
    SlotStore { slot: u32, value: Value },
}

impl Inst {
    pub fn def(&self) -> Option<Value> {
        match self {
            Inst::Const { dst, .. }
            | Inst::Copy { dst, .. }
            | Inst::Arith { dst, .. }
            | Inst::Neg { dst, .. }
            | Inst::Not { dst, .. }
            | Inst::Cmp { dst, .. }
            | Inst::StrAddr { dst, .. }
            | Inst::Call { dst, .. }
            | Inst::MmioRead { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    pub fn collect_uses(&self, out: &mut Vec<Value>) {
        match self {
            Inst::Copy { src, .. } | Inst::Neg { src, .. } | Inst::Not { src, .. } => {
                out.push(*src)
            }
            Inst::Arith { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            Inst::Call { args, .. } => out.extend(args.iter().copied()),
            Inst::Ret { value: Some(v) } => out.push(*v),
            Inst::Print { value, .. } => out.push(*value),
            Inst::MmioRead { offset, .. } => out.push(*offset),
            Inst::MmioWrite { offset, value, .. } => {
                out.push(*offset);
                out.push(*value);
            }
            Inst::Trap { code: Some(v) } => out.push(*v),
            Inst::CondJmp { cond, .. } => out.push(*cond),
            Inst::SlotStore { value, .. } => out.push(*value),
            _ => {}
        }
    }

    /// Observable effects an optimiser must not delete.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Inst::Print { .. }
                | Inst::PrintStr { .. }
                | Inst::Call { .. }
                | Inst::MmioRead { .. }
                | Inst::MmioWrite { .. }
                | Inst::Trap { .. }
                | Inst::Halt
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunc {
    pub name: String,
    pub param_count: usize,
    pub insts: Vec<Inst>,
    pub next_value: Value,
    pub locals: HashMap<String, Value>,
}

impl IrFunc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            param_count: 0,
            insts: Vec::new(),
            next_value: 0,
            locals: HashMap::new(),
        }
    }

    pub fn alloc_value(&mut self) -> Value {
        let v = self.next_value;
        self.next_value += 1;
        v
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MmioInfo {
    pub name: String,
    pub base: u32,
    pub words: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IrModule {
    pub funcs: Vec<IrFunc>,
    pub strings: Vec<String>,
    pub mmio: Vec<MmioInfo>,
}

impl IrModule {
    pub fn find_func(&self, name: &str) -> Option<&IrFunc> {
        self.funcs.iter().find(|f| f.name == name)
    }
}

/// Integer literal parsing: decimal, 0x..., 0b..., underscore separators.
/// Failure yields 0; lexical validation happened upstream.
pub fn parse_int_literal(text: &str) -> i64 {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let (digits, radix, negative) = if let Some(rest) = cleaned.strip_prefix('-') {
        if let Some(hex) = rest.strip_prefix("0x") {
            (hex, 16, true)
        } else if let Some(bin) = rest.strip_prefix("0b") {
            (bin, 2, true)
        } else {
            (rest, 10, true)
        }
    } else if let Some(hex) = cleaned.strip_prefix("0x") {
        (hex, 16, false)
    } else if let Some(bin) = cleaned.strip_prefix("0b") {
        (bin, 2, false)
    } else {
        (cleaned.as_str(), 10, false)
    };

    let magnitude = u64::from_str_radix(digits, radix).unwrap_or(0);
    let signed = magnitude as i64;
    if negative { signed.wrapping_neg() } else { signed }
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct LowerCtx {
    seed: u64,
    strings: Vec<String>,
    string_ids: HashMap<String, StrId>,
    proc_names: Vec<String>,
    mmio_names: Vec<String>,
    candidates: Vec<IdCandidate>,
}

impl LowerCtx {
    fn intern_string(&mut self, s: &str) -> StrId {
        if let Some(id) = self.string_ids.get(s) {
            return *id;
        }
        let id = self.strings.len() as StrId;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }
}

struct FuncLower<'a> {
    ctx: &'a mut LowerCtx,
    func: IrFunc,
    func_index: usize,
    fn_sym: u32,
    next_label: u32,
}

impl<'a> FuncLower<'a> {
    // Synthetic control-flow labels, L1, L2, ... per function.
    fn fresh_label(&mut self) -> String {
        self.next_label += 1;
        format!("lbl${}$L{}", self.func.name, self.next_label)
    }

    fn block_label(&self, name: &str) -> String {
        format!("lbl${}${}", self.func.name, name)
    }

    fn push(&mut self, inst: Inst) {
        self.func.insts.push(inst);
    }

    // Register a guard/trace candidate anchored at the instruction about to
    // be pushed. The ID itself is assigned after the whole pass.
    fn register_candidate(&mut self, meta: &NodeMeta, rule_id: u32, role_tag: u32) {
        let key = best_key_for_node(
            self.ctx.seed,
            self.fn_sym,
            rule_id,
            role_tag,
            meta.node_id,
            &meta.path,
            meta.span,
            meta.byte_offset,
            0,
        );
        self.ctx.candidates.push(IdCandidate {
            key,
            fn_sym: self.fn_sym,
            span: meta.span,
            rule_id,
            role_tag,
            node_id: meta.node_id,
            anchor: IrAnchor {
                func: self.func_index,
                inst: self.func.insts.len(),
            },
            assigned: 0,
        });
    }

    fn lookup_local(&self, name: &str, meta: &NodeMeta) -> Result<Value, CompileError> {
        self.func
            .locals
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::SemanticError {
                line: meta.span.line as usize,
                reason: format!("Undefined local: {}", name),
            })
    }

    fn check_region(&self, region: &str, meta: &NodeMeta) -> Result<(), CompileError> {
        if self.ctx.mmio_names.iter().any(|r| r == region) {
            Ok(())
        } else {
            Err(CompileError::SemanticError {
                line: meta.span.line as usize,
                reason: format!("Unknown mmio region: {}", region),
            })
        }
    }

    fn emit_const(&mut self, imm: i64) -> Value {
        let dst = self.func.alloc_value();
        self.push(Inst::Const { dst, imm });
        dst
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<Value, CompileError> {
        match expr {
            Expr::Int { text, .. } => Ok(self.emit_const(parse_int_literal(text))),
            Expr::Bool { value, .. } => Ok(self.emit_const(*value as i64)),
            Expr::Null { .. } => Ok(self.emit_const(0)),
            Expr::Str { value, .. } => {
                let str_id = self.ctx.intern_string(value);
                let dst = self.func.alloc_value();
                self.push(Inst::StrAddr { dst, str_id });
                Ok(dst)
            }
            Expr::Ident { meta, name } => self.lookup_local(name, meta),
            Expr::Unary { op, arg, .. } => {
                let src = self.lower_expr(arg)?;
                let dst = self.func.alloc_value();
                match op {
                    UnOp::Neg => self.push(Inst::Neg { dst, src }),
                    UnOp::BitNot => self.push(Inst::Not { dst, src }),
                    UnOp::Not => {
                        // logical not: dst = (src == 0)
                        let zero = self.emit_const(0);
                        self.push(Inst::Cmp {
                            op: CmpOp::Eq,
                            dst,
                            lhs: src,
                            rhs: zero,
                        });
                    }
                }
                Ok(dst)
            }
            Expr::Binary { op, lhs, rhs, .. } => self.lower_binary(*op, lhs, rhs),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                let cond_v = self.lower_expr(cond)?;
                let result = self.func.alloc_value();
                let label_then = self.fresh_label();
                let label_else = self.fresh_label();
                let label_end = self.fresh_label();
                self.push(Inst::CondJmp {
                    cond: cond_v,
                    label_true: label_then.clone(),
                    label_false: label_else.clone(),
                });
                self.push(Inst::Label { name: label_then });
                let then_v = self.lower_expr(then_expr)?;
                self.push(Inst::Copy { dst: result, src: then_v });
                self.push(Inst::Jmp { target: label_end.clone() });
                self.push(Inst::Label { name: label_else });
                let else_v = self.lower_expr(else_expr)?;
                self.push(Inst::Copy { dst: result, src: else_v });
                self.push(Inst::Label { name: label_end });
                Ok(result)
            }
            Expr::Call { meta, callee, args } => self.lower_call(meta, callee, args),
        }
    }

    fn lower_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, CompileError> {
        if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
            return self.lower_short_circuit(op, lhs, rhs);
        }

        let lhs_v = self.lower_expr(lhs)?;
        let rhs_v = self.lower_expr(rhs)?;
        let dst = self.func.alloc_value();

        let inst = match op {
            BinOp::Add => Inst::Arith { op: ArithOp::Add, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Sub => Inst::Arith { op: ArithOp::Sub, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Mul => Inst::Arith { op: ArithOp::Mul, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Div => Inst::Arith { op: ArithOp::Div, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Mod => Inst::Arith { op: ArithOp::Mod, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::BitAnd => Inst::Arith { op: ArithOp::And, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::BitOr => Inst::Arith { op: ArithOp::Or, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::BitXor => Inst::Arith { op: ArithOp::Xor, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Shl => Inst::Arith { op: ArithOp::Shl, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Shr => Inst::Arith { op: ArithOp::Shr, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Sar => Inst::Arith { op: ArithOp::Sar, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Eq => Inst::Cmp { op: CmpOp::Eq, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Ne => Inst::Cmp { op: CmpOp::Ne, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Lt => Inst::Cmp { op: CmpOp::Lt, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Le => Inst::Cmp { op: CmpOp::Le, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Gt => Inst::Cmp { op: CmpOp::Gt, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::Ge => Inst::Cmp { op: CmpOp::Ge, dst, lhs: lhs_v, rhs: rhs_v },
            BinOp::LogAnd | BinOp::LogOr => unreachable!(),
        };
        self.push(inst);
        Ok(dst)
    }

    // Short-circuit: the raw operand flows into `raw` on whichever path ran,
    // and the merge point normalises to 0/1 once.
    fn lower_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Value, CompileError> {
        let label_rhs = self.fresh_label();
        let label_end = self.fresh_label();

        let lhs_v = self.lower_expr(lhs)?;
        let raw = self.func.alloc_value();
        self.push(Inst::Copy { dst: raw, src: lhs_v });
        match op {
            BinOp::LogAnd => self.push(Inst::CondJmp {
                cond: lhs_v,
                label_true: label_rhs.clone(),
                label_false: label_end.clone(),
            }),
            BinOp::LogOr => self.push(Inst::CondJmp {
                cond: lhs_v,
                label_true: label_end.clone(),
                label_false: label_rhs.clone(),
            }),
            _ => unreachable!(),
        }
        self.push(Inst::Label { name: label_rhs });
        let rhs_v = self.lower_expr(rhs)?;
        self.push(Inst::Copy { dst: raw, src: rhs_v });
        self.push(Inst::Label { name: label_end });

        let zero = self.emit_const(0);
        let dst = self.func.alloc_value();
        self.push(Inst::Cmp {
            op: CmpOp::Ne,
            dst,
            lhs: raw,
            rhs: zero,
        });
        Ok(dst)
    }

    fn lower_call(
        &mut self,
        meta: &NodeMeta,
        callee: &str,
        args: &[Expr],
    ) -> Result<Value, CompileError> {
        // print is the one builtin that also works in expression position;
        // it evaluates to 0.
        if callee == "print" {
            self.lower_print(meta, args)?;
            return Ok(self.emit_const(0));
        }

        if args.len() > MAX_CALL_ARGS {
            return Err(CompileError::StructuralError {
                line: meta.span.line as usize,
                reason: format!(
                    "Call to '{}' passes {} arguments, at most {} are supported",
                    callee,
                    args.len(),
                    MAX_CALL_ARGS
                ),
            });
        }
        if !self.ctx.proc_names.iter().any(|p| p == callee) {
            return Err(CompileError::SemanticError {
                line: meta.span.line as usize,
                reason: format!("Unknown proc: {}", callee),
            });
        }

        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.lower_expr(arg)?);
        }
        let dst = self.func.alloc_value();
        self.push(Inst::Call {
            dst,
            callee: callee.to_string(),
            args: arg_values,
        });
        Ok(dst)
    }

    fn lower_print(&mut self, meta: &NodeMeta, args: &[Expr]) -> Result<(), CompileError> {
        if args.len() != 1 {
            return Err(CompileError::StructuralError {
                line: meta.span.line as usize,
                reason: "print expects exactly one argument".to_string(),
            });
        }

        if let Expr::Str { value, .. } = &args[0] {
            let str_id = self.ctx.intern_string(value);
            self.register_candidate(meta, RULE_PRINT_TRACE, stable_id::role_tag_trace(0));
            self.push(Inst::PrintStr { str_id, trace_id: 0 });
        } else {
            let value = self.lower_expr(&args[0])?;
            self.register_candidate(meta, RULE_PRINT_TRACE, stable_id::role_tag_trace(1));
            self.push(Inst::Print { value, trace_id: 0 });
        }
        Ok(())
    }

    fn lower_block(&mut self, block: &Block) -> Result<(), CompileError> {
        let label = self.block_label(&block.label_name());
        self.push(Inst::Label { name: label });

        for stmt in &block.stmts {
            self.lower_stmt(stmt)?;
        }

        match &block.terminator {
            Terminator::Jump { target } => {
                let target = self.block_label(target);
                self.push(Inst::Jmp { target });
            }
            Terminator::Branch {
                cond,
                label_true,
                label_false,
            } => {
                let cond_v = self.lower_expr(cond)?;
                let label_true = self.block_label(label_true);
                let label_false = self.block_label(label_false);
                self.push(Inst::CondJmp {
                    cond: cond_v,
                    label_true,
                    label_false,
                });
            }
            Terminator::Trap { code } => {
                let code_v = match code {
                    Some(expr) => Some(self.lower_expr(expr)?),
                    None => None,
                };
                self.push(Inst::Trap { code: code_v });
            }
            Terminator::Halt => self.push(Inst::Halt),
            Terminator::Return { value } => {
                let v = self.lower_expr(value)?;
                self.push(Inst::Ret { value: Some(v) });
            }
            Terminator::ImplicitReturn => self.push(Inst::Ret { value: None }),
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &crate::ast::Stmt) -> Result<(), CompileError> {
        use crate::ast::Stmt;
        match stmt {
            Stmt::Let { name, init, .. } => {
                let src = self.lower_expr(init)?;
                let dst = self.func.alloc_value();
                self.push(Inst::Copy { dst, src });
                self.func.locals.insert(name.clone(), dst);
                Ok(())
            }
            Stmt::Assign { meta, name, value } => {
                let src = self.lower_expr(value)?;
                let dst = self.lookup_local(name, meta)?;
                self.push(Inst::Copy { dst, src });
                Ok(())
            }
            Stmt::Expr { expr, .. } => {
                self.lower_expr(expr)?;
                Ok(())
            }
            Stmt::Read32 {
                meta,
                region,
                offset,
                dest,
            } => {
                self.check_region(region, meta)?;
                let offset_v = self.lower_expr(offset)?;
                let dst = match self.func.locals.get(dest) {
                    Some(v) => *v,
                    None => {
                        let v = self.func.alloc_value();
                        self.func.locals.insert(dest.clone(), v);
                        v
                    }
                };
                self.register_candidate(
                    meta,
                    RULE_MMIO_ALIGN,
                    stable_id::role_tag_guard(GUARD_KIND_READ),
                );
                self.push(Inst::MmioRead {
                    dst,
                    region: region.clone(),
                    offset: offset_v,
                    guard_id: 0,
                });
                Ok(())
            }
            Stmt::Write32 {
                meta,
                region,
                offset,
                value,
            } => {
                self.check_region(region, meta)?;
                let offset_v = self.lower_expr(offset)?;
                let value_v = self.lower_expr(value)?;
                self.register_candidate(
                    meta,
                    RULE_MMIO_ALIGN,
                    stable_id::role_tag_guard(GUARD_KIND_WRITE),
                );
                self.push(Inst::MmioWrite {
                    region: region.clone(),
                    offset: offset_v,
                    value: value_v,
                    guard_id: 0,
                });
                Ok(())
            }
            Stmt::CallIntoSlot {
                meta,
                callee,
                args,
                slot,
            } => {
                if *slot >= SLOT_COUNT {
                    return Err(CompileError::SemanticError {
                        line: meta.span.line as usize,
                        reason: format!(
                            "Slot index {} out of range, {} slots exist",
                            slot, SLOT_COUNT
                        ),
                    });
                }
                let result = self.lower_call(meta, callee, args)?;
                self.push(Inst::SlotStore {
                    slot: *slot,
                    value: result,
                });
                Ok(())
            }
            // Labels, branches, returns, traps and halts became block
            // terminators during partitioning.
            Stmt::Label { .. }
            | Stmt::Branch { .. }
            | Stmt::Return { .. }
            | Stmt::Trap { .. }
            | Stmt::Halt { .. } => unreachable!("terminator statement inside a block body"),
        }
    }
}

/// Lower the partitioned program to an IR module and resolve guard/trace IDs
/// by the sort-then-number scheme. Anchors are patched afterwards; the IDs
/// themselves never change once assigned.
pub fn lower_program(program: &BlockProgram, seed: u64) -> Result<IrModule, CompileError> {
    let mut ctx = LowerCtx {
        seed,
        strings: Vec::new(),
        string_ids: HashMap::new(),
        proc_names: program.procs.iter().map(|p| p.name.clone()).collect(),
        mmio_names: program.mmio.iter().map(|r| r.name.clone()).collect(),
        candidates: Vec::new(),
    };

    let mut mmio = Vec::new();
    for region in &program.mmio {
        if region.size % 4 != 0 {
            return Err(CompileError::SemanticError {
                line: region.meta.span.line as usize,
                reason: format!("Mmio region {} size must be a multiple of 4", region.name),
            });
        }
        mmio.push(MmioInfo {
            name: region.name.clone(),
            base: region.base,
            words: region.size / 4,
        });
    }

    let mut funcs = Vec::new();
    for (func_index, proc) in program.procs.iter().enumerate() {
        let mut func = IrFunc::new(&proc.name);
        func.param_count = proc.params.len();
        for param in &proc.params {
            let v = func.alloc_value();
            func.locals.insert(param.clone(), v);
        }

        let mut lower = FuncLower {
            ctx: &mut ctx,
            func,
            func_index,
            fn_sym: sym_id(&proc.name),
            next_label: 0,
        };
        for block in &proc.blocks {
            lower.lower_block(block)?;
        }
        funcs.push(lower.func);
    }

    // Rank-after-sort assignment, then patch the anchored instructions.
    stable_id::assign_ids_sorted(&mut ctx.candidates, 1);
    for candidate in &ctx.candidates {
        let inst = &mut funcs[candidate.anchor.func].insts[candidate.anchor.inst];
        match inst {
            Inst::MmioRead { guard_id, .. } | Inst::MmioWrite { guard_id, .. } => {
                *guard_id = candidate.assigned
            }
            Inst::Print { trace_id, .. } | Inst::PrintStr { trace_id, .. } => {
                *trace_id = candidate.assigned
            }
            other => unreachable!("candidate anchored at a non-instrumented op: {:?}", other),
        }
    }

    Ok(IrModule {
        funcs,
        strings: ctx.strings,
        mmio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::assign_lexical_paths;
    use crate::compiler::blocks::partition_program;
    use crate::parser::parse_source;

    fn lower(source: &str) -> IrModule {
        try_lower(source).unwrap()
    }

    fn try_lower(source: &str) -> Result<IrModule, CompileError> {
        let mut program = parse_source(source).unwrap();
        assign_lexical_paths(&mut program);
        let blocks = partition_program(&program, 7)?;
        lower_program(&blocks, 7)
    }

    #[test]
    fn test_parse_int_literal_formats() {
        assert_eq!(parse_int_literal("42"), 42);
        assert_eq!(parse_int_literal("0x2A"), 42);
        assert_eq!(parse_int_literal("0b101010"), 42);
        assert_eq!(parse_int_literal("1_000_000"), 1000000);
        assert_eq!(parse_int_literal("-7"), -7);
        assert_eq!(parse_int_literal("bogus"), 0);
    }

    #[test]
    fn test_lower_params_then_body() {
        let module = lower("proc add(a, b) { return a + b; }\n");
        let func = module.find_func("add").unwrap();
        assert_eq!(func.param_count, 2);
        assert!(func.insts.iter().any(|i| matches!(
            i,
            Inst::Arith { op: ArithOp::Add, lhs: 0, rhs: 1, .. }
        )));
        assert!(func.insts.iter().any(|i| matches!(i, Inst::Ret { value: Some(_) })));
    }

    #[test]
    fn test_lower_builtin_print_dispatches() {
        let module = lower("proc main() { print(\"hi\\n\"); print(1 + 2); return 0; }\n");
        let func = module.find_func("main").unwrap();
        assert!(func.insts.iter().any(|i| matches!(i, Inst::PrintStr { .. })));
        assert!(func.insts.iter().any(|i| matches!(i, Inst::Print { .. })));
        assert_eq!(module.strings, vec!["hi\n".to_string()]);
    }

    #[test]
    fn test_lower_undefined_local_is_an_error() {
        let err = try_lower("proc main() { return x; }\n").unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_lower_rejects_more_than_four_arguments() {
        let err = try_lower(
            "proc f(a, b, c, d) { return 0; }\nproc main() { f(1, 2, 3, 4, 5); return 0; }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::StructuralError { .. }));
    }

    #[test]
    fn test_lower_rejects_unknown_callee() {
        let err = try_lower("proc main() { nope(1); return 0; }\n").unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_lower_rejects_unknown_region() {
        let err = try_lower("proc main() { read32 R, 0 into x; return 0; }\n").unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_let_gets_its_own_slot() {
        // Rebinding through a let alias must not clobber the source local.
        let module = lower("proc main() { let a = 1; let b = a; b = 2; return a; }\n");
        let func = module.find_func("main").unwrap();
        let a = func.locals["a"];
        let b = func.locals["b"];
        assert_ne!(a, b);
    }

    #[test]
    fn test_guard_and_trace_ids_are_assigned_from_one() {
        let module = lower(
            "mmio region R from 0x1000 size 256;\n\
             proc main() { print(1); read32 R, 0 into x; write32 R, 4, x; return 0; }\n",
        );
        let func = module.find_func("main").unwrap();
        let mut ids = Vec::new();
        for inst in &func.insts {
            match inst {
                Inst::Print { trace_id, .. } => ids.push(*trace_id),
                Inst::MmioRead { guard_id, .. } | Inst::MmioWrite { guard_id, .. } => {
                    ids.push(*guard_id)
                }
                _ => {}
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_guard_ids_survive_proc_reordering() {
        let a = lower(
            "mmio region R from 0x1000 size 64;\n\
             proc one() { read32 R, 0 into x; return 0; }\n\
             proc two() { write32 R, 4, 1; return 0; }\n",
        );
        let b = lower(
            "mmio region R from 0x1000 size 64;\n\
             proc two() { write32 R, 4, 1; return 0; }\n\
             proc one() { read32 R, 0 into x; return 0; }\n",
        );
        let guard_of = |m: &IrModule, f: &str| -> u32 {
            m.find_func(f)
                .unwrap()
                .insts
                .iter()
                .find_map(|i| match i {
                    Inst::MmioRead { guard_id, .. } | Inst::MmioWrite { guard_id, .. } => {
                        Some(*guard_id)
                    }
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(guard_of(&a, "one"), guard_of(&b, "one"));
        assert_eq!(guard_of(&a, "two"), guard_of(&b, "two"));
    }

    #[test]
    fn test_short_circuit_normalises_once_at_merge() {
        let module = lower("proc main() { let x = 1 && 2; return x; }\n");
        let func = module.find_func("main").unwrap();
        let cmp_count = func
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::Cmp { op: CmpOp::Ne, .. }))
            .count();
        assert_eq!(cmp_count, 1);
        // and the normalisation comes after the merge label
        let merge_pos = func
            .insts
            .iter()
            .rposition(|i| matches!(i, Inst::Label { .. }))
            .unwrap();
        let cmp_pos = func
            .insts
            .iter()
            .position(|i| matches!(i, Inst::Cmp { .. }))
            .unwrap();
        assert!(cmp_pos > merge_pos);
    }

    #[test]
    fn test_mmio_size_must_be_word_multiple() {
        let err = try_lower(
            "mmio region R from 0x1000 size 10;\nproc main() { return 0; }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_slot_index_bounds() {
        let err = try_lower(
            "proc f() { return 1; }\nproc main() { call f() into slot 16; return 0; }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }
}
