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

use super::ir::parse_int_literal;
use crate::ast::{BinOp, Expr, Proc, Program, Stmt, UnOp};

/// Pass: fold pure integer subtrees in place. One repeat after a productive
/// pass reaches the fixed point for any nesting the recursion left behind.
pub fn fold_constants_program(program: &mut Program) {
    for proc in &mut program.procs {
        let any = fold_constants_in_proc(proc);
        if any {
            fold_constants_in_proc(proc);
        }
    }
}

fn fold_constants_in_proc(proc: &mut Proc) -> bool {
    let mut changed = false;
    for stmt in &mut proc.body {
        match stmt {
            Stmt::Let { init: e, .. }
            | Stmt::Assign { value: e, .. }
            | Stmt::Expr { expr: e, .. }
            | Stmt::Return { value: e, .. }
            | Stmt::Branch { cond: e, .. }
            | Stmt::Trap { code: Some(e), .. }
            | Stmt::Read32 { offset: e, .. } => changed |= fold_constants_in_expr(e),
            Stmt::Write32 { offset, value, .. } => {
                changed |= fold_constants_in_expr(offset);
                changed |= fold_constants_in_expr(value);
            }
            Stmt::CallIntoSlot { args, .. } => {
                for arg in args {
                    changed |= fold_constants_in_expr(arg);
                }
            }
            _ => {}
        }
    }
    changed
}

pub fn fold_constants_in_expr(expr: &mut Expr) -> bool {
    let mut changed = false;

    // Recurse first so literal children are in place before this node folds.
    match expr {
        Expr::Unary { arg, .. } => changed |= fold_constants_in_expr(arg),
        Expr::Binary { lhs, rhs, .. } => {
            changed |= fold_constants_in_expr(lhs);
            changed |= fold_constants_in_expr(rhs);
        }
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
            ..
        } => {
            changed |= fold_constants_in_expr(cond);
            changed |= fold_constants_in_expr(then_expr);
            changed |= fold_constants_in_expr(else_expr);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                changed |= fold_constants_in_expr(arg);
            }
        }
        _ => {}
    }

    if let Expr::Unary { meta, op, arg } = expr {
        if let Expr::Int { text, .. } = arg.as_ref() {
            let v = parse_int_literal(text);
            let folded = match op {
                UnOp::Neg => v.wrapping_neg(),
                UnOp::BitNot => !v,
                UnOp::Not => (v == 0) as i64,
            };
            *expr = Expr::Int {
                meta: meta.clone(),
                text: folded.to_string(),
            };
            return true;
        }
    }

    if let Expr::Binary { meta, op, lhs, rhs } = expr {
        if let (Expr::Int { text: lt, .. }, Expr::Int { text: rt, .. }) =
            (lhs.as_ref(), rhs.as_ref())
        {
            if let Some(folded) = eval_binary_int(*op, parse_int_literal(lt), parse_int_literal(rt))
            {
                *expr = Expr::Int {
                    meta: meta.clone(),
                    text: folded.to_string(),
                };
                return true;
            }
        }
    }

    changed
}

// Host 64-bit wrapping arithmetic; division and modulo by zero fold to zero
// rather than trapping. Short-circuit operators keep their control flow and
// are never folded here.
fn eval_binary_int(op: BinOp, a: i64, b: i64) -> Option<i64> {
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                0
            } else {
                a.wrapping_rem(b)
            }
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => ((a as u64).wrapping_shr(b as u32)) as i64,
        BinOp::Sar => a.wrapping_shr(b as u32),
        BinOp::Eq => (a == b) as i64,
        BinOp::Ne => (a != b) as i64,
        BinOp::Lt => (a < b) as i64,
        BinOp::Le => (a <= b) as i64,
        BinOp::Gt => (a > b) as i64,
        BinOp::Ge => (a >= b) as i64,
        BinOp::LogAnd | BinOp::LogOr => return None,
    };
    Some(v)
}
