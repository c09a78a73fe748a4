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

use super::ir::{Inst, IrModule};
use std::collections::HashSet;

/// Peephole: adjacent CONST writes to the same destination collapse to the
/// later one.
pub fn coalesce_consts(module: &mut IrModule) {
    for func in &mut module.funcs {
        let mut out: Vec<Inst> = Vec::with_capacity(func.insts.len());
        for inst in func.insts.drain(..) {
            let shadowed = matches!(
                (out.last(), &inst),
                (Some(Inst::Const { dst: prev, .. }), Inst::Const { dst, .. }) if prev == dst
            );
            if shadowed {
                out.pop();
            }
            out.push(inst);
        }
        func.insts = out;
    }
}

/// Dead-instruction removal, to fixed point: an instruction that defines a
/// value nothing references is dropped unless its opcode has observable side
/// effects.
pub fn eliminate_dead_code(module: &mut IrModule) {
    for func in &mut module.funcs {
        loop {
            let mut used: HashSet<u32> = HashSet::new();
            let mut uses = Vec::new();
            for inst in &func.insts {
                uses.clear();
                inst.collect_uses(&mut uses);
                used.extend(uses.iter().copied());
            }

            let before = func.insts.len();
            func.insts.retain(|inst| {
                match inst.def() {
                    Some(dst) => inst.has_side_effect() || used.contains(&dst),
                    None => true,
                }
            });
            if func.insts.len() == before {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{ArithOp, IrFunc, Value};

    fn func_with(insts: Vec<Inst>) -> IrModule {
        let mut func = IrFunc::new("t");
        func.next_value = 16;
        func.insts = insts;
        IrModule {
            funcs: vec![func],
            ..IrModule::default()
        }
    }

    fn ops(module: &IrModule) -> Vec<&Inst> {
        module.funcs[0].insts.iter().collect()
    }

    const A: Value = 0;
    const B: Value = 1;
    const C: Value = 2;

    #[test]
    fn test_adjacent_consts_keep_the_later_write() {
        let mut module = func_with(vec![
            Inst::Const { dst: A, imm: 1 },
            Inst::Const { dst: A, imm: 2 },
            Inst::Ret { value: Some(A) },
        ]);
        coalesce_consts(&mut module);
        assert_eq!(
            ops(&module)[0],
            &Inst::Const { dst: A, imm: 2 }
        );
        assert_eq!(module.funcs[0].insts.len(), 2);
    }

    #[test]
    fn test_consts_to_distinct_values_survive() {
        let mut module = func_with(vec![
            Inst::Const { dst: A, imm: 1 },
            Inst::Const { dst: B, imm: 2 },
        ]);
        coalesce_consts(&mut module);
        assert_eq!(module.funcs[0].insts.len(), 2);
    }

    #[test]
    fn test_dead_define_is_removed() {
        let mut module = func_with(vec![
            Inst::Const { dst: A, imm: 1 },
            Inst::Const { dst: B, imm: 2 },
            Inst::Ret { value: Some(B) },
        ]);
        eliminate_dead_code(&mut module);
        assert_eq!(module.funcs[0].insts.len(), 2);
        assert!(matches!(ops(&module)[0], Inst::Const { dst, .. } if *dst == B));
    }

    #[test]
    fn test_dead_chains_collapse_to_fixed_point() {
        // C feeds nothing; A and B feed only C.
        let mut module = func_with(vec![
            Inst::Const { dst: A, imm: 1 },
            Inst::Const { dst: B, imm: 2 },
            Inst::Arith { op: ArithOp::Add, dst: C, lhs: A, rhs: B },
            Inst::Ret { value: None },
        ]);
        eliminate_dead_code(&mut module);
        assert_eq!(module.funcs[0].insts.len(), 1);
        assert!(matches!(ops(&module)[0], Inst::Ret { value: None }));
    }

    #[test]
    fn test_side_effecting_defines_survive() {
        let mut module = func_with(vec![
            Inst::Call { dst: A, callee: "f".to_string(), args: vec![] },
            Inst::MmioRead {
                dst: B,
                region: "R".to_string(),
                offset: A,
                guard_id: 1,
            },
            Inst::Ret { value: None },
        ]);
        eliminate_dead_code(&mut module);
        assert_eq!(module.funcs[0].insts.len(), 3);
    }

    #[test]
    fn test_print_operand_counts_as_a_use() {
        let mut module = func_with(vec![
            Inst::Const { dst: A, imm: 14 },
            Inst::Print { value: A, trace_id: 1 },
            Inst::Ret { value: None },
        ]);
        eliminate_dead_code(&mut module);
        assert_eq!(module.funcs[0].insts.len(), 3);
    }
}
