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

pub mod blocks;
pub mod encoder;
pub mod fold;
pub mod ir;
pub mod opt;
pub mod pe;

use crate::ast::{CAP_MMIO, CAP_PRINT, CAP_SLOTS, CAP_TRAP, Expr, Proc, Program, Stmt};
use crate::errors::CompileError;
use crate::stable_id;
use crate::syntax_db::SyntaxDb;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub opt_level: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { opt_level: 2 }
    }
}

/// Run the back-end pipeline over a parsed program and return the finished
/// PE image.
pub fn compile_program(
    canonical_source: &str,
    db: &SyntaxDb,
    program: &mut Program,
    options: &CompileOptions,
) -> Result<Vec<u8>, CompileError> {
    // Pass 0: name, capability and entry-point validation.
    validate_program(program, db)?;

    // Pass 1: AST constant folding.
    if options.opt_level > 0 {
        fold::fold_constants_program(program);
    }

    let seed = stable_id::stable_seed_from_canonical(canonical_source);

    // Pass 2: basic blocks with deterministic IDs.
    let block_program = blocks::partition_program(program, seed)?;

    // Pass 3: linear IR, guard/trace IDs assigned sort-then-number.
    let mut module = ir::lower_program(&block_program, seed)?;

    // Pass 4: IR clean-up.
    if options.opt_level >= 1 {
        opt::coalesce_consts(&mut module);
        opt::eliminate_dead_code(&mut module);
    }

    // Pass 5: machine code, then the image.
    let artifacts = encoder::emit_module(&module)?;
    pe::build_image(artifacts)
}

/// Pass 0: reject duplicate declarations, keyword shadowing, over-long
/// parameter lists and undeclared capability use before any lowering runs.
pub fn validate_program(program: &Program, db: &SyntaxDb) -> Result<(), CompileError> {
    let mut regions: HashSet<&str> = HashSet::new();
    for region in &program.mmio {
        if !regions.insert(region.name.as_str()) {
            return Err(CompileError::SemanticError {
                line: region.meta.span.line as usize,
                reason: format!("Duplicate mmio region definition: {}", region.name),
            });
        }
    }

    let mut names: HashSet<&str> = HashSet::new();
    for proc in &program.procs {
        let line = proc.meta.span.line as usize;
        if !names.insert(proc.name.as_str()) {
            return Err(CompileError::SemanticError {
                line,
                reason: format!("Duplicate proc definition: {}", proc.name),
            });
        }
        check_not_keyword(&proc.name, line, db)?;
        if proc.params.len() > 4 {
            return Err(CompileError::StructuralError {
                line,
                reason: format!(
                    "Proc {} declares {} parameters, at most 4 are supported",
                    proc.name,
                    proc.params.len()
                ),
            });
        }
        for param in &proc.params {
            check_not_keyword(param, line, db)?;
        }
        for stmt in &proc.body {
            let stmt_line = stmt.meta().span.line as usize;
            match stmt {
                Stmt::Let { name, .. }
                | Stmt::Assign { name, .. }
                | Stmt::Read32 { dest: name, .. } => check_not_keyword(name, stmt_line, db)?,
                _ => {}
            }
        }
        check_capabilities(proc)?;
    }

    for proc in &program.procs {
        for stmt in &proc.body {
            for_each_expr(stmt, &mut |expr| check_call_target(expr, &names, db))?;
        }
    }

    if !names.contains("main") {
        return Err(CompileError::SemanticErrorNoLine {
            reason: "Missing proc main()".to_string(),
        });
    }
    Ok(())
}

fn check_not_keyword(name: &str, line: usize, db: &SyntaxDb) -> Result<(), CompileError> {
    if db.is_keyword(name) || db.is_type(name) {
        return Err(CompileError::SemanticError {
            line,
            reason: format!("'{}' is reserved by the syntax database", name),
        });
    }
    Ok(())
}

// A `uses` clause is a promise: everything the body does must be covered.
// Bodies without a clause are unrestricted.
fn check_capabilities(proc: &Proc) -> Result<(), CompileError> {
    let Some(caps) = proc.caps else {
        return Ok(());
    };

    let require = |mask: u32, what: &str, line: usize| -> Result<(), CompileError> {
        if caps & mask == 0 {
            return Err(CompileError::SemanticError {
                line,
                reason: format!(
                    "Proc {} uses '{}' without declaring the capability",
                    proc.name, what
                ),
            });
        }
        Ok(())
    };

    for stmt in &proc.body {
        let line = stmt.meta().span.line as usize;
        match stmt {
            Stmt::Read32 { .. } | Stmt::Write32 { .. } => require(CAP_MMIO, "mmio", line)?,
            Stmt::Trap { .. } => require(CAP_TRAP, "trap", line)?,
            Stmt::CallIntoSlot { args, .. } => {
                require(CAP_SLOTS, "slots", line)?;
                for arg in args {
                    if expr_uses_print(arg) {
                        require(CAP_PRINT, "print", line)?;
                    }
                }
            }
            Stmt::Let { init: e, .. }
            | Stmt::Assign { value: e, .. }
            | Stmt::Expr { expr: e, .. }
            | Stmt::Return { value: e, .. }
            | Stmt::Branch { cond: e, .. } => {
                if expr_uses_print(e) {
                    require(CAP_PRINT, "print", line)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// Call expressions may target a declared procedure or the one builtin that
// works in expression position; any other registered builtin is a statement
// form and gets a pointed error here rather than an "unknown proc" later.
fn check_call_target(
    expr: &Expr,
    proc_names: &HashSet<&str>,
    db: &SyntaxDb,
) -> Result<(), CompileError> {
    let Expr::Call { meta, callee, .. } = expr else {
        return Ok(());
    };
    if callee == "print" || proc_names.contains(callee.as_str()) {
        return Ok(());
    }
    if db.is_builtin(callee) {
        return Err(CompileError::SemanticError {
            line: meta.span.line as usize,
            reason: format!("Builtin '{}' cannot be called in expression position", callee),
        });
    }
    Ok(())
}

fn for_each_expr<F>(stmt: &Stmt, visit: &mut F) -> Result<(), CompileError>
where
    F: FnMut(&Expr) -> Result<(), CompileError>,
{
    fn walk<F>(expr: &Expr, visit: &mut F) -> Result<(), CompileError>
    where
        F: FnMut(&Expr) -> Result<(), CompileError>,
    {
        visit(expr)?;
        match expr {
            Expr::Unary { arg, .. } => walk(arg, visit),
            Expr::Binary { lhs, rhs, .. } => {
                walk(lhs, visit)?;
                walk(rhs, visit)
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
                ..
            } => {
                walk(cond, visit)?;
                walk(then_expr, visit)?;
                walk(else_expr, visit)
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    walk(arg, visit)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    match stmt {
        Stmt::Let { init: e, .. }
        | Stmt::Assign { value: e, .. }
        | Stmt::Expr { expr: e, .. }
        | Stmt::Return { value: e, .. }
        | Stmt::Branch { cond: e, .. }
        | Stmt::Trap { code: Some(e), .. }
        | Stmt::Read32 { offset: e, .. } => walk(e, visit),
        Stmt::Write32 { offset, value, .. } => {
            walk(offset, visit)?;
            walk(value, visit)
        }
        Stmt::CallIntoSlot { args, .. } => {
            for arg in args {
                walk(arg, visit)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn expr_uses_print(expr: &Expr) -> bool {
    match expr {
        Expr::Call { callee, args, .. } => {
            callee == "print" || args.iter().any(expr_uses_print)
        }
        Expr::Unary { arg, .. } => expr_uses_print(arg),
        Expr::Binary { lhs, rhs, .. } => expr_uses_print(lhs) || expr_uses_print(rhs),
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
            ..
        } => expr_uses_print(cond) || expr_uses_print(then_expr) || expr_uses_print(else_expr),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::assign_lexical_paths;
    use crate::compiler::ir::{Inst, IrModule};
    use crate::parser::parse_source;

    fn db() -> SyntaxDb {
        SyntaxDb::load("{}").unwrap()
    }

    fn pipeline_to_ir(source: &str, opt_level: u8) -> IrModule {
        let mut program = parse_source(source).unwrap();
        assign_lexical_paths(&mut program);
        validate_program(&program, &db()).unwrap();
        if opt_level > 0 {
            fold::fold_constants_program(&mut program);
        }
        let seed = stable_id::stable_seed_from_canonical(source);
        let blocks = blocks::partition_program(&program, seed).unwrap();
        let mut module = ir::lower_program(&blocks, seed).unwrap();
        if opt_level >= 1 {
            opt::coalesce_consts(&mut module);
            opt::eliminate_dead_code(&mut module);
        }
        module
    }

    fn compile(source: &str) -> Result<Vec<u8>, CompileError> {
        let mut program = parse_source(source).unwrap();
        assign_lexical_paths(&mut program);
        compile_program(source, &db(), &mut program, &CompileOptions::default())
    }

    #[test]
    fn test_folded_print_reaches_ir_as_a_single_const() {
        // `let x = 2 + 3 * 4; print(x);` folds to one CONST 14 feeding PRINT.
        let module = pipeline_to_ir(
            "proc main() { let x = 2 + 3 * 4; print(x); return 0; }\n",
            2,
        );
        let func = module.find_func("main").unwrap();
        let consts: Vec<i64> = func
            .insts
            .iter()
            .filter_map(|i| match i {
                Inst::Const { imm, .. } => Some(*imm),
                _ => None,
            })
            .collect();
        assert!(consts.contains(&14));
        assert!(
            !func.insts.iter().any(|i| matches!(i, Inst::Arith { .. })),
            "arithmetic survived folding: {:?}",
            func.insts
        );
    }

    #[test]
    fn test_unoptimised_pipeline_keeps_the_multiply() {
        let module = pipeline_to_ir(
            "proc main() { let x = 2 + 3 * 4; print(x); return 0; }\n",
            0,
        );
        let func = module.find_func("main").unwrap();
        assert!(func.insts.iter().any(|i| matches!(i, Inst::Arith { .. })));
    }

    #[test]
    fn test_compile_produces_an_executable_image() {
        let image = compile("proc main() { return 0; }\n").unwrap();
        assert_eq!(&image[0..2], b"MZ");
        assert_eq!(&image[0x80..0x84], b"PE\0\0");
    }

    #[test]
    fn test_missing_main_is_rejected() {
        let err = compile("proc helper() { return 0; }\n").unwrap_err();
        assert!(matches!(err, CompileError::SemanticErrorNoLine { .. }));
    }

    #[test]
    fn test_duplicate_proc_is_rejected() {
        let err = compile("proc main() { return 0; }\nproc main() { return 1; }\n").unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_five_parameters_are_rejected() {
        let err = compile("proc f(a, b, c, d, e) { return 0; }\nproc main() { return 0; }\n")
            .unwrap_err();
        assert!(matches!(err, CompileError::StructuralError { .. }));
    }

    #[test]
    fn test_syntax_db_keywords_cannot_be_shadowed() {
        let mut extended = db();
        extended.keywords.insert("buffer".to_string());
        let mut program =
            parse_source("proc main() { let buffer = 1; return buffer; }\n").unwrap();
        assign_lexical_paths(&mut program);
        let err =
            compile_program("x", &extended, &mut program, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_capability_clause_is_enforced() {
        let err = compile(
            "mmio region R from 0x1000 size 64;\n\
             proc main() uses print { read32 R, 0 into x; return 0; }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_capability_clause_allows_declared_use() {
        compile(
            "mmio region R from 0x1000 size 64;\n\
             proc main() uses print, mmio { read32 R, 0 into x; print(x); return 0; }\n",
        )
        .unwrap();
    }

    #[test]
    fn test_no_clause_means_no_restriction() {
        compile("proc main() { print(1); trap 3; }\n").unwrap();
    }

    #[test]
    fn test_registered_builtin_is_not_an_expression() {
        let mut extended = db();
        extended.builtins.insert("send".to_string());
        let mut program = parse_source("proc main() { let x = send(1); return x; }\n").unwrap();
        assign_lexical_paths(&mut program);
        let err =
            compile_program("x", &extended, &mut program, &CompileOptions::default()).unwrap_err();
        match err {
            CompileError::SemanticError { reason, .. } => assert!(reason.contains("send")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
