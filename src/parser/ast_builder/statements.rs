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

use super::AstBuilder;
use super::utility_functions::{line_of, parse_uint};
use crate::ast::Stmt;
use crate::parser::Rule;
use anyhow::Result;
use pest::iterators::Pair;

impl AstBuilder {
    pub(crate) fn build_stmt(&mut self, pair: Pair<Rule>) -> Result<Stmt> {
        let meta = self.meta_from_pair(&pair);
        let rule = pair.as_rule();

        match rule {
            Rule::let_stmt | Rule::assign_stmt => {
                let mut name = String::new();
                let mut value = None;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ident => name = inner.as_str().to_string(),
                        Rule::ternary => value = Some(self.build_expr(inner)?),
                        _ => {}
                    }
                }
                let value = value.unwrap();
                if rule == Rule::let_stmt {
                    Ok(Stmt::Let { meta, name, init: value })
                } else {
                    Ok(Stmt::Assign { meta, name, value })
                }
            }

            Rule::return_stmt => {
                let expr_pair = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::ternary)
                    .unwrap();
                Ok(Stmt::Return {
                    meta,
                    value: self.build_expr(expr_pair)?,
                })
            }

            Rule::branch_stmt => {
                let mut cond = None;
                let mut labels = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ternary => cond = Some(self.build_expr(inner)?),
                        Rule::ident => labels.push(inner.as_str().to_string()),
                        _ => {}
                    }
                }
                let label_false = labels.pop().unwrap();
                let label_true = labels.pop().unwrap();
                Ok(Stmt::Branch {
                    meta,
                    cond: cond.unwrap(),
                    label_true,
                    label_false,
                })
            }

            Rule::label_kw_stmt | Rule::label_colon_stmt => {
                let name = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::ident)
                    .unwrap()
                    .as_str()
                    .to_string();
                Ok(Stmt::Label { meta, name })
            }

            Rule::trap_stmt => {
                let mut code = None;
                for inner in pair.into_inner() {
                    if inner.as_rule() == Rule::ternary {
                        code = Some(self.build_expr(inner)?);
                    }
                }
                Ok(Stmt::Trap { meta, code })
            }

            Rule::halt_stmt => Ok(Stmt::Halt { meta }),

            Rule::read_stmt => {
                let mut idents = Vec::new();
                let mut offset = None;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ident => idents.push(inner.as_str().to_string()),
                        Rule::ternary => offset = Some(self.build_expr(inner)?),
                        _ => {}
                    }
                }
                let dest = idents.pop().unwrap();
                let region = idents.pop().unwrap();
                Ok(Stmt::Read32 {
                    meta,
                    region,
                    offset: offset.unwrap(),
                    dest,
                })
            }

            Rule::write_stmt => {
                let mut region = String::new();
                let mut exprs = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ident => region = inner.as_str().to_string(),
                        Rule::ternary => exprs.push(self.build_expr(inner)?),
                        _ => {}
                    }
                }
                let value = exprs.pop().unwrap();
                let offset = exprs.pop().unwrap();
                Ok(Stmt::Write32 {
                    meta,
                    region,
                    offset,
                    value,
                })
            }

            Rule::call_slot_stmt => {
                let line = line_of(&pair);
                let mut callee = String::new();
                let mut args = Vec::new();
                let mut slot = 0u32;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ident => callee = inner.as_str().to_string(),
                        Rule::arg_list => {
                            for arg in inner.into_inner() {
                                args.push(self.build_expr(arg)?);
                            }
                        }
                        Rule::number => slot = parse_uint(inner.as_str(), line)?,
                        _ => {}
                    }
                }
                Ok(Stmt::CallIntoSlot {
                    meta,
                    callee,
                    args,
                    slot,
                })
            }

            Rule::expr_stmt => {
                let expr_pair = pair.into_inner().next().unwrap();
                Ok(Stmt::Expr {
                    meta,
                    expr: self.build_expr(expr_pair)?,
                })
            }

            other => unreachable!("Unknown statement rule: {:?}", other),
        }
    }
}
