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
use super::utility_functions::unescape;
use crate::ast::{BinOp, Expr, NodeMeta, Span, UnOp};
use crate::parser::Rule;
use anyhow::Result;
use pest::iterators::Pair;

impl AstBuilder {
    pub(crate) fn build_expr(&mut self, pair: Pair<Rule>) -> Result<Expr> {
        match pair.as_rule() {
            Rule::ternary => self.build_ternary(pair),
            Rule::logic_or
            | Rule::logic_and
            | Rule::bit_or
            | Rule::bit_xor
            | Rule::bit_and
            | Rule::equality
            | Rule::relational
            | Rule::shift
            | Rule::additive
            | Rule::multiplicative => self.build_binary_chain(pair),
            Rule::unary => self.build_unary(pair),
            Rule::paren_expr => {
                let inner = pair.into_inner().next().unwrap();
                self.build_expr(inner)
            }
            Rule::call_expr => self.build_call(pair),
            Rule::number => Ok(Expr::Int {
                meta: self.meta_from_pair(&pair),
                text: pair.as_str().to_string(),
            }),
            Rule::boolean => Ok(Expr::Bool {
                meta: self.meta_from_pair(&pair),
                value: pair.as_str() == "true",
            }),
            Rule::null_lit => Ok(Expr::Null {
                meta: self.meta_from_pair(&pair),
            }),
            Rule::string => {
                let meta = self.meta_from_pair(&pair);
                let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
                Ok(Expr::Str {
                    meta,
                    value: unescape(raw),
                })
            }
            Rule::ident => Ok(Expr::Ident {
                meta: self.meta_from_pair(&pair),
                name: pair.as_str().to_string(),
            }),
            other => unreachable!("Unknown expression rule: {:?}", other),
        }
    }

    fn build_ternary(&mut self, pair: Pair<Rule>) -> Result<Expr> {
        let meta = self.meta_from_pair(&pair);
        let mut inner: Vec<Pair<Rule>> = pair.into_inner().collect();

        if inner.len() == 1 {
            return self.build_expr(inner.remove(0));
        }

        let else_pair = inner.pop().unwrap();
        let then_pair = inner.pop().unwrap();
        let cond_pair = inner.pop().unwrap();
        Ok(Expr::Ternary {
            meta,
            cond: Box::new(self.build_expr(cond_pair)?),
            then_expr: Box::new(self.build_expr(then_pair)?),
            else_expr: Box::new(self.build_expr(else_pair)?),
        })
    }

    // Binary tiers all share one shape: operand (operator operand)*, folded
    // left-associatively.
    fn build_binary_chain(&mut self, pair: Pair<Rule>) -> Result<Expr> {
        let mut inner = pair.into_inner();
        let mut lhs = self.build_expr(inner.next().unwrap())?;

        while let Some(op_pair) = inner.next() {
            let op = map_binop(op_pair.as_str());
            let rhs = self.build_expr(inner.next().unwrap())?;
            let meta = self.meta_between(lhs.meta(), rhs.meta());
            lhs = Expr::Binary {
                meta,
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn build_unary(&mut self, pair: Pair<Rule>) -> Result<Expr> {
        let mut ops: Vec<(UnOp, u32, u32, u32)> = Vec::new();
        let mut operand = None;

        for inner in pair.into_inner() {
            if inner.as_rule() == Rule::op_unary {
                let span = inner.as_span();
                let (line, col) = span.start_pos().line_col();
                ops.push((
                    map_unop(inner.as_str()),
                    span.start() as u32,
                    line as u32,
                    col as u32,
                ));
            } else {
                operand = Some(self.build_expr(inner)?);
            }
        }

        let mut expr = operand.unwrap();
        for (op, byte_offset, line, col) in ops.into_iter().rev() {
            let end = expr.meta().byte_offset + expr.meta().byte_len;
            let byte_len = end - byte_offset;
            let meta = NodeMeta {
                node_id: self.alloc_node_id(),
                span: Span {
                    line,
                    col,
                    len: byte_len,
                },
                byte_offset,
                byte_len,
                path: Vec::new(),
            };
            expr = Expr::Unary {
                meta,
                op,
                arg: Box::new(expr),
            };
        }

        Ok(expr)
    }

    fn build_call(&mut self, pair: Pair<Rule>) -> Result<Expr> {
        let meta = self.meta_from_pair(&pair);
        let mut callee = String::new();
        let mut args = Vec::new();

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::ident => callee = inner.as_str().to_string(),
                Rule::arg_list => {
                    for arg in inner.into_inner() {
                        args.push(self.build_expr(arg)?);
                    }
                }
                _ => {}
            }
        }

        Ok(Expr::Call { meta, callee, args })
    }
}

// The word forms are the token-rewriter concern: they reach the AST already
// folded onto the symbolic operators, and a bare `=` lands on equality.
fn map_binop(text: &str) -> BinOp {
    match text {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Mod,
        "&" => BinOp::BitAnd,
        "|" => BinOp::BitOr,
        "^" | "xor" => BinOp::BitXor,
        "<<" | "shl" => BinOp::Shl,
        ">>" | "shr" => BinOp::Shr,
        "sar" => BinOp::Sar,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "==" | "=" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "&&" | "and" => BinOp::LogAnd,
        "||" | "or" => BinOp::LogOr,
        other => unreachable!("Unknown binary operator: {}", other),
    }
}

fn map_unop(text: &str) -> UnOp {
    match text {
        "-" => UnOp::Neg,
        "~" => UnOp::BitNot,
        "!" | "not" => UnOp::Not,
        other => unreachable!("Unknown unary operator: {}", other),
    }
}
