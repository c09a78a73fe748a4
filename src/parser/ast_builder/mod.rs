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

mod expressions;
mod statements;
mod utility_functions;

use crate::ast::{
    CAP_MMIO, CAP_PRINT, CAP_SLOTS, CAP_TRAP, MmioRegion, NodeId, NodeMeta, Proc, Program,
    Span,
};
use crate::errors::CompileError;
use crate::parser::Rule;
use anyhow::Result;
use pest::iterators::{Pair, Pairs};
use utility_functions::{line_of, parse_uint};

pub struct AstBuilder {
    next_node_id: NodeId,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self { next_node_id: 1 }
    }

    fn alloc_node_id(&mut self) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    pub(crate) fn meta_from_pair(&mut self, pair: &Pair<Rule>) -> NodeMeta {
        let span = pair.as_span();
        let (line, col) = span.start_pos().line_col();
        let byte_len = (span.end() - span.start()) as u32;
        NodeMeta {
            node_id: self.alloc_node_id(),
            span: Span {
                line: line as u32,
                col: col as u32,
                len: byte_len,
            },
            byte_offset: span.start() as u32,
            byte_len,
            path: Vec::new(),
        }
    }

    // Metadata for a node synthesised while folding a binary chain: it spans
    // from the start of the left child to the end of the right child.
    pub(crate) fn meta_between(&mut self, lhs: &NodeMeta, rhs: &NodeMeta) -> NodeMeta {
        let byte_len = rhs.byte_offset + rhs.byte_len - lhs.byte_offset;
        NodeMeta {
            node_id: self.alloc_node_id(),
            span: Span {
                line: lhs.span.line,
                col: lhs.span.col,
                len: byte_len,
            },
            byte_offset: lhs.byte_offset,
            byte_len,
            path: Vec::new(),
        }
    }

    pub fn build_program(&mut self, pairs: Pairs<Rule>) -> Result<Program> {
        let mut program = Program::default();

        for pair in pairs {
            if pair.as_rule() != Rule::program {
                continue;
            }
            for item in pair.into_inner() {
                match item.as_rule() {
                    Rule::mmio_decl => program.mmio.push(self.build_mmio_decl(item)?),
                    Rule::proc_decl => program.procs.push(self.build_proc(item)?),
                    Rule::EOI => {}
                    other => unreachable!("Unknown top-level rule: {:?}", other),
                }
            }
        }

        Ok(program)
    }

    fn build_mmio_decl(&mut self, pair: Pair<Rule>) -> Result<MmioRegion> {
        let meta = self.meta_from_pair(&pair);
        let line = line_of(&pair);
        let mut name = String::new();
        let mut numbers: Vec<u32> = Vec::new();

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::ident => name = inner.as_str().to_string(),
                Rule::number => numbers.push(parse_uint(inner.as_str(), line)?),
                _ => {}
            }
        }

        Ok(MmioRegion {
            meta,
            name,
            base: numbers[0],
            size: numbers[1],
        })
    }

    fn build_proc(&mut self, pair: Pair<Rule>) -> Result<Proc> {
        let meta = self.meta_from_pair(&pair);
        let mut name = String::new();
        let mut params = Vec::new();
        let mut caps = None;
        let mut body = Vec::new();

        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::ident => name = inner.as_str().to_string(),
                Rule::param_list => {
                    for param in inner.into_inner() {
                        params.push(param.as_str().to_string());
                    }
                }
                Rule::uses_clause => caps = Some(self.build_uses_clause(inner)?),
                Rule::kw_proc => {}
                stmt_rule if is_stmt_rule(stmt_rule) => body.push(self.build_stmt(inner)?),
                other => unreachable!("Unknown rule in proc: {:?}", other),
            }
        }

        Ok(Proc {
            meta,
            name,
            params,
            caps,
            body,
        })
    }

    fn build_uses_clause(&mut self, pair: Pair<Rule>) -> Result<u32> {
        let mut caps = 0u32;
        for inner in pair.into_inner() {
            if inner.as_rule() != Rule::ident {
                continue;
            }
            let line = line_of(&inner);
            caps |= match inner.as_str() {
                "print" => CAP_PRINT,
                "mmio" => CAP_MMIO,
                "trap" => CAP_TRAP,
                "slots" => CAP_SLOTS,
                other => {
                    return Err(CompileError::SemanticError {
                        line,
                        reason: format!("Unknown capability: {}", other),
                    }
                    .into());
                }
            };
        }
        Ok(caps)
    }
}

fn is_stmt_rule(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::let_stmt
            | Rule::return_stmt
            | Rule::branch_stmt
            | Rule::label_kw_stmt
            | Rule::label_colon_stmt
            | Rule::trap_stmt
            | Rule::halt_stmt
            | Rule::read_stmt
            | Rule::write_stmt
            | Rule::call_slot_stmt
            | Rule::assign_stmt
            | Rule::expr_stmt
    )
}
