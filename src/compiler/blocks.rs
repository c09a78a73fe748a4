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

//! Pass: split every procedure body into basic blocks and give each block a
//! deterministic ID. Block order stays source order; only the IDs come from
//! the sorted stable keys, so reordering unrelated code cannot renumber a
//! block that did not move.

use crate::ast::{Expr, MmioRegion, NodeMeta, PathStep, Program, SlotKind, Stmt};
use crate::errors::CompileError;
use crate::stable_id::{
    self, BlockCandidate, RULE_BLOCK_ENTRY, best_key_for_node, key_from_lexical_path, sym_id,
};
use std::collections::HashMap;

// Block sub-kinds mixed into the role tag.
const BLOCK_KIND_BODY: u16 = 0;
const BLOCK_KIND_ENTRY: u16 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump { target: String },
    Branch {
        cond: Expr,
        label_true: String,
        label_false: String,
    },
    Trap { code: Option<Expr> },
    Halt,
    Return { value: Expr },
    // Synthesised when a body falls off its end without a return.
    ImplicitReturn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: u32,
    pub debug_label: String,
    pub user_label: Option<String>,
    pub entry_meta: NodeMeta,
    pub stmts: Vec<Stmt>,
    pub terminator: Terminator,
}

impl Block {
    /// The name later stages jump to. User labels and synthetic block names
    /// live in separate sub-namespaces so they can never collide.
    pub fn label_name(&self) -> String {
        match &self.user_label {
            Some(name) => format!("u${}", name),
            None => format!("b${}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockProc {
    pub meta: NodeMeta,
    pub name: String,
    pub params: Vec<String>,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockProgram {
    pub mmio: Vec<MmioRegion>,
    pub procs: Vec<BlockProc>,
}

// A block under construction; the terminator arrives when the block closes.
struct OpenBlock {
    user_label: Option<String>,
    entry_meta: Option<NodeMeta>,
    stmts: Vec<Stmt>,
}

impl OpenBlock {
    fn new(user_label: Option<String>, entry_meta: Option<NodeMeta>) -> Self {
        Self {
            user_label,
            entry_meta,
            stmts: Vec::new(),
        }
    }

    fn note_entry(&mut self, meta: &NodeMeta) {
        if self.entry_meta.is_none() {
            self.entry_meta = Some(meta.clone());
        }
    }

    fn close(self, fallback_meta: &NodeMeta, terminator: Terminator) -> Block {
        Block {
            id: 0,
            debug_label: String::new(),
            user_label: self.user_label,
            entry_meta: self.entry_meta.unwrap_or_else(|| fallback_meta.clone()),
            stmts: self.stmts,
            terminator,
        }
    }
}

pub fn partition_program(program: &Program, seed: u64) -> Result<BlockProgram, CompileError> {
    let mut out = BlockProgram {
        mmio: program.mmio.clone(),
        procs: Vec::new(),
    };

    for proc in &program.procs {
        let mut blocks: Vec<Block> = Vec::new();
        let mut current = OpenBlock::new(None, Some(proc.meta.clone()));
        let mut seen_labels: HashMap<String, usize> = HashMap::new();

        for stmt in &proc.body {
            match stmt {
                Stmt::Label { meta, name } => {
                    if seen_labels
                        .insert(name.clone(), meta.span.line as usize)
                        .is_some()
                    {
                        return Err(CompileError::SemanticError {
                            line: meta.span.line as usize,
                            reason: format!("Duplicate label definition: {}", name),
                        });
                    }
                    // Fall through into the labelled block. An anonymous
                    // block that never collected a statement (the gap right
                    // after a terminator) is dropped rather than emitted as a
                    // dead jump; the designated entry block always survives.
                    let dead_fill = current.stmts.is_empty()
                        && current.user_label.is_none()
                        && !blocks.is_empty();
                    if !dead_fill {
                        let target = format!("u${}", name);
                        blocks.push(current.close(&proc.meta, Terminator::Jump { target }));
                    }
                    current = OpenBlock::new(Some(name.clone()), Some(meta.clone()));
                }
                Stmt::Branch {
                    meta,
                    cond,
                    label_true,
                    label_false,
                } => {
                    current.note_entry(meta);
                    let terminator = Terminator::Branch {
                        cond: cond.clone(),
                        label_true: format!("u${}", label_true),
                        label_false: format!("u${}", label_false),
                    };
                    blocks.push(current.close(&proc.meta, terminator));
                    current = OpenBlock::new(None, None);
                }
                Stmt::Return { meta, value } => {
                    current.note_entry(meta);
                    blocks.push(current.close(
                        &proc.meta,
                        Terminator::Return { value: value.clone() },
                    ));
                    current = OpenBlock::new(None, None);
                }
                Stmt::Trap { meta, code } => {
                    current.note_entry(meta);
                    blocks
                        .push(current.close(&proc.meta, Terminator::Trap { code: code.clone() }));
                    current = OpenBlock::new(None, None);
                }
                Stmt::Halt { meta } => {
                    current.note_entry(meta);
                    blocks.push(current.close(&proc.meta, Terminator::Halt));
                    current = OpenBlock::new(None, None);
                }
                other => {
                    current.note_entry(other.meta());
                    current.stmts.push(other.clone());
                }
            }
        }

        // Close the trailing block. A leftover anonymous empty block after a
        // terminator is dropped; everything else returns implicitly.
        let trailing_is_relevant = !current.stmts.is_empty()
            || current.user_label.is_some()
            || blocks.is_empty();
        if trailing_is_relevant {
            blocks.push(current.close(&proc.meta, Terminator::ImplicitReturn));
        }

        // Every branch target must name a labelled block in this procedure.
        for block in &blocks {
            if let Terminator::Branch {
                label_true,
                label_false,
                ..
            } = &block.terminator
            {
                for target in [label_true, label_false] {
                    let user = target.trim_start_matches("u$");
                    if !seen_labels.contains_key(user) {
                        return Err(CompileError::SemanticError {
                            line: block.entry_meta.span.line as usize,
                            reason: format!("Undefined label: {}", user),
                        });
                    }
                }
            }
        }

        assign_block_ids(proc.name.as_str(), &mut blocks, seed);

        out.procs.push(BlockProc {
            meta: proc.meta.clone(),
            name: proc.name.clone(),
            params: proc.params.clone(),
            blocks,
        });
    }

    Ok(out)
}

fn assign_block_ids(proc_name: &str, blocks: &mut [Block], seed: u64) {
    let fn_sym = sym_id(proc_name);
    let mut candidates: Vec<BlockCandidate> = blocks
        .iter()
        .enumerate()
        .map(|(index, block)| {
            let meta = &block.entry_meta;
            // The designated entry block is keyed on the body root itself, so
            // its identity survives declaration reordering even when it holds
            // no statements of its own.
            let key = if index == 0 {
                let body_root = [PathStep { slot: SlotKind::ProcBody, ordinal: 0 }];
                key_from_lexical_path(
                    seed,
                    fn_sym,
                    &body_root,
                    RULE_BLOCK_ENTRY,
                    stable_id::role_tag_block(BLOCK_KIND_ENTRY),
                )
            } else {
                best_key_for_node(
                    seed,
                    fn_sym,
                    RULE_BLOCK_ENTRY,
                    stable_id::role_tag_block(BLOCK_KIND_BODY),
                    meta.node_id,
                    &meta.path,
                    meta.span,
                    meta.byte_offset,
                    0,
                )
            };
            BlockCandidate {
                key,
                fn_sym,
                entry_span: meta.span,
                block_index: index,
                assigned: 0,
            }
        })
        .collect();

    stable_id::assign_block_ids_sorted(&mut candidates);

    for candidate in candidates {
        let block = &mut blocks[candidate.block_index];
        block.id = candidate.assigned;
        block.debug_label = format!("bb{}", candidate.assigned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn partition(source: &str) -> BlockProgram {
        let mut program = parse_source(source).unwrap();
        crate::ast::assign_lexical_paths(&mut program);
        partition_program(&program, 42).unwrap()
    }

    #[test]
    fn test_single_block_body() {
        let bp = partition("proc main() { let x = 1; return x; }\n");
        let blocks = &bp.procs[0].blocks;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].stmts.len(), 1);
        assert!(matches!(blocks[0].terminator, Terminator::Return { .. }));
    }

    #[test]
    fn test_every_block_ends_with_a_terminator() {
        let bp = partition(
            "proc main() { let x = 0; label top; x = x + 1; goto (x < 3) -> top, done; label done; halt; }\n",
        );
        let blocks = &bp.procs[0].blocks;
        assert_eq!(blocks.len(), 3);
        assert!(matches!(blocks[0].terminator, Terminator::Jump { .. }));
        assert!(matches!(blocks[1].terminator, Terminator::Branch { .. }));
        assert!(matches!(blocks[2].terminator, Terminator::Halt));
        assert_eq!(blocks[1].user_label.as_deref(), Some("top"));
        assert_eq!(blocks[2].user_label.as_deref(), Some("done"));
    }

    #[test]
    fn test_missing_return_synthesises_one() {
        let bp = partition("proc main() { let x = 1; }\n");
        assert!(matches!(
            bp.procs[0].blocks[0].terminator,
            Terminator::ImplicitReturn
        ));
    }

    #[test]
    fn test_block_ids_are_debug_labelled() {
        let bp = partition("proc main() { label a; halt; }\n");
        let blocks = &bp.procs[0].blocks;
        let mut ids: Vec<u32> = blocks.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
        for block in blocks {
            assert_eq!(block.debug_label, format!("bb{}", block.id));
        }
    }

    #[test]
    fn test_gap_after_a_branch_emits_no_filler_block() {
        let bp = partition(
            "proc main() { goto (1) -> a, a; label a; halt; }\n",
        );
        let blocks = &bp.procs[0].blocks;
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0].terminator, Terminator::Branch { .. }));
        assert_eq!(blocks[1].user_label.as_deref(), Some("a"));
    }

    #[test]
    fn test_duplicate_label_is_rejected() {
        let mut program = parse_source("proc main() { label a; label a; halt; }\n").unwrap();
        crate::ast::assign_lexical_paths(&mut program);
        let err = partition_program(&program, 42).unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_undefined_branch_target_is_rejected() {
        let mut program = parse_source("proc main() { goto (1) -> a, b; }\n").unwrap();
        crate::ast::assign_lexical_paths(&mut program);
        let err = partition_program(&program, 42).unwrap_err();
        assert!(matches!(err, CompileError::SemanticError { .. }));
    }

    #[test]
    fn test_ids_stable_under_proc_reordering() {
        let a = partition("proc one() { label a; halt; }\nproc two() { label b; halt; }\n");
        let b = partition("proc two() { label b; halt; }\nproc one() { label a; halt; }\n");
        let find = |bp: &BlockProgram, name: &str| -> Vec<(Option<String>, u32)> {
            bp.procs
                .iter()
                .find(|p| p.name == name)
                .unwrap()
                .blocks
                .iter()
                .map(|blk| (blk.user_label.clone(), blk.id))
                .collect()
        };
        assert_eq!(find(&a, "one"), find(&b, "one"));
        assert_eq!(find(&a, "two"), find(&b, "two"));
    }
}
