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

pub type NodeId = u32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
    pub len: u32,
}

// Slot kinds are frozen discriminants; stable keys fold them, so the values
// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SlotKind {
    ProcParams = 10,
    ProcBody = 12,
    LetInit = 30,
    AssignRhs = 32,
    ReturnExpr = 42,
    CallArgs = 61,
    UnaryArg = 62,
    BinaryLhs = 63,
    BinaryRhs = 64,
    TernaryCond = 65,
    TernaryThen = 66,
    TernaryElse = 67,
    BranchCond = 130,
    MmioOffset = 135,
    MmioValue = 136,
    TrapCode = 137,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub slot: SlotKind,
    pub ordinal: u32,
}

// Identity of a node: stable id, diagnostic span, byte range within the
// canonical source, and the lexical path from the procedure root.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeMeta {
    pub node_id: NodeId,
    pub span: Span,
    pub byte_offset: u32,
    pub byte_len: u32,
    pub path: Vec<PathStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Sar,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LogAnd,
    LogOr,
}

// Integer literals keep their source text; parsing happens during lowering
// so folded subtrees can be rewritten back into literal form.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int {
        meta: NodeMeta,
        text: String,
    },
    Bool {
        meta: NodeMeta,
        value: bool,
    },
    Null {
        meta: NodeMeta,
    },
    Str {
        meta: NodeMeta,
        value: String,
    },
    Ident {
        meta: NodeMeta,
        name: String,
    },
    Unary {
        meta: NodeMeta,
        op: UnOp,
        arg: Box<Expr>,
    },
    Binary {
        meta: NodeMeta,
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        meta: NodeMeta,
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        meta: NodeMeta,
        callee: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn meta(&self) -> &NodeMeta {
        match self {
            Expr::Int { meta, .. }
            | Expr::Bool { meta, .. }
            | Expr::Null { meta }
            | Expr::Str { meta, .. }
            | Expr::Ident { meta, .. }
            | Expr::Unary { meta, .. }
            | Expr::Binary { meta, .. }
            | Expr::Ternary { meta, .. }
            | Expr::Call { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Expr::Int { meta, .. }
            | Expr::Bool { meta, .. }
            | Expr::Null { meta }
            | Expr::Str { meta, .. }
            | Expr::Ident { meta, .. }
            | Expr::Unary { meta, .. }
            | Expr::Binary { meta, .. }
            | Expr::Ternary { meta, .. }
            | Expr::Call { meta, .. } => meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        meta: NodeMeta,
        name: String,
        init: Expr,
    },
    Assign {
        meta: NodeMeta,
        name: String,
        value: Expr,
    },
    Expr {
        meta: NodeMeta,
        expr: Expr,
    },
    Return {
        meta: NodeMeta,
        value: Expr,
    },
    Label {
        meta: NodeMeta,
        name: String,
    },
    // goto (cond) -> label_true, label_false;
    Branch {
        meta: NodeMeta,
        cond: Expr,
        label_true: String,
        label_false: String,
    },
    Trap {
        meta: NodeMeta,
        code: Option<Expr>,
    },
    Halt {
        meta: NodeMeta,
    },
    // read32 REGION, offset into dest;
    Read32 {
        meta: NodeMeta,
        region: String,
        offset: Expr,
        dest: String,
    },
    // write32 REGION, offset, value;
    Write32 {
        meta: NodeMeta,
        region: String,
        offset: Expr,
        value: Expr,
    },
    // call callee(args...) into slot N;
    CallIntoSlot {
        meta: NodeMeta,
        callee: String,
        args: Vec<Expr>,
        slot: u32,
    },
}

impl Stmt {
    pub fn meta(&self) -> &NodeMeta {
        match self {
            Stmt::Let { meta, .. }
            | Stmt::Assign { meta, .. }
            | Stmt::Expr { meta, .. }
            | Stmt::Return { meta, .. }
            | Stmt::Label { meta, .. }
            | Stmt::Branch { meta, .. }
            | Stmt::Trap { meta, .. }
            | Stmt::Halt { meta }
            | Stmt::Read32 { meta, .. }
            | Stmt::Write32 { meta, .. }
            | Stmt::CallIntoSlot { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Stmt::Let { meta, .. }
            | Stmt::Assign { meta, .. }
            | Stmt::Expr { meta, .. }
            | Stmt::Return { meta, .. }
            | Stmt::Label { meta, .. }
            | Stmt::Branch { meta, .. }
            | Stmt::Trap { meta, .. }
            | Stmt::Halt { meta }
            | Stmt::Read32 { meta, .. }
            | Stmt::Write32 { meta, .. }
            | Stmt::CallIntoSlot { meta, .. } => meta,
        }
    }
}

// Capability bits for the optional `uses` clause.
pub const CAP_PRINT: u32 = 1 << 0;
pub const CAP_MMIO: u32 = 1 << 1;
pub const CAP_TRAP: u32 = 1 << 2;
pub const CAP_SLOTS: u32 = 1 << 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Proc {
    pub meta: NodeMeta,
    pub name: String,
    pub params: Vec<String>,
    // None means no clause was written and nothing is restricted.
    pub caps: Option<u32>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MmioRegion {
    pub meta: NodeMeta,
    pub name: String,
    pub base: u32,
    pub size: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Program {
    pub mmio: Vec<MmioRegion>,
    pub procs: Vec<Proc>,
}

// ---------------------------------------------------------------------------
// Lexical path assignment
// ---------------------------------------------------------------------------
//
// Ordinals within a slot are ranks under (byte_offset ascending, byte_len
// descending, node_id ascending). They must never come from the order the
// children were pushed into their container.

fn rank_ordinals(children: &[(u32, u32, NodeId)]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by(|&a, &b| {
        let (ao, al, ai) = children[a];
        let (bo, bl, bi) = children[b];
        ao.cmp(&bo).then(bl.cmp(&al)).then(ai.cmp(&bi))
    });
    let mut ordinals = vec![0u32; children.len()];
    for (rank, &idx) in order.iter().enumerate() {
        ordinals[idx] = rank as u32;
    }
    ordinals
}

fn slot_ordinals<T, F>(children: &[T], key: F) -> Vec<u32>
where
    F: Fn(&T) -> (u32, u32, NodeId),
{
    let keys: Vec<(u32, u32, NodeId)> = children.iter().map(key).collect();
    rank_ordinals(&keys)
}

fn child_path(parent: &[PathStep], slot: SlotKind, ordinal: u32) -> Vec<PathStep> {
    let mut path = parent.to_vec();
    path.push(PathStep { slot, ordinal });
    path
}

fn assign_expr_paths(expr: &mut Expr, path: Vec<PathStep>) {
    expr.meta_mut().path = path.clone();
    match expr {
        Expr::Unary { arg, .. } => {
            assign_expr_paths(arg, child_path(&path, SlotKind::UnaryArg, 0));
        }
        Expr::Binary { lhs, rhs, .. } => {
            assign_expr_paths(lhs, child_path(&path, SlotKind::BinaryLhs, 0));
            assign_expr_paths(rhs, child_path(&path, SlotKind::BinaryRhs, 0));
        }
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
            ..
        } => {
            assign_expr_paths(cond, child_path(&path, SlotKind::TernaryCond, 0));
            assign_expr_paths(then_expr, child_path(&path, SlotKind::TernaryThen, 0));
            assign_expr_paths(else_expr, child_path(&path, SlotKind::TernaryElse, 0));
        }
        Expr::Call { args, .. } => {
            let ordinals = slot_ordinals(args, |a| {
                let m = a.meta();
                (m.byte_offset, m.byte_len, m.node_id)
            });
            for (arg, ordinal) in args.iter_mut().zip(ordinals) {
                assign_expr_paths(arg, child_path(&path, SlotKind::CallArgs, ordinal));
            }
        }
        _ => {}
    }
}

fn assign_stmt_paths(stmt: &mut Stmt, path: Vec<PathStep>) {
    stmt.meta_mut().path = path.clone();
    match stmt {
        Stmt::Let { init, .. } => {
            assign_expr_paths(init, child_path(&path, SlotKind::LetInit, 0));
        }
        Stmt::Assign { value, .. } => {
            assign_expr_paths(value, child_path(&path, SlotKind::AssignRhs, 0));
        }
        Stmt::Expr { expr, .. } => {
            // An expression statement has a single expression child; reuse
            // its own path position rather than inventing a slot for it.
            assign_expr_paths(expr, path);
        }
        Stmt::Return { value, .. } => {
            assign_expr_paths(value, child_path(&path, SlotKind::ReturnExpr, 0));
        }
        Stmt::Branch { cond, .. } => {
            assign_expr_paths(cond, child_path(&path, SlotKind::BranchCond, 0));
        }
        Stmt::Trap { code: Some(code), .. } => {
            assign_expr_paths(code, child_path(&path, SlotKind::TrapCode, 0));
        }
        Stmt::Read32 { offset, .. } => {
            assign_expr_paths(offset, child_path(&path, SlotKind::MmioOffset, 0));
        }
        Stmt::Write32 { offset, value, .. } => {
            assign_expr_paths(offset, child_path(&path, SlotKind::MmioOffset, 0));
            assign_expr_paths(value, child_path(&path, SlotKind::MmioValue, 0));
        }
        Stmt::CallIntoSlot { args, .. } => {
            let ordinals = slot_ordinals(args, |a| {
                let m = a.meta();
                (m.byte_offset, m.byte_len, m.node_id)
            });
            for (arg, ordinal) in args.iter_mut().zip(ordinals) {
                assign_expr_paths(arg, child_path(&path, SlotKind::CallArgs, ordinal));
            }
        }
        _ => {}
    }
}

/// Assign the lexical path of every node, procedure root downwards.
pub fn assign_lexical_paths(program: &mut Program) {
    for proc in &mut program.procs {
        proc.meta.path = Vec::new();
        let ordinals = slot_ordinals(&proc.body, |s| {
            let m = s.meta();
            (m.byte_offset, m.byte_len, m.node_id)
        });
        for (stmt, ordinal) in proc.body.iter_mut().zip(ordinals) {
            assign_stmt_paths(stmt, vec![PathStep { slot: SlotKind::ProcBody, ordinal }]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_at(node_id: NodeId, byte_offset: u32, byte_len: u32) -> NodeMeta {
        NodeMeta {
            node_id,
            span: Span { line: 1, col: byte_offset + 1, len: byte_len },
            byte_offset,
            byte_len,
            path: Vec::new(),
        }
    }

    #[test]
    fn test_ordinals_follow_byte_offset_not_insertion_order() {
        // Children deliberately out of lexical order.
        let keys = [(40, 2, 3), (10, 2, 1), (25, 2, 2)];
        assert_eq!(rank_ordinals(&keys), vec![2, 0, 1]);
    }

    #[test]
    fn test_ordinal_tie_breaks_longer_first_then_node_id() {
        let keys = [(10, 2, 5), (10, 8, 6), (10, 2, 4)];
        // Offset ties: the longer child ranks first, then node id ascending.
        assert_eq!(rank_ordinals(&keys), vec![2, 0, 1]);
    }

    #[test]
    fn test_statement_paths_use_proc_body_slot() {
        let mut program = Program {
            mmio: vec![],
            procs: vec![Proc {
                meta: meta_at(1, 0, 40),
                name: "main".to_string(),
                params: vec![],
                caps: None,
                body: vec![
                    Stmt::Halt { meta: meta_at(2, 20, 5) },
                    Stmt::Halt { meta: meta_at(3, 10, 5) },
                ],
            }],
        };
        assign_lexical_paths(&mut program);
        let body = &program.procs[0].body;
        assert_eq!(
            body[0].meta().path,
            vec![PathStep { slot: SlotKind::ProcBody, ordinal: 1 }]
        );
        assert_eq!(
            body[1].meta().path,
            vec![PathStep { slot: SlotKind::ProcBody, ordinal: 0 }]
        );
    }

    #[test]
    fn test_binary_children_get_lhs_rhs_slots() {
        let lhs = Expr::Int { meta: meta_at(2, 8, 1), text: "1".to_string() };
        let rhs = Expr::Int { meta: meta_at(3, 12, 1), text: "2".to_string() };
        let mut stmt = Stmt::Return {
            meta: meta_at(1, 0, 14),
            value: Expr::Binary {
                meta: meta_at(4, 8, 5),
                op: BinOp::Add,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        };
        assign_stmt_paths(&mut stmt, vec![PathStep { slot: SlotKind::ProcBody, ordinal: 0 }]);
        if let Stmt::Return { value: Expr::Binary { lhs, rhs, .. }, .. } = &stmt {
            assert_eq!(lhs.meta().path.last().unwrap().slot, SlotKind::BinaryLhs);
            assert_eq!(rhs.meta().path.last().unwrap().slot, SlotKind::BinaryRhs);
            assert_eq!(lhs.meta().path.len(), 3);
        } else {
            panic!("unexpected statement shape");
        }
    }
}
