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

//! Deterministic ID allocation for guards, trace points and basic blocks.
//!
//! Same input, same IDs, byte for byte, across machines and runs, and
//! resilient to reordering of unrelated code. Every ID is derived from a
//! stable key plus a stable seed; nothing increments a counter while walking
//! a container. Candidates are buffered during a pass and numbered only
//! after sorting by key, so collisions resolve deterministically too.

use crate::ast::{NodeId, PathStep, Span};

// ---------------------------------------------------------------------------
// FNV-1a 64-bit and the canonical source seed
// ---------------------------------------------------------------------------

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Canonical surface text: CRLF normalised to LF, trailing whitespace
/// stripped per line, exactly one final newline.
pub fn canonicalise_source(raw: &str) -> String {
    let normalised = raw.replace("\r\n", "\n");
    let mut out = String::with_capacity(normalised.len());
    for line in normalised.split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    // split() yields one extra empty segment for a trailing newline
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

pub fn stable_seed_from_canonical(canonical: &str) -> u64 {
    fnv1a64(canonical.as_bytes())
}

/// Procedure symbols are identified by a content hash of the name, so the
/// identity of a procedure does not move when declarations are reordered.
pub fn sym_id(name: &str) -> u32 {
    fnv1a64(name.as_bytes()) as u32
}

// ---------------------------------------------------------------------------
// Stable keys
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StableKey {
    pub hi: u64,
    pub lo: u64,
}

// Simple mixing; not cryptographic, just stable.
pub fn mix_key(a: u64, b: u64, c: u64, d: u64) -> StableKey {
    StableKey {
        hi: a.wrapping_mul(0x9E3779B185EBCA87) ^ c.wrapping_add(0xD6E8FEB86659FD93),
        lo: b.wrapping_mul(0xC2B2AE3D27D4EB4F) ^ d.wrapping_add(0x165667B19E3779F9),
    }
}

fn fold_path(path: &[PathStep]) -> u64 {
    let mut hp: u64 = 1469598103934665603;
    for step in path {
        let words = [step.slot as u16 as u32, step.ordinal];
        for word in words {
            hp ^= fnv1a64(&word.to_le_bytes());
            hp = hp.wrapping_mul(1099511628211);
        }
    }
    hp
}

/// Layer 2: key from the lexical path, resilient to reordering of unrelated
/// code.
pub fn key_from_lexical_path(
    stable_seed: u64,
    fn_sym: u32,
    path: &[PathStep],
    rule_id: u32,
    role_tag: u32,
) -> StableKey {
    let h1 = stable_seed ^ ((fn_sym as u64) << 32) ^ rule_id as u64;
    let h2 = 0xA5A5A5A5A5A5A5A5u64 ^ role_tag as u64;
    let hp = fold_path(path);
    mix_key(h1, h2, hp, ((fn_sym as u64) << 1) ^ stable_seed)
}

/// Layer 3: span-hash fallback; least stable but still deterministic.
pub fn key_from_span(
    stable_seed: u64,
    fn_sym: u32,
    span: Span,
    rule_id: u32,
    role_tag: u32,
    neighbourhood_hint: u64,
) -> StableKey {
    let a = stable_seed ^ ((fn_sym as u64) << 32) ^ rule_id as u64;
    let b = ((span.line as u64) << 32) ^ span.col as u64;
    let c = ((span.len as u64) << 32) ^ role_tag as u64;
    let d = neighbourhood_hint ^ (fn_sym as u64).wrapping_mul(0x9E3779B185EBCA87);
    mix_key(a, b, c, d)
}

/// Build a key using the best available stability layer: the lexical path
/// when the front end supplied a valid one, the node id treated as a
/// one-element path otherwise, and the span hash as the last resort.
pub fn best_key_for_node(
    stable_seed: u64,
    fn_sym: u32,
    rule_id: u32,
    role_tag: u32,
    node_id: NodeId,
    path: &[PathStep],
    span: Span,
    byte_offset: u32,
    neighbourhood_hint: u64,
) -> StableKey {
    if !path.is_empty() && byte_offset != 0 {
        return key_from_lexical_path(stable_seed, fn_sym, path, rule_id, role_tag);
    }
    if node_id != 0 {
        let step = [PathStep {
            slot: crate::ast::SlotKind::ProcBody,
            ordinal: node_id,
        }];
        return key_from_lexical_path(stable_seed, fn_sym, &step, rule_id, role_tag);
    }
    key_from_span(stable_seed, fn_sym, span, rule_id, role_tag, neighbourhood_hint)
}

// ---------------------------------------------------------------------------
// Role tags and rule ids (frozen constants)
// ---------------------------------------------------------------------------

pub const ROLE_GUARD: u32 = 0x4741_5244; // 'GARD'
pub const ROLE_TRACE: u32 = 0x5452_4143; // 'TRAC'
pub const ROLE_BLOCK: u32 = 0x424C_4B21; // 'BLK!'

pub fn role_tag_guard(guard_kind: u16) -> u32 {
    ROLE_GUARD ^ ((guard_kind as u32) << 16)
}

pub fn role_tag_trace(trace_kind: u16) -> u32 {
    ROLE_TRACE ^ ((trace_kind as u32) << 16)
}

pub fn role_tag_block(block_kind: u16) -> u32 {
    ROLE_BLOCK ^ ((block_kind as u32) << 16)
}

pub const RULE_MMIO_ALIGN: u32 = 1;
pub const RULE_PRINT_TRACE: u32 = 2;
pub const RULE_BLOCK_ENTRY: u32 = 3;

pub const GUARD_KIND_READ: u16 = 1;
pub const GUARD_KIND_WRITE: u16 = 2;

// ---------------------------------------------------------------------------
// Candidate buffering and rank-after-sort assignment
// ---------------------------------------------------------------------------

/// Where an ID lands once the IR exists. IDs are assigned before or during
/// lowering and never change; the anchor is patched in afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrAnchor {
    pub func: usize,
    pub inst: usize,
}

#[derive(Debug, Clone)]
pub struct IdCandidate {
    pub key: StableKey,
    pub fn_sym: u32,
    pub span: Span,
    pub rule_id: u32,
    pub role_tag: u32,
    pub node_id: NodeId,
    pub anchor: IrAnchor,
    pub assigned: u32,
}

/// Sort candidates by (key, fn, line, col, len, rule, role, node) and number
/// them sequentially from `start_at`.
pub fn assign_ids_sorted(candidates: &mut [IdCandidate], start_at: u32) {
    candidates.sort_by_key(|c| {
        (
            c.key,
            c.fn_sym,
            c.span.line,
            c.span.col,
            c.span.len,
            c.rule_id,
            c.role_tag,
            c.node_id,
        )
    });
    let mut next = start_at;
    for candidate in candidates {
        candidate.assigned = next;
        next += 1;
    }
}

#[derive(Debug, Clone)]
pub struct BlockCandidate {
    pub key: StableKey,
    pub fn_sym: u32,
    pub entry_span: Span,
    pub block_index: usize,
    pub assigned: u32,
}

/// Blocks are numbered 0..N-1 per procedure by the same sort-then-number
/// scheme, keyed on the entry position.
pub fn assign_block_ids_sorted(blocks: &mut [BlockCandidate]) {
    blocks.sort_by_key(|b| {
        (
            b.key,
            b.fn_sym,
            b.entry_span.line,
            b.entry_span.col,
            b.entry_span.len,
        )
    });
    for (bb, block) in blocks.iter_mut().enumerate() {
        block.assigned = bb as u32;
    }
}
