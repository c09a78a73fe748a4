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

//! Frame and call-site planning for the Windows x64 ABI.
//!
//! Every call site reserves the mandatory 32-byte shadow space and keeps RSP
//! 16-byte aligned at the `call` instruction itself. With the standard
//! `push rbp` prologue and a 16-aligned frame, RSP sits at 0 mod 16 through
//! the body, so the pad works out to shadow + rounded stack args + a fix of
//! 0 or 8.

pub const SHADOW_SPACE_BYTES: u32 = 32;

pub fn align_up(x: u32, a: u32) -> u32 {
    (x + (a - 1)) & !(a - 1)
}

/// Bytes of frame to reserve for a function with `value_count` virtual
/// values, 8 bytes each, kept 16-aligned.
pub fn frame_size(value_count: u32) -> u32 {
    align_up(value_count * 8, 16).max(16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub shadow_and_align: u32,
    pub align_fix: u32,
    pub stack_args_rounded: u32,
}

impl CallSite {
    /// Compute the sub/add pad for one call: `current_rsp_mod16` is RSP % 16
    /// just before the pad is subtracted, `stack_args_bytes` the stack-passed
    /// argument bytes beyond RCX/RDX/R8/R9.
    pub fn plan(current_rsp_mod16: u32, stack_args_bytes: u32) -> CallSite {
        let stack_args_rounded = align_up(stack_args_bytes, 8);
        let base = SHADOW_SPACE_BYTES + stack_args_rounded;
        let base_mod = base & 15;

        let fits = |fix: u32| ((base_mod + (fix & 15)) & 15) == (current_rsp_mod16 & 15);
        let align_fix = if fits(0) {
            0
        } else if fits(8) {
            8
        } else {
            ((current_rsp_mod16 & 15) + 16 - base_mod) & 15
        };

        CallSite {
            shadow_and_align: base + align_fix,
            align_fix,
            stack_args_rounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 512), 512);
    }

    #[test]
    fn test_frame_size_rounds_to_sixteen() {
        assert_eq!(frame_size(0), 16);
        assert_eq!(frame_size(1), 16);
        assert_eq!(frame_size(2), 16);
        assert_eq!(frame_size(3), 32);
    }

    #[test]
    fn test_plain_call_from_aligned_body_needs_only_shadow() {
        let cs = CallSite::plan(0, 0);
        assert_eq!(cs.shadow_and_align, 32);
        assert_eq!(cs.align_fix, 0);
    }

    #[test]
    fn test_rsp_only_prologue_with_stack_args() {
        // Entry RSP is 8 mod 16 after the call pushed a return address; an
        // RSP-only prologue keeps it there. Three stack args -> 24 bytes.
        let cs = CallSite::plan(8, 24);
        assert_eq!(cs.stack_args_rounded, 24);
        assert_eq!(cs.align_fix, 0);
        assert_eq!(cs.shadow_and_align, 56);
    }

    #[test]
    fn test_alignment_holds_at_the_call() {
        for rsp_mod in [0u32, 8] {
            for args in [0u32, 8, 16, 24, 40] {
                let cs = CallSite::plan(rsp_mod, args);
                assert!(cs.shadow_and_align >= SHADOW_SPACE_BYTES);
                assert_eq!((rsp_mod + 16 - (cs.shadow_and_align & 15)) & 15, 0,
                    "rsp mod16 {} args {}", rsp_mod, args);
            }
        }
    }
}
