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

use crate::errors::CompileError;
use crate::parser::Rule;
use anyhow::Result;
use pest::iterators::Pair;

pub fn line_of(pair: &Pair<Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

// Parse a declaration-position numeric literal (mmio base/size, slot index).
// Accepts decimal, 0x..., 0b... and underscore separators.
pub fn parse_uint(text: &str, line: usize) -> Result<u32> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();

    let parsed = if let Some(hex) = cleaned.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = cleaned.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        cleaned.parse::<u64>()
    };

    match parsed {
        Ok(value) if value <= u32::MAX as u64 => Ok(value as u32),
        Ok(_) => Err(CompileError::StructuralError {
            line,
            reason: format!("Numeric literal out of range: {}", text),
        }
        .into()),
        Err(_) => Err(CompileError::StructuralError {
            line,
            reason: format!("Invalid numeric literal: {}", text),
        }
        .into()),
    }
}

// Translate the raw content of a string literal into its byte value.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
