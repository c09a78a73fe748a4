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
use serde::Deserialize;
use std::collections::HashSet;

// The syntax description file is a JSON document with three word lists.
// A minimal file (even `{}`) is valid; the built-in core sets below are
// always merged in so the pipeline stays usable.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SyntaxDb {
    #[serde(default)]
    pub keywords: HashSet<String>,
    #[serde(default)]
    pub types: HashSet<String>,
    #[serde(default)]
    pub builtins: HashSet<String>,
}

const CORE_KEYWORDS: &[&str] = &[
    "let", "return", "ret", "proc", "call", "goto", "label", "trap", "halt",
    "into", "from", "slot", "uses", "mmio", "region", "size", "read32",
    "write32", "true", "false", "null", "and", "or", "not", "xor", "shl",
    "shr", "sar",
];

const CORE_TYPES: &[&str] = &[
    "u8", "u16", "u32", "u64", "i8", "i16", "i32", "i64", "bool", "string",
    "void",
];

const CORE_BUILTINS: &[&str] = &["print", "trap", "halt", "read32", "write32"];

impl SyntaxDb {
    /// Parse the syntax description file and merge the built-in core sets.
    pub fn load(text: &str) -> Result<SyntaxDb, CompileError> {
        let mut db: SyntaxDb =
            serde_json::from_str(text).map_err(|e| CompileError::SemanticErrorNoLine {
                reason: format!("Invalid syntax database: {}", e),
            })?;
        db.seed_core();
        Ok(db)
    }

    pub fn seed_core(&mut self) {
        for k in CORE_KEYWORDS {
            self.keywords.insert(k.to_string());
        }
        for t in CORE_TYPES {
            self.types.insert(t.to_string());
        }
        for b in CORE_BUILTINS {
            self.builtins.insert(b.to_string());
        }
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.keywords.contains(word)
    }

    pub fn is_type(&self, word: &str) -> bool {
        self.types.contains(word)
    }

    pub fn is_builtin(&self, word: &str) -> bool {
        self.builtins.contains(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal() {
        let db = SyntaxDb::load("{}").unwrap();
        assert!(db.is_keyword("proc"));
        assert!(db.is_builtin("print"));
        assert!(db.is_type("i64"));
    }

    #[test]
    fn test_load_extends_core() {
        let db = SyntaxDb::load(
            r#"{ "keywords": ["defer"], "types": ["f64"], "builtins": ["send"] }"#,
        )
        .unwrap();
        assert!(db.is_keyword("defer"));
        assert!(db.is_keyword("let"));
        assert!(db.is_type("f64"));
        assert!(db.is_builtin("send"));
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        assert!(SyntaxDb::load(r#"{ "operators": ["+"] }"#).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        assert!(SyntaxDb::load("keywords: let").is_err());
    }
}
