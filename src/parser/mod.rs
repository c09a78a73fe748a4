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

mod ast_builder;

use crate::ast::Program;
use crate::errors::CompileError;
use anyhow::Result;
use ast_builder::AstBuilder;
use pest::Parser;
use pest_derive::Parser;

// Derive the parser from our grammar file.
#[derive(Parser)]
#[grammar = "./grammar.pest"]
pub struct LarkParser;

// Main parsing function that takes the entire (canonicalised) source text.
pub fn parse_source(source: &str) -> Result<Program> {
    let pairs = LarkParser::parse(Rule::program, source)
        .map_err(|e| CompileError::PestError(Box::new(e)))?;

    let mut builder = AstBuilder::new();
    builder.build_program(pairs)
}
