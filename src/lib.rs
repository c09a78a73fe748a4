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

pub mod ast;
pub mod compiler;
pub mod errors;
pub mod file_reader;
pub mod parser;
pub mod stable_id;
pub mod syntax_db;

use anyhow::{Context, Result};
use compiler::CompileOptions;
use file_reader::FileReader;
use std::fs;
use std::path::Path;

extern crate pest;
extern crate pest_derive;

pub fn compile<F: FileReader>(
    syntax_path: &Path,
    source_path: &Path,
    options: &CompileOptions,
    reader: &F,
) -> Result<Vec<u8>> {
    let syntax_text = reader
        .read_to_string(syntax_path)
        .with_context(|| format!("Failed to read syntax database: {}", syntax_path.display()))?;
    let db = syntax_db::SyntaxDb::load(&syntax_text)
        .context("Failed during syntax database loading")?;

    let raw_source = reader
        .read_to_string(source_path)
        .with_context(|| format!("Failed to read source file: {}", source_path.display()))?;
    // The canonical surface seeds the stable IDs and is what gets parsed.
    let canonical = stable_id::canonicalise_source(&raw_source);

    let mut program = parser::parse_source(&canonical).context("Failed during parsing stage")?;
    ast::assign_lexical_paths(&mut program);

    let image = compiler::compile_program(&canonical, &db, &mut program, options)
        .context("Failed during compilation")?;

    Ok(image)
}

/// Write the image through a temporary file and rename it into place, so a
/// failed build never leaves a truncated executable behind.
pub fn write_image(path: &Path, image: &[u8]) -> Result<()> {
    let tmp = path.with_extension("exe.tmp");
    fs::write(&tmp, image)
        .with_context(|| format!("Failed to write output: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move output into place: {}", path.display()))?;
    Ok(())
}
