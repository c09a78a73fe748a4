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

use clap::Parser as clap_parser;
use larkc::compiler::CompileOptions;
use larkc::file_reader::SourceFileReader;
use std::path::PathBuf;

#[derive(clap_parser)]
#[clap(version = "0.1.0", about = "Lark compiler emitting native Windows x64 executables")]
struct Opts {
    /// Syntax description file (keywords, types, builtins) in JSON form
    syntax_db: PathBuf,
    /// Source file to compile
    source: PathBuf,
    /// 0 disables all optimisation, 1 enables the IR passes, 2 and up also
    /// folds constants on the AST
    #[clap(long, default_value_t = 2)]
    opt_level: u8,
    /// The output executable is written to <prefix>.exe
    #[clap(long, default_value = "program")]
    out_prefix: String,
}

fn main() {
    let opts: Opts = Opts::parse();

    // Missing inputs are argument-level errors, distinct from build errors.
    for path in [&opts.syntax_db, &opts.source] {
        if !path.is_file() {
            eprintln!("input file not found: {}", path.display());
            std::process::exit(2);
        }
    }

    let options = CompileOptions {
        opt_level: opts.opt_level,
    };
    let reader = SourceFileReader;
    let out_path = PathBuf::from(format!("{}.exe", opts.out_prefix));

    let result = larkc::compile(&opts.syntax_db, &opts.source, &options, &reader)
        .and_then(|image| larkc::write_image(&out_path, &image).map(|()| image.len()));

    match result {
        Ok(size) => {
            println!(
                "Successfully compiled {} to {} ({} bytes)",
                opts.source.display(),
                out_path.display(),
                size
            );
        }
        Err(error) => {
            eprintln!("fatal: {:#}", error);
            std::process::exit(1);
        }
    }
}
