//! CLI entry point: `nyx build|run|execute` (SPEC_FULL §4).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nyx::consts::{DEFAULT_IMAGE_PATH, DEFAULT_MEM_SIZE};
use nyx::prelude::*;
use tracing::error;

#[derive(Parser)]
#[command(name = "nyx", about = "Assembler and interpreter for the Nyx virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a source file to a bytecode image.
    Build {
        file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_IMAGE_PATH)]
        output: PathBuf,
    },
    /// Compile and execute a source file.
    Run {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short = 'l', long = "lib")]
        libraries: Vec<String>,
        #[arg(long = "mem", default_value_t = DEFAULT_MEM_SIZE)]
        mem: usize,
    },
    /// Execute an already-built bytecode image.
    Execute {
        file: PathBuf,
        #[arg(short = 'l', long = "lib")]
        libraries: Vec<String>,
        #[arg(long = "mem", default_value_t = DEFAULT_MEM_SIZE)]
        mem: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Build { file, output } => {
            let image = build_image(&file)?;
            std::fs::write(&output, image).map_err(|e| e.to_string())?;
            Ok(())
        }
        Command::Run { file, output, libraries, mem } => {
            let image = build_image(&file)?;
            if let Some(output) = output {
                std::fs::write(&output, &image).map_err(|e| e.to_string())?;
            }
            execute_image(&image, &libraries, mem)
        }
        Command::Execute { file, libraries, mem } => {
            let image = std::fs::read(&file).map_err(|e| e.to_string())?;
            execute_image(&image, &libraries, mem)
        }
    }
}

/// Lex, parse, preprocess, and assemble `file` into a bytecode image.
fn build_image(file: &PathBuf) -> Result<Vec<u8>, String> {
    let source = std::fs::read_to_string(file).map_err(|e| e.to_string())?;

    let mut interner = Interner::new();
    let file_id = interner.intern(&file.display().to_string());

    let tokens = tokenize(file_id, &source).map_err(|e| render(e.span(), &e, &source, &interner))?;
    let stmts = parse(&tokens, &mut interner)
        .map_err(|e| render(e.span().unwrap_or_else(|| Span::new(file_id, 0, 0)), &e, &source, &interner))?;

    let include_paths = include_search_path(file);
    let fs = RealFs;
    let mut preprocessor = Preprocessor::new(&fs, &include_paths, &mut interner);
    let stmts = preprocessor.run(stmts).map_err(|e| render(e.span(), &e, &source, &interner))?;

    assemble(&stmts, &interner).map_err(|e| render(e.span(), &e, &source, &interner))
}

/// Render a compile-time error as a `filename:line:col: severity: message`
/// diagnostic against the top-level source file (§7). Errors raised while
/// expanding an `#include` are reported at the including span, since only
/// the entry file's text is kept around to compute line/column from.
fn render(span: Span, error: &impl std::fmt::Display, source: &str, interner: &Interner) -> String {
    Diagnostic::error(error.to_string(), span).render(source, interner)
}

/// The directory holding `file`, plus any paths from `NYX_STDLIB_PATH`.
fn include_search_path(file: &PathBuf) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = file.parent() {
        paths.push(dir.to_path_buf());
    }
    if let Ok(stdlib) = std::env::var("NYX_STDLIB_PATH") {
        paths.extend(std::env::split_paths(&stdlib));
    }
    paths
}

fn execute_image(image: &[u8], libraries: &[String], mem: usize) -> Result<(), String> {
    let mut vm = Vm::new(image, mem).map_err(|e| e.to_string())?;
    for path in libraries {
        vm.extensions.load(path).map_err(|e| e.to_string())?;
    }
    vm.run().map_err(|e| e.to_string())
}
