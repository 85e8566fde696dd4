//! Include resolution, conditional pruning, and constant folding (§4.1).
//!
//! A single linear pass over the statement stream, following §9's design
//! note: rather than cloning the definitions/visited-paths tables into a
//! child preprocessor and merging them back, both are held as one shared,
//! mutable pair for the whole run — recursive [`Preprocessor::run`] calls
//! for `#include` already see every definition and visited path made by
//! the time they're reached.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ast::{BinaryOp, Expr, Stmt, UnaryOp};
use crate::error::PreprocessorError;
use crate::lexer::tokenize;
use crate::parser::parse;
use crate::span::{Id, Interner};

/// Abstracts `#include` file access so preprocessing can be exercised
/// without touching the filesystem.
pub trait SourceFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// The real filesystem, used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl SourceFs for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

struct Frame {
    included: bool,
    seen_else: bool,
}

impl Frame {
    fn keep(&self) -> bool {
        if self.seen_else {
            !self.included
        } else {
            self.included
        }
    }
}

/// The preprocessor's running state: definitions, visited include paths,
/// and the search path used to resolve `#include`.
pub struct Preprocessor<'a, F: SourceFs> {
    fs: &'a F,
    include_paths: &'a [PathBuf],
    interner: &'a mut Interner,
    definitions: HashMap<Id, Option<Expr>>,
    visited: HashSet<String>,
}

/// Which architecture/OS identifiers are seeded as presence markers (§4.1).
fn predefined_identifiers() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "__AARCH64__",
        "arm" => "__ARM__",
        _ => "__X86_64__",
    };
    let os = match std::env::consts::OS {
        "macos" => "__MACOS__",
        "windows" => "__WINDOWS__",
        _ => "__LINUX__",
    };
    (arch, os)
}

impl<'a, F: SourceFs> Preprocessor<'a, F> {
    pub fn new(fs: &'a F, include_paths: &'a [PathBuf], interner: &'a mut Interner) -> Self {
        let mut definitions = HashMap::new();
        let (arch, os) = predefined_identifiers();
        for name in [arch, os] {
            let id = interner.intern(name);
            let empty = interner.intern("");
            definitions.insert(id, Some(Expr::StringLiteral(empty)));
        }

        Self {
            fs,
            include_paths,
            interner,
            definitions,
            visited: HashSet::new(),
        }
    }

    pub fn run(&mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>, PreprocessorError> {
        let mut frames: Vec<Frame> = Vec::new();
        let mut out = Vec::new();

        for stmt in stmts {
            match stmt {
                Stmt::IfDef { name, .. } => {
                    let included = self.definitions.contains_key(&name);
                    frames.push(Frame { included, seen_else: false });
                }
                Stmt::IfNDef { name, .. } => {
                    let included = !self.definitions.contains_key(&name);
                    frames.push(Frame { included, seen_else: false });
                }
                Stmt::Else { span } => {
                    let frame = frames.last_mut().ok_or(PreprocessorError::UnmatchedElse(span))?;
                    frame.seen_else = !frame.seen_else;
                }
                Stmt::EndIf { span } => {
                    frames.pop().ok_or(PreprocessorError::UnmatchedEndif(span))?;
                }
                other => {
                    if !frames.iter().all(Frame::keep) {
                        continue;
                    }
                    self.process_active(other, &mut out)?;
                }
            }
        }

        Ok(out)
    }

    fn process_active(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) -> Result<(), PreprocessorError> {
        match stmt {
            Stmt::Define { name, value, span: _ } => {
                let value = value.map(|e| self.substitute(&e)).transpose()?;
                if self.definitions.contains_key(&name) {
                    warn!(name = self.interner.resolve(name), "redefinition of an existing #define");
                }
                self.definitions.insert(name, value);
            }
            Stmt::Include { path, span } => {
                let path_text = self.interner.resolve(path).to_owned();
                let (content, resolved) = self.resolve_include(&path_text, &span)?;
                let file_id = self.interner.intern(&resolved);
                let tokens = tokenize(file_id, &content).map_err(|_| PreprocessorError::IncludeNotFound(path_text.clone(), span.clone()))?;
                let included_stmts = parse(&tokens, self.interner).map_err(|_| PreprocessorError::IncludeNotFound(path_text, span))?;
                let expanded = self.run(included_stmts)?;
                out.extend(expanded);
            }
            Stmt::ErrorDirective { message, span } => {
                let message = self.substitute(&message)?;
                match message {
                    Expr::StringLiteral(id) => {
                        let text = self.interner.resolve(id).to_owned();
                        return Err(PreprocessorError::UserError(text, span));
                    }
                    _ => return Err(PreprocessorError::MalformedErrorDirective(span)),
                }
            }
            Stmt::Label { name, span } => out.push(Stmt::Label { name, span }),
            Stmt::Instruction { mnemonic, operands, span } => {
                let operands = operands.iter().map(|e| self.substitute(e)).collect::<Result<_, _>>()?;
                out.push(Stmt::Instruction { mnemonic, operands, span });
            }
            Stmt::SectionDirective { section, span } => out.push(Stmt::SectionDirective { section, span }),
            Stmt::EntryDirective { target, span } => {
                let target = self.substitute(&target)?;
                out.push(Stmt::EntryDirective { target, span });
            }
            Stmt::AsciiDirective { bytes, span } => out.push(Stmt::AsciiDirective { bytes, span }),
            Stmt::AsciZDirective { bytes, span } => out.push(Stmt::AsciZDirective { bytes, span }),
            Stmt::DataDirective { size, items, span } => {
                let items = items.iter().map(|e| self.substitute(e)).collect::<Result<_, _>>()?;
                out.push(Stmt::DataDirective { size, items, span });
            }
            Stmt::ResbDirective { count, span } => {
                let count = self.substitute(&count)?;
                out.push(Stmt::ResbDirective { count, span });
            }
            Stmt::ExternDirective { name, span } => out.push(Stmt::ExternDirective { name, span }),
            Stmt::IfDef { .. } | Stmt::IfNDef { .. } | Stmt::Else { .. } | Stmt::EndIf { .. } => unreachable!("handled by caller"),
        }
        Ok(())
    }

    fn resolve_include(&mut self, path_text: &str, span: &crate::span::Span) -> Result<(String, String), PreprocessorError> {
        for base in self.include_paths {
            let candidate = base.join(path_text);
            let key = candidate.to_string_lossy().into_owned();
            if let Ok(content) = self.fs.read_to_string(&candidate) {
                if self.visited.contains(&key) {
                    return Err(PreprocessorError::CircularInclude(path_text.to_owned(), span.clone()));
                }
                self.visited.insert(key.clone());
                return Ok((content, key));
            }
        }
        Err(PreprocessorError::IncludeNotFound(path_text.to_owned(), span.clone()))
    }

    /// Expand identifiers to their bound expression (recursively, to a fixed
    /// point) and fold constant binary/unary operators (§4.1).
    fn substitute(&self, expr: &Expr) -> Result<Expr, PreprocessorError> {
        match expr {
            Expr::Identifier(id) => match self.definitions.get(id) {
                Some(Some(bound)) => self.substitute(bound),
                Some(None) | None => Ok(expr.clone()),
            },
            Expr::Address { base, offset } => {
                let base = Box::new(self.substitute(base)?);
                let offset = offset.as_ref().map(|o| self.substitute(o)).transpose()?.map(Box::new);
                Ok(Expr::Address { base, offset })
            }
            Expr::UnaryOp { op, expr } => {
                let inner = self.substitute(expr)?;
                Ok(fold_unary(*op, inner))
            }
            Expr::BinaryOp { op, lhs, rhs } => {
                let lhs = self.substitute(lhs)?;
                let rhs = self.substitute(rhs)?;
                fold_binary(*op, lhs, rhs)
            }
            _ => Ok(expr.clone()),
        }
    }
}

fn fold_unary(op: UnaryOp, expr: Expr) -> Expr {
    match (op, &expr) {
        (UnaryOp::Neg, Expr::IntegerLiteral(v)) => Expr::IntegerLiteral(v.wrapping_neg()),
        (UnaryOp::Neg, Expr::FloatLiteral(v)) => Expr::FloatLiteral(-v),
        (UnaryOp::Not, Expr::IntegerLiteral(v)) => Expr::IntegerLiteral(!v),
        _ => Expr::unary(op, expr),
    }
}

fn fold_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, PreprocessorError> {
    match (&lhs, &rhs) {
        (Expr::IntegerLiteral(a), Expr::IntegerLiteral(b)) => {
            let (a, b) = (*a, *b);
            let folded = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div => {
                    if b == 0 {
                        return Ok(Expr::binary(op, lhs, rhs));
                    }
                    a.wrapping_div(b)
                }
                BinaryOp::Or => a | b,
                BinaryOp::And => a & b,
                BinaryOp::Xor => a ^ b,
            };
            Ok(Expr::IntegerLiteral(folded))
        }
        (Expr::FloatLiteral(a), Expr::FloatLiteral(b)) => {
            let (a, b) = (*a, *b);
            if op.is_bitwise() {
                // span isn't threaded through fold_binary; the assembler's own
                // float/bitwise rejection (§4.2) is the backstop for operand
                // contexts. Callers that need a span-carrying diagnostic here
                // should check `is_bitwise()` before folding.
                return Ok(Expr::binary(op, lhs, rhs));
            }
            let folded = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => unreachable!("bitwise handled above"),
            };
            Ok(Expr::FloatLiteral(folded))
        }
        _ => Ok(Expr::binary(op, lhs, rhs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Id;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemoryFs(RefCell<HashMap<PathBuf, String>>);

    impl MemoryFs {
        fn with(files: &[(&str, &str)]) -> Self {
            let map = files.iter().map(|(k, v)| (PathBuf::from(k), v.to_string())).collect();
            Self(RefCell::new(map))
        }
    }

    impl SourceFs for MemoryFs {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            self.0
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    fn run_source(src: &str, fs: &impl SourceFs, include_paths: &[PathBuf]) -> (Vec<Stmt>, Interner) {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), src).unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let mut pp = Preprocessor::new(fs, include_paths, &mut interner);
        let out = pp.run(stmts).unwrap();
        (out, interner)
    }

    #[test]
    fn conditional_with_define_keeps_the_true_branch() {
        let fs = MemoryFs::default();
        let (stmts, _) = run_source("#define X\n#ifdef X\nmov q0,1\n#else\nmov q0,2\n#endif\nhlt\n", &fs, &[]);
        assert_eq!(stmts.len(), 2);
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => assert_eq!(operands[1], Expr::IntegerLiteral(1)),
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn conditional_without_define_keeps_the_else_branch() {
        let fs = MemoryFs::default();
        let (stmts, _) = run_source("#ifdef X\nmov q0,1\n#else\nmov q0,2\n#endif\nhlt\n", &fs, &[]);
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => assert_eq!(operands[1], Expr::IntegerLiteral(2)),
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn constant_folding_eliminates_binary_op_nodes() {
        let fs = MemoryFs::default();
        let (stmts, _) = run_source("mov q0, 1+2*3\n", &fs, &[]);
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => assert_eq!(operands[1], Expr::IntegerLiteral(7)),
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn define_substitutes_through_identifiers() {
        let fs = MemoryFs::default();
        let (stmts, _) = run_source("#define SIZE 4\nmov q0, SIZE\n", &fs, &[]);
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => assert_eq!(operands[1], Expr::IntegerLiteral(4)),
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn include_splices_statements_and_detects_cycles() {
        let fs = MemoryFs::with(&[("a.asm", "#include \"b.asm\"\n"), ("b.asm", "#include \"a.asm\"\n")]);
        let include_paths = vec![PathBuf::from(".")];
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "#include \"a.asm\"\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let mut pp = Preprocessor::new(&fs, &include_paths, &mut interner);
        assert!(matches!(pp.run(stmts), Err(PreprocessorError::CircularInclude(_, _))));
    }

    #[test]
    fn unmatched_else_and_endif_are_fatal() {
        let fs = MemoryFs::default();
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "#endif\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let mut pp = Preprocessor::new(&fs, &[], &mut interner);
        assert!(matches!(pp.run(stmts), Err(PreprocessorError::UnmatchedEndif(_))));
    }
}
