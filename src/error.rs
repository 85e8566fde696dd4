//! Crate-wide error taxonomy (§7).
//!
//! Compile-time errors (`LexError`, `ParseError`, `PreprocessorError`,
//! `AssemblerError`) carry a [`Span`](crate::span::Span) and are rendered
//! through [`crate::diagnostics`]. Runtime errors bubble out of the
//! fetch-execute loop with no span, since they describe a fault in the
//! running program rather than in the source text.

use thiserror::Error;

use crate::span::Span;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedString(Span),
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char, Span),
    #[error("malformed numeric literal '{0}'")]
    MalformedNumber(String, Span),
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char, Span),
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnterminatedString(span)
            | LexError::InvalidEscape(_, span)
            | LexError::MalformedNumber(_, span)
            | LexError::UnexpectedChar(_, span) => span.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected token, expected {expected}")]
    UnexpectedToken { expected: &'static str, span: Span },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("invalid register name '{0}'")]
    InvalidRegister(String, Span),
    #[error("invalid data size '{0}'")]
    InvalidDataSize(String, Span),
}

impl ParseError {
    /// `None` for `UnexpectedEof`, which has no byte offset to point at.
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::UnexpectedToken { span, .. } => Some(span.clone()),
            ParseError::UnexpectedEof { .. } => None,
            ParseError::InvalidRegister(_, span) | ParseError::InvalidDataSize(_, span) => Some(span.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreprocessorError {
    #[error("circular include: '{0}'")]
    CircularInclude(String, Span),
    #[error("include file not found: '{0}'")]
    IncludeNotFound(String, Span),
    #[error("unmatched #else")]
    UnmatchedElse(Span),
    #[error("unmatched #endif")]
    UnmatchedEndif(Span),
    #[error("{0}")]
    UserError(String, Span),
    #[error("bitwise operator used on floating point operands")]
    FloatBitwiseOp(Span),
    #[error("#define requires a name")]
    MalformedDefine(Span),
    #[error("#error requires a string literal message")]
    MalformedErrorDirective(Span),
}

impl PreprocessorError {
    pub fn span(&self) -> Span {
        match self {
            PreprocessorError::CircularInclude(_, span)
            | PreprocessorError::IncludeNotFound(_, span)
            | PreprocessorError::UnmatchedElse(span)
            | PreprocessorError::UnmatchedEndif(span)
            | PreprocessorError::UserError(_, span)
            | PreprocessorError::FloatBitwiseOp(span)
            | PreprocessorError::MalformedDefine(span)
            | PreprocessorError::MalformedErrorDirective(span) => span.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("undefined label '{0}'")]
    UndefinedLabel(String, Span),
    #[error("invalid fixup width")]
    InvalidFixupWidth(Span),
    #[error("first operand of '{0}' must be a register")]
    ExpectedRegister(&'static str, Span),
    #[error("bitwise operation '{0}' does not support float/double operands")]
    BitwiseOnFloat(&'static str, Span),
    #[error("unsupported operand combination for '{0}'")]
    UnsupportedOperands(&'static str, Span),
    #[error("'{0}' is not declared with .extern")]
    NotExtern(String, Span),
    #[error("unknown instruction mnemonic '{0}'")]
    UnknownMnemonic(String, Span),
}

impl AssemblerError {
    pub fn span(&self) -> Span {
        match self {
            AssemblerError::UndefinedLabel(_, span)
            | AssemblerError::InvalidFixupWidth(span)
            | AssemblerError::ExpectedRegister(_, span)
            | AssemblerError::BitwiseOnFloat(_, span)
            | AssemblerError::UnsupportedOperands(_, span)
            | AssemblerError::NotExtern(_, span)
            | AssemblerError::UnknownMnemonic(_, span) => span.clone(),
        }
    }
}

/// Runtime faults raised from inside the fetch-execute loop (§4.6, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid opcode byte {0:#04x}")]
    InvalidOpcode(u8),
    #[error("instruction pointer out of bounds at {0:#x}")]
    InstructionPointerOutOfBounds(usize),
    #[error("address out of bounds: {0:#x}")]
    AddressOutOfBounds(usize),
    #[error("unknown addressing variant {0:#04x}")]
    UnknownAddressingVariant(u8),
    #[error("unknown syscall index {0:#x}")]
    UnknownSyscall(u64),
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("invalid register byte {0:#04x}")]
    InvalidRegisterByte(u8),
    #[error("invalid data-size byte {0:#04x}")]
    InvalidDataSizeByte(u8),
    #[error("extension symbol not found: '{0}'")]
    ExtensionSymbolNotFound(String),
    #[error("failed to load extension library '{0}': {1}")]
    ExtensionLoadFailed(String, String),
    #[error("invalid free address {0:#x}")]
    InvalidFreeAddress(usize),
}

/// Top-level crate error joining every phase, following the teacher's
/// pattern of a single umbrella error composed via `#[from]`.
#[derive(Debug, Error)]
pub enum NyxError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Preprocessor(#[from] PreprocessorError),
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Io(String),
}
