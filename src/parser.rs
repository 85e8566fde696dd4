//! Recursive-descent parser producing [`ast::Stmt`] values (§3).
//!
//! Paired with [`crate::lexer`] as the minimal stand-in for the external
//! lexer/parser collaborators named out of scope in §1.

use crate::ast::{BinaryOp, Expr, Section, Stmt, UnaryOp};
use crate::error::ParseError;
use crate::immediate::DataSize;
use crate::lexer::{Token, TokenKind};
use crate::register::Register;
use crate::span::{Interner, Span};

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    interner: &'a mut Interner,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], interner: &'a mut Interner) -> Self {
        Self { tokens, pos: 0, interner }
    }

    pub fn parse_program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut statements = Vec::new();
        self.skip_newlines();

        while !self.at_eof() {
            statements.push(self.parse_statement()?);
            self.expect_statement_end()?;
        }

        Ok(statements)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek().kind, TokenKind::Newline) {
            self.pos += 1;
        }
    }

    fn expect_statement_end(&mut self) -> Result<(), ParseError> {
        if self.at_eof() {
            return Ok(());
        }
        if !matches!(self.peek().kind, TokenKind::Newline) {
            return Err(ParseError::UnexpectedToken {
                expected: "end of line",
                span: self.peek().span.clone(),
            });
        }
        self.skip_newlines();
        Ok(())
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        token
    }

    fn expect_ident(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.advance() {
            Token { kind: TokenKind::Ident(s), .. } => Ok(s),
            t => Err(ParseError::UnexpectedToken { expected, span: t.span }),
        }
    }

    fn expect_str(&mut self, expected: &'static str) -> Result<(String, Span), ParseError> {
        match self.advance() {
            Token { kind: TokenKind::Str(s), span } => Ok((s, span)),
            t => Err(ParseError::UnexpectedToken { expected, span: t.span }),
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Span, ParseError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(token.span)
        } else {
            Err(ParseError::UnexpectedToken { expected, span: token.span })
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        match &self.peek().kind {
            TokenKind::Hash => self.parse_hash_directive(),
            TokenKind::Dot => self.parse_dot_directive(),
            TokenKind::Ident(name) => {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    "db" | "dw" | "dd" | "dq" => self.parse_data_directive(&lower),
                    "resb" => self.parse_resb(),
                    _ => {
                        if matches!(self.tokens[self.pos + 1].kind, TokenKind::Colon) {
                            self.parse_label()
                        } else {
                            self.parse_instruction()
                        }
                    }
                }
            }
            _ => Err(ParseError::UnexpectedToken { expected: "statement", span: self.peek().span.clone() }),
        }
    }

    fn parse_label(&mut self) -> Result<Stmt, ParseError> {
        let start = self.peek().span.clone();
        let name_text = self.expect_ident("label name")?;
        let colon_span = self.expect(TokenKind::Colon, "':'")?;
        let name = self.interner.intern(&name_text);
        Ok(Stmt::Label { name, span: start.join(&colon_span) })
    }

    fn parse_hash_directive(&mut self) -> Result<Stmt, ParseError> {
        let hash_span = self.expect(TokenKind::Hash, "'#'")?;
        let keyword = self.expect_ident("preprocessor directive")?;

        match keyword.as_str() {
            "define" => {
                let name_text = self.expect_ident("macro name")?;
                let name = self.interner.intern(&name_text);
                let value = if self.at_line_end() { None } else { Some(self.parse_expr()?) };
                Ok(Stmt::Define { name, value, span: hash_span })
            }
            "include" => {
                let (path_text, path_span) = self.expect_str("include path")?;
                let path = self.interner.intern(&path_text);
                Ok(Stmt::Include { path, span: hash_span.join(&path_span) })
            }
            "ifdef" => {
                let name_text = self.expect_ident("macro name")?;
                let name = self.interner.intern(&name_text);
                Ok(Stmt::IfDef { name, span: hash_span })
            }
            "ifndef" => {
                let name_text = self.expect_ident("macro name")?;
                let name = self.interner.intern(&name_text);
                Ok(Stmt::IfNDef { name, span: hash_span })
            }
            "else" => Ok(Stmt::Else { span: hash_span }),
            "endif" => Ok(Stmt::EndIf { span: hash_span }),
            "error" => {
                let message = self.parse_expr()?;
                Ok(Stmt::ErrorDirective { message, span: hash_span })
            }
            _ => Err(ParseError::UnexpectedToken { expected: "preprocessor directive", span: hash_span }),
        }
    }

    fn parse_dot_directive(&mut self) -> Result<Stmt, ParseError> {
        let dot_span = self.expect(TokenKind::Dot, "'.'")?;
        let keyword = self.expect_ident("directive")?;

        match keyword.as_str() {
            "section" => {
                let name = self.expect_ident("'text' or 'data'")?;
                let section = match name.as_str() {
                    "text" => Section::Text,
                    "data" => Section::Data,
                    _ => return Err(ParseError::UnexpectedToken { expected: "'text' or 'data'", span: dot_span }),
                };
                Ok(Stmt::SectionDirective { section, span: dot_span })
            }
            "entry" => {
                let target = self.parse_expr()?;
                Ok(Stmt::EntryDirective { target, span: dot_span })
            }
            "ascii" => {
                let (text, span) = self.expect_str("string literal")?;
                Ok(Stmt::AsciiDirective { bytes: text.into_bytes(), span: dot_span.join(&span) })
            }
            "asciz" => {
                let (text, span) = self.expect_str("string literal")?;
                let mut bytes = text.into_bytes();
                bytes.push(0);
                Ok(Stmt::AsciZDirective { bytes, span: dot_span.join(&span) })
            }
            "extern" => {
                let name_text = self.expect_ident("extern name")?;
                let name = self.interner.intern(&name_text);
                Ok(Stmt::ExternDirective { name, span: dot_span })
            }
            _ => Err(ParseError::UnexpectedToken { expected: "directive", span: dot_span }),
        }
    }

    fn parse_data_directive(&mut self, keyword: &str) -> Result<Stmt, ParseError> {
        let size = match keyword {
            "db" => DataSize::Byte,
            "dw" => DataSize::Word,
            "dd" => DataSize::Dword,
            "dq" => DataSize::Qword,
            _ => unreachable!(),
        };
        let start = self.peek().span.clone();
        self.pos += 1; // the db/dw/dd/dq ident itself

        let mut items = Vec::new();
        loop {
            if matches!(self.peek().kind, TokenKind::Str(_)) {
                let (text, span) = self.expect_str("string literal")?;
                if size != DataSize::Byte {
                    return Err(ParseError::UnexpectedToken { expected: "integer literal (strings only valid in db)", span });
                }
                for b in text.into_bytes() {
                    items.push(Expr::IntegerLiteral(b as i64));
                }
            } else {
                items.push(self.parse_expr()?);
            }

            if matches!(self.peek().kind, TokenKind::Comma) {
                self.pos += 1;
                continue;
            }
            break;
        }

        Ok(Stmt::DataDirective { size, items, span: start })
    }

    fn parse_resb(&mut self) -> Result<Stmt, ParseError> {
        let start = self.peek().span.clone();
        self.pos += 1; // "resb"
        let count = self.parse_expr()?;
        Ok(Stmt::ResbDirective { count, span: start })
    }

    fn parse_instruction(&mut self) -> Result<Stmt, ParseError> {
        let start = self.peek().span.clone();
        let mnemonic_text = self.expect_ident("instruction")?.to_ascii_lowercase();
        let mnemonic = self.interner.intern(&mnemonic_text);

        let mut operands = Vec::new();

        // push/pop/sti take a leading data-size keyword with no comma before
        // the next operand, matching the source-language surface of §6
        // (`push qword q0`).
        if matches!(mnemonic_text.as_str(), "push" | "pop" | "sti") {
            if let TokenKind::Ident(name) = &self.peek().kind {
                if let Some(size) = parse_data_size_keyword(name) {
                    self.pos += 1;
                    operands.push(Expr::DataSize(size));
                }
            }
        }

        if !self.at_line_end() {
            operands.push(self.parse_expr()?);
            while matches!(self.peek().kind, TokenKind::Comma) {
                self.pos += 1;
                operands.push(self.parse_expr()?);
            }
        }

        Ok(Stmt::Instruction { mnemonic, operands, span: start })
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::Eof)
    }

    // --- Expressions ---------------------------------------------------
    //
    // Precedence, lowest to highest: `+ -` then `* / & | ^` then unary
    // `- ~` then primary. This is a single flat table, not a full grammar —
    // Nyx source doesn't need parenthesized grouping beyond address
    // brackets.

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_additive()
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Amp => BinaryOp::And,
                TokenKind::Pipe => BinaryOp::Or,
                TokenKind::Caret => BinaryOp::Xor,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().kind {
            TokenKind::Minus => {
                self.pos += 1;
                Ok(Expr::unary(UnaryOp::Neg, self.parse_unary()?))
            }
            TokenKind::Tilde => {
                self.pos += 1;
                Ok(Expr::unary(UnaryOp::Not, self.parse_unary()?))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Int(v) => Ok(Expr::IntegerLiteral(v)),
            TokenKind::Float(v) => Ok(Expr::FloatLiteral(v)),
            TokenKind::Str(s) => Ok(Expr::StringLiteral(self.interner.intern(&s))),
            TokenKind::Ident(name) => {
                if let Some(size) = parse_data_size_keyword(&name) {
                    return Ok(Expr::DataSize(size));
                }
                if let Ok(reg) = Register::from_name(&name) {
                    return Ok(Expr::Register(reg));
                }
                Ok(Expr::Identifier(self.interner.intern(&name)))
            }
            TokenKind::LBracket => {
                let base = self.parse_additive_no_bracket()?;
                let offset = match self.peek().kind {
                    TokenKind::Plus => {
                        self.pos += 1;
                        Some(Box::new(self.parse_additive_no_bracket()?))
                    }
                    TokenKind::Minus => {
                        self.pos += 1;
                        let inner = self.parse_additive_no_bracket()?;
                        Some(Box::new(Expr::unary(UnaryOp::Neg, inner)))
                    }
                    _ => None,
                };
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::Address { base: Box::new(base), offset })
            }
            _ => Err(ParseError::UnexpectedToken { expected: "operand", span: token.span }),
        }
    }

    /// A primary-only expression used for address base/offset operands: a
    /// register, identifier, or integer literal, without recursing into the
    /// general binary-operator grammar (addressing only ever adds a single
    /// constant offset to a single base, per §4.2).
    fn parse_additive_no_bracket(&mut self) -> Result<Expr, ParseError> {
        self.parse_primary()
    }
}

fn parse_data_size_keyword(name: &str) -> Option<DataSize> {
    match name.to_ascii_lowercase().as_str() {
        "byte" => Some(DataSize::Byte),
        "word" => Some(DataSize::Word),
        "dword" => Some(DataSize::Dword),
        "qword" => Some(DataSize::Qword),
        "float" => Some(DataSize::Float),
        "double" => Some(DataSize::Double),
        _ => None,
    }
}

pub fn parse(tokens: &[Token], interner: &mut Interner) -> Result<Vec<Stmt>, ParseError> {
    Parser::new(tokens, interner).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::span::Id;

    fn parse_source(src: &str) -> (Vec<Stmt>, Interner) {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), src).unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        (stmts, interner)
    }

    #[test]
    fn parses_label_and_instruction() {
        let (stmts, interner) = parse_source("_start: mov q0,1\n");
        assert!(matches!(&stmts[0], Stmt::Label { name, .. } if interner.resolve(*name) == "_start"));
        assert!(matches!(&stmts[1], Stmt::Instruction { operands, .. } if operands.len() == 2));
    }

    #[test]
    fn parses_push_with_size_prefix() {
        let (stmts, _) = parse_source("push qword q0\n");
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => {
                assert_eq!(operands[0], Expr::DataSize(DataSize::Qword));
                assert!(matches!(operands[1], Expr::Register(_)));
            }
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn parses_address_with_offset() {
        let (stmts, _) = parse_source("ldr q0, [bp+8]\n");
        match &stmts[0] {
            Stmt::Instruction { operands, .. } => match &operands[1] {
                Expr::Address { base, offset } => {
                    assert!(matches!(**base, Expr::Register(_)));
                    assert!(offset.is_some());
                }
                _ => panic!("expected address operand"),
            },
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn parses_db_with_string_and_trailing_byte() {
        let (stmts, _) = parse_source("message: db \"hi\", 0x00\n");
        match &stmts[1] {
            Stmt::DataDirective { items, size, .. } => {
                assert_eq!(*size, DataSize::Byte);
                assert_eq!(items.len(), 3);
            }
            _ => panic!("expected data directive"),
        }
    }

    #[test]
    fn parses_conditional_directives() {
        let (stmts, _) = parse_source("#define X\n#ifdef X\nmov q0,1\n#else\nmov q0,2\n#endif\n");
        assert!(matches!(stmts[0], Stmt::Define { value: None, .. }));
        assert!(matches!(stmts[1], Stmt::IfDef { .. }));
        assert!(matches!(stmts[3], Stmt::Else { .. }));
        assert!(matches!(stmts[5], Stmt::EndIf { .. }));
    }
}
