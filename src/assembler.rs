//! The two-pass assembler (§4.2): a forward walk over preprocessed
//! statements that emits opcodes/operands and records labels and fixups,
//! followed by a finalize pass that patches every fixup and writes the
//! entry header.

pub mod fixup;

use std::collections::{HashMap, HashSet};

use crate::assembler::fixup::{Fixup, FixupWidth, Label};
use crate::ast::{Expr, Section, Stmt};
use crate::bytecode::BytecodeBuilder;
use crate::consts::DEFAULT_ENTRY_LABEL;
use crate::error::AssemblerError;
use crate::immediate::{DataSize, Immediate};
use crate::register::Register;
use crate::span::{Id, Interner, Span};
use crate::vm::opcode::Opcode;

enum EntrySpec {
    Absolute(u64),
    Label(Id, Span),
}

pub struct Assembler<'a> {
    builder: BytecodeBuilder,
    labels: HashMap<Id, Label>,
    fixups: Vec<Fixup>,
    externs: HashSet<Id>,
    entry: Option<EntrySpec>,
    interner: &'a Interner,
}

/// Assemble a fully preprocessed statement stream into a complete image
/// (`header || text || data`, §3).
pub fn assemble(stmts: &[Stmt], interner: &Interner) -> Result<Vec<u8>, AssemblerError> {
    let mut asm = Assembler::new(interner);
    for stmt in stmts {
        asm.assemble_stmt(stmt)?;
    }
    asm.finalize()
}

impl<'a> Assembler<'a> {
    fn new(interner: &'a Interner) -> Self {
        Self {
            builder: BytecodeBuilder::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            externs: HashSet::new(),
            entry: None,
            interner,
        }
    }

    fn name(&self, id: Id) -> &str {
        self.interner.resolve(id)
    }

    fn assemble_stmt(&mut self, stmt: &Stmt) -> Result<(), AssemblerError> {
        match stmt {
            Stmt::Label { name, span } => {
                let label = Label { section: self.builder.section(), offset: self.builder.len(self.builder.section()) };
                self.labels.insert(*name, label);
                if self.entry.is_none() && self.name(*name) == DEFAULT_ENTRY_LABEL {
                    self.entry = Some(EntrySpec::Label(*name, span.clone()));
                }
                Ok(())
            }
            Stmt::SectionDirective { section, .. } => {
                self.builder.set_section(*section);
                Ok(())
            }
            Stmt::EntryDirective { target, span } => {
                match target {
                    Expr::IntegerLiteral(v) => self.entry = Some(EntrySpec::Absolute(*v as u64)),
                    Expr::Identifier(id) => self.entry = Some(EntrySpec::Label(*id, span.clone())),
                    _ => return Err(AssemblerError::UnsupportedOperands(".entry", span.clone())),
                }
                Ok(())
            }
            Stmt::AsciiDirective { bytes, .. } => {
                self.builder.extend(bytes);
                Ok(())
            }
            Stmt::AsciZDirective { bytes, .. } => {
                self.builder.extend(bytes);
                Ok(())
            }
            Stmt::DataDirective { size, items, span } => {
                for item in items {
                    self.emit_immediate(item, *size, span)?;
                }
                Ok(())
            }
            Stmt::ResbDirective { count, span } => {
                let n = self.const_integer(count, span)?;
                self.builder.grow(n as usize);
                Ok(())
            }
            Stmt::ExternDirective { name, .. } => {
                self.externs.insert(*name);
                Ok(())
            }
            Stmt::Instruction { mnemonic, operands, span } => self.assemble_instruction(*mnemonic, operands, span),
            Stmt::Define { .. } | Stmt::Include { .. } | Stmt::IfDef { .. } | Stmt::IfNDef { .. } | Stmt::Else { .. } | Stmt::EndIf { .. } | Stmt::ErrorDirective { .. } => {
                unreachable!("preprocessor consumes this statement kind")
            }
        }
    }

    fn const_integer(&self, expr: &Expr, span: &Span) -> Result<i64, AssemblerError> {
        match expr {
            Expr::IntegerLiteral(v) => Ok(*v),
            _ => Err(AssemblerError::UnsupportedOperands("resb", span.clone())),
        }
    }

    fn assemble_instruction(&mut self, mnemonic: Id, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        match self.name(mnemonic) {
            "nop" => self.builder.push_byte(Opcode::Nop.as_byte()),
            "ret" => self.builder.push_byte(Opcode::Ret.as_byte()),
            "syscall" => self.builder.push_byte(Opcode::Syscall.as_byte()),
            "hlt" => self.builder.push_byte(Opcode::Hlt.as_byte()),
            "load_external" => self.encode_load_external(operands, span)?,
            "mov" => self.encode_mov(operands, span)?,
            "ldr" => self.encode_mem(Opcode::Ldr, "ldr", operands, span)?,
            "str" => self.encode_mem(Opcode::Str, "str", operands, span)?,
            "sti" => self.encode_sti(operands, span)?,
            "push" => self.encode_push(operands, span)?,
            "pop" => self.encode_pop(operands, span)?,
            "add" => self.encode_arith("add", Opcode::AddRegRegReg, Opcode::AddRegRegImm, false, operands, span)?,
            "sub" => self.encode_arith("sub", Opcode::SubRegRegReg, Opcode::SubRegRegImm, false, operands, span)?,
            "mul" => self.encode_arith("mul", Opcode::MulRegRegReg, Opcode::MulRegRegImm, false, operands, span)?,
            "div" => self.encode_arith("div", Opcode::DivRegRegReg, Opcode::DivRegRegImm, false, operands, span)?,
            "and" => self.encode_arith("and", Opcode::AndRegRegReg, Opcode::AndRegRegImm, true, operands, span)?,
            "or" => self.encode_arith("or", Opcode::OrRegRegReg, Opcode::OrRegRegImm, true, operands, span)?,
            "xor" => self.encode_arith("xor", Opcode::XorRegRegReg, Opcode::XorRegRegImm, true, operands, span)?,
            "shl" => self.encode_arith("shl", Opcode::ShlRegRegReg, Opcode::ShlRegRegImm, true, operands, span)?,
            "shr" => self.encode_arith("shr", Opcode::ShrRegRegReg, Opcode::ShrRegRegImm, true, operands, span)?,
            "cmp" => self.encode_cmp(operands, span)?,
            "jmp" => self.encode_branch(Opcode::JmpImm, Opcode::JmpReg, operands, span)?,
            "jeq" => self.encode_branch(Opcode::JeqImm, Opcode::JeqReg, operands, span)?,
            "jne" => self.encode_branch(Opcode::JneImm, Opcode::JneReg, operands, span)?,
            "jlt" => self.encode_branch(Opcode::JltImm, Opcode::JltReg, operands, span)?,
            "jgt" => self.encode_branch(Opcode::JgtImm, Opcode::JgtReg, operands, span)?,
            "jle" => self.encode_branch(Opcode::JleImm, Opcode::JleReg, operands, span)?,
            "jge" => self.encode_branch(Opcode::JgeImm, Opcode::JgeReg, operands, span)?,
            "call" => self.encode_call(operands, span)?,
            "inc" => self.encode_unary_reg(Opcode::Inc, "inc", operands, span)?,
            "dec" => self.encode_unary_reg(Opcode::Dec, "dec", operands, span)?,
            "neg" => self.encode_unary_reg(Opcode::Neg, "neg", operands, span)?,
            other => return Err(AssemblerError::UnknownMnemonic(other.to_owned(), span.clone())),
        }
        Ok(())
    }

    fn expect_register(&self, expr: &Expr, mnemonic: &'static str, span: &Span) -> Result<Register, AssemblerError> {
        match expr {
            Expr::Register(reg) => Ok(*reg),
            _ => Err(AssemblerError::ExpectedRegister(mnemonic, span.clone())),
        }
    }

    fn reject_float(&self, mnemonic: &'static str, reg: Register, span: &Span) -> Result<(), AssemblerError> {
        if reg.natural_size().is_float() {
            Err(AssemblerError::BitwiseOnFloat(mnemonic, span.clone()))
        } else {
            Ok(())
        }
    }

    fn encode_mov(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 2 {
            return Err(AssemblerError::UnsupportedOperands("mov", span.clone()));
        }
        let dest = self.expect_register(&operands[0], "mov", span)?;
        match &operands[1] {
            Expr::Register(src) => {
                self.builder.push_byte(Opcode::MovRegReg.as_byte());
                self.builder.push_byte(dest.ordinal());
                self.builder.push_byte(src.ordinal());
            }
            other => {
                self.builder.push_byte(Opcode::MovRegImm.as_byte());
                self.builder.push_byte(dest.ordinal());
                self.emit_immediate(other, dest.natural_size(), span)?;
            }
        }
        Ok(())
    }

    fn encode_mem(&mut self, opcode: Opcode, mnemonic: &'static str, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 2 {
            return Err(AssemblerError::UnsupportedOperands(mnemonic, span.clone()));
        }
        let reg = self.expect_register(&operands[0], mnemonic, span)?;
        self.builder.push_byte(opcode.as_byte());
        self.builder.push_byte(reg.ordinal());
        self.emit_address(&operands[1], span)?;
        Ok(())
    }

    fn encode_sti(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 3 {
            return Err(AssemblerError::UnsupportedOperands("sti", span.clone()));
        }
        let size = match &operands[0] {
            Expr::DataSize(s) => *s,
            _ => return Err(AssemblerError::UnsupportedOperands("sti", span.clone())),
        };
        self.builder.push_byte(Opcode::Sti.as_byte());
        self.builder.push_byte(size.ordinal());
        self.emit_immediate(&operands[1], size, span)?;
        self.emit_address(&operands[2], span)?;
        Ok(())
    }

    fn encode_push(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 2 {
            return Err(AssemblerError::UnsupportedOperands("push", span.clone()));
        }
        let size = match &operands[0] {
            Expr::DataSize(s) => *s,
            _ => return Err(AssemblerError::UnsupportedOperands("push", span.clone())),
        };
        match &operands[1] {
            Expr::Register(reg) => {
                self.builder.push_byte(Opcode::PushReg.as_byte());
                self.builder.push_byte(size.ordinal());
                self.builder.push_byte(reg.ordinal());
            }
            Expr::Address { .. } => {
                self.builder.push_byte(Opcode::PushAddr.as_byte());
                self.builder.push_byte(size.ordinal());
                self.emit_address(&operands[1], span)?;
            }
            other => {
                self.builder.push_byte(Opcode::PushImm.as_byte());
                self.builder.push_byte(size.ordinal());
                self.emit_immediate(other, size, span)?;
            }
        }
        Ok(())
    }

    fn encode_pop(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 2 {
            return Err(AssemblerError::UnsupportedOperands("pop", span.clone()));
        }
        let size = match &operands[0] {
            Expr::DataSize(s) => *s,
            _ => return Err(AssemblerError::UnsupportedOperands("pop", span.clone())),
        };
        match &operands[1] {
            Expr::Register(reg) => {
                self.builder.push_byte(Opcode::PopReg.as_byte());
                self.builder.push_byte(size.ordinal());
                self.builder.push_byte(reg.ordinal());
            }
            Expr::Address { .. } => {
                self.builder.push_byte(Opcode::PopAddr.as_byte());
                self.builder.push_byte(size.ordinal());
                self.emit_address(&operands[1], span)?;
            }
            _ => return Err(AssemblerError::UnsupportedOperands("pop", span.clone())),
        }
        Ok(())
    }

    fn encode_arith(
        &mut self,
        mnemonic: &'static str,
        opcode_reg: Opcode,
        opcode_imm: Opcode,
        bitwise: bool,
        operands: &[Expr],
        span: &Span,
    ) -> Result<(), AssemblerError> {
        if operands.len() != 3 {
            return Err(AssemblerError::UnsupportedOperands(mnemonic, span.clone()));
        }
        let dest = self.expect_register(&operands[0], mnemonic, span)?;
        let lhs = self.expect_register(&operands[1], mnemonic, span)?;
        if bitwise {
            self.reject_float(mnemonic, dest, span)?;
            self.reject_float(mnemonic, lhs, span)?;
        }
        match &operands[2] {
            Expr::Register(rhs) => {
                if bitwise {
                    self.reject_float(mnemonic, *rhs, span)?;
                }
                self.builder.push_byte(opcode_reg.as_byte());
                self.builder.push_byte(dest.ordinal());
                self.builder.push_byte(lhs.ordinal());
                self.builder.push_byte(rhs.ordinal());
            }
            Expr::FloatLiteral(_) if bitwise => {
                return Err(AssemblerError::BitwiseOnFloat(mnemonic, span.clone()));
            }
            other => {
                self.builder.push_byte(opcode_imm.as_byte());
                self.builder.push_byte(dest.ordinal());
                self.builder.push_byte(lhs.ordinal());
                self.emit_immediate(other, dest.natural_size(), span)?;
            }
        }
        Ok(())
    }

    fn encode_cmp(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 2 {
            return Err(AssemblerError::UnsupportedOperands("cmp", span.clone()));
        }
        let lhs = self.expect_register(&operands[0], "cmp", span)?;
        match &operands[1] {
            Expr::Register(rhs) => {
                self.builder.push_byte(Opcode::CmpRegReg.as_byte());
                self.builder.push_byte(lhs.ordinal());
                self.builder.push_byte(rhs.ordinal());
            }
            other => {
                self.builder.push_byte(Opcode::CmpRegImm.as_byte());
                self.builder.push_byte(lhs.ordinal());
                self.emit_immediate(other, lhs.natural_size(), span)?;
            }
        }
        Ok(())
    }

    fn encode_branch(&mut self, opcode_imm: Opcode, opcode_reg: Opcode, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 1 {
            return Err(AssemblerError::UnsupportedOperands("branch", span.clone()));
        }
        match &operands[0] {
            Expr::Register(reg) => {
                self.builder.push_byte(opcode_reg.as_byte());
                self.builder.push_byte(reg.ordinal());
            }
            other => {
                self.builder.push_byte(opcode_imm.as_byte());
                self.emit_immediate(other, DataSize::Qword, span)?;
            }
        }
        Ok(())
    }

    fn encode_call(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 1 {
            return Err(AssemblerError::UnsupportedOperands("call", span.clone()));
        }
        match &operands[0] {
            Expr::Register(reg) => {
                self.builder.push_byte(Opcode::CallReg.as_byte());
                self.builder.push_byte(reg.ordinal());
            }
            Expr::Identifier(id) if self.externs.contains(id) => {
                let name = self.name(*id).to_owned();
                self.builder.push_byte(Opcode::CallEx.as_byte());
                self.builder.extend(name.as_bytes());
                self.builder.push_byte(0);
            }
            other => {
                self.builder.push_byte(Opcode::CallImm.as_byte());
                self.emit_immediate(other, DataSize::Qword, span)?;
            }
        }
        Ok(())
    }

    fn encode_unary_reg(&mut self, opcode: Opcode, mnemonic: &'static str, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 1 {
            return Err(AssemblerError::UnsupportedOperands(mnemonic, span.clone()));
        }
        let reg = self.expect_register(&operands[0], mnemonic, span)?;
        self.builder.push_byte(opcode.as_byte());
        self.builder.push_byte(reg.ordinal());
        Ok(())
    }

    fn encode_load_external(&mut self, operands: &[Expr], span: &Span) -> Result<(), AssemblerError> {
        if operands.len() != 1 {
            return Err(AssemblerError::UnsupportedOperands("load_external", span.clone()));
        }
        match &operands[0] {
            Expr::StringLiteral(id) => {
                let path = self.name(*id).to_owned();
                self.builder.push_byte(Opcode::LoadExternal.as_byte());
                self.builder.extend(path.as_bytes());
                self.builder.push_byte(0);
                Ok(())
            }
            _ => Err(AssemblerError::UnsupportedOperands("load_external", span.clone())),
        }
    }

    /// Encode an immediate operand coerced to `size`, or register a fixup if
    /// it's an unresolved label reference (§4.2).
    fn emit_immediate(&mut self, expr: &Expr, size: DataSize, span: &Span) -> Result<(), AssemblerError> {
        match expr {
            Expr::IntegerLiteral(v) => {
                let imm = Immediate::Qword(*v as u64).coerce(size);
                self.builder.extend(&imm.to_le_bytes());
                Ok(())
            }
            Expr::FloatLiteral(v) => {
                let imm = Immediate::Double(*v).coerce(size);
                self.builder.extend(&imm.to_le_bytes());
                Ok(())
            }
            Expr::Identifier(id) => {
                let width = FixupWidth::from_data_size(size).ok_or_else(|| AssemblerError::InvalidFixupWidth(span.clone()))?;
                let patch_section = self.builder.section();
                let patch_offset = self.builder.len(patch_section);
                self.builder.grow(size.bytes());
                self.fixups.push(Fixup { patch_section, patch_offset, width, label: *id, span: span.clone() });
                Ok(())
            }
            _ => Err(AssemblerError::UnsupportedOperands("immediate", span.clone())),
        }
    }

    /// Encode a `{base, offset?}` address operand using the two addressing
    /// variants of §4.2.
    fn emit_address(&mut self, expr: &Expr, span: &Span) -> Result<(), AssemblerError> {
        let (base, offset) = match expr {
            Expr::Address { base, offset } => (base.as_ref(), offset.as_deref()),
            _ => return Err(AssemblerError::UnsupportedOperands("address", span.clone())),
        };

        let offset_value = match offset {
            Some(Expr::IntegerLiteral(v)) => *v,
            None => 0,
            Some(_) => return Err(AssemblerError::UnsupportedOperands("address offset", span.clone())),
        };

        match base {
            Expr::Register(reg) => {
                self.builder.push_byte(0x00);
                self.builder.push_byte(reg.ordinal());
                self.builder.extend(&offset_value.to_le_bytes());
            }
            Expr::IntegerLiteral(v) => {
                self.builder.push_byte(0x01);
                self.builder.extend(&(*v).to_le_bytes());
                self.builder.extend(&offset_value.to_le_bytes());
            }
            Expr::Identifier(id) => {
                self.builder.push_byte(0x01);
                let patch_section = self.builder.section();
                let patch_offset = self.builder.len(patch_section);
                self.builder.grow(8);
                self.fixups.push(Fixup { patch_section, patch_offset, width: FixupWidth::Qword, label: *id, span: span.clone() });
                self.builder.extend(&offset_value.to_le_bytes());
            }
            _ => return Err(AssemblerError::UnsupportedOperands("address base", span.clone())),
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<Vec<u8>, AssemblerError> {
        let text_len = self.builder.len(Section::Text);

        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let label = self
                .labels
                .get(&fixup.label)
                .copied()
                .ok_or_else(|| AssemblerError::UndefinedLabel(self.name(fixup.label).to_owned(), fixup.span.clone()))?;
            let absolute = resolve_absolute(label, text_len);
            match fixup.width {
                FixupWidth::Byte => self.builder.write_u8_at(fixup.patch_section, fixup.patch_offset, absolute as u8),
                FixupWidth::Word => self.builder.write_u16_at(fixup.patch_section, fixup.patch_offset, absolute as u16),
                FixupWidth::Dword => self.builder.write_u32_at(fixup.patch_section, fixup.patch_offset, absolute as u32),
                FixupWidth::Qword => self.builder.write_u64_at(fixup.patch_section, fixup.patch_offset, absolute),
            }
        }

        let entry = match self.entry.take() {
            Some(EntrySpec::Absolute(v)) => v,
            Some(EntrySpec::Label(id, span)) => {
                let label = self.labels.get(&id).copied().ok_or_else(|| AssemblerError::UndefinedLabel(self.name(id).to_owned(), span))?;
                resolve_absolute(label, text_len)
            }
            None => 0,
        };

        let (text, data) = self.builder.finalize();
        let mut image = Vec::with_capacity(8 + text.len() + data.len());
        image.extend_from_slice(&entry.to_le_bytes());
        image.extend_from_slice(&text);
        image.extend_from_slice(&data);
        Ok(image)
    }
}

fn resolve_absolute(label: Label, text_len: usize) -> u64 {
    match label.section {
        Section::Text => label.offset as u64,
        Section::Data => (text_len + label.offset) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::span::Id;

    fn assemble_source(src: &str) -> Vec<u8> {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), src).unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        assemble(&stmts, &interner).unwrap()
    }

    #[test]
    fn entry_header_precedes_text_and_data() {
        let image = assemble_source("_start: mov q0,1\nhlt\n");
        let entry = u64::from_le_bytes(image[0..8].try_into().unwrap());
        assert_eq!(entry, 0);
        assert!(image.len() > 8);
    }

    #[test]
    fn forward_label_reference_is_patched_to_absolute_offset() {
        let image = assemble_source("jmp skip\nmov q0,1\nskip: mov q0,2\nhlt\n");
        // jmp_imm opcode byte + 8-byte absolute offset of `skip`.
        let target = u64::from_le_bytes(image[9..17].try_into().unwrap());
        // jmp(1) + imm(8) = 9 bytes, then mov_reg_imm(1)+reg(1)+imm(8) = 10 bytes = offset 19
        assert_eq!(target, 19);
    }

    #[test]
    fn data_label_offset_is_biased_by_text_length() {
        let image = assemble_source("mov q1,message\nhlt\n.section data\nmessage: db \"hi\", 0x00\n");
        // text: mov_reg_imm(opcode 1 + reg 1 + fixup 8 = 10 bytes) + hlt(1) = 11 bytes.
        // The fixup sits at text offset 2, i.e. image offset 8 (header) + 2 = 10.
        let patched = u64::from_le_bytes(image[10..18].try_into().unwrap());
        assert_eq!(patched, 11);
    }

    #[test]
    fn undefined_label_is_an_error() {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "jmp nowhere\nhlt\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        assert!(matches!(assemble(&stmts, &interner), Err(AssemblerError::UndefinedLabel(_, _))));
    }

    #[test]
    fn extern_call_emits_call_ex_with_name() {
        let image = assemble_source(".extern my_func\ncall my_func\nhlt\n");
        assert_eq!(image[8], Opcode::CallEx.as_byte());
        assert_eq!(&image[9..17], b"my_func\0");
    }

    #[test]
    fn bitwise_op_on_float_register_is_rejected() {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "and ff0, ff1, ff2\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        assert!(matches!(assemble(&stmts, &interner), Err(AssemblerError::BitwiseOnFloat(_, _))));
    }
}
