//! The fetch-decode-execute loop and supporting VM state (§4.6).

pub mod opcode;

use tracing::debug;

use crate::error::RuntimeError;
use crate::extension::ExtensionLoader;
use crate::immediate::{DataSize, Immediate};
use crate::mmu::{MemoryBlock, Mmu};
use crate::register::{Register, RegisterFile};
use crate::syscall::SyscallTable;
use crate::vm::opcode::Opcode;

/// The two comparison flag bits set exclusively by `cmp` (§3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub eq: bool,
    pub lt: bool,
}

/// The virtual machine: registers, memory, flags, syscalls, and extensions.
pub struct Vm {
    pub registers: RegisterFile,
    pub mmu: Mmu,
    pub flags: Flags,
    pub syscalls: SyscallTable,
    pub extensions: ExtensionLoader,
    halted: bool,
}

impl Vm {
    /// Build a VM from a `header || text || data` image (§4.6).
    ///
    /// `mem_size` is the total addressable memory, including the program
    /// bytes themselves: the `Program` block holds the image body and the
    /// `Memory` block fills the remainder.
    pub fn new(image: &[u8], mem_size: usize) -> Result<Vm, RuntimeError> {
        if image.len() < 8 {
            return Err(RuntimeError::AddressOutOfBounds(0));
        }
        let entry = u64::from_le_bytes(image[0..8].try_into().unwrap());
        let program = &image[8..];

        if program.len() > mem_size {
            return Err(RuntimeError::AddressOutOfBounds(mem_size));
        }

        let mut mmu = Mmu::new();
        mmu.push_block(MemoryBlock::from_bytes("Program", program.to_vec()));
        mmu.push_block(MemoryBlock::new("Memory", mem_size - program.len()));

        let mut registers = RegisterFile::new();
        registers.set_ip(entry as usize);
        registers.set_sp(mem_size);
        registers.set_bp(0);

        debug!(entry, mem_size, program_len = program.len(), "vm constructed");

        Ok(Vm {
            registers,
            mmu,
            flags: Flags::default(),
            syscalls: SyscallTable::new(),
            extensions: ExtensionLoader::new(),
            halted: false,
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        while !self.halted {
            self.step()?;
        }
        Ok(())
    }

    /// Execute exactly one instruction; a no-op once halted (§4.6).
    pub fn step(&mut self) -> Result<(), RuntimeError> {
        if self.halted {
            return Ok(());
        }

        let opcode_byte = self.fetch_u8()?;
        let opcode = Opcode::from_byte(opcode_byte)?;
        debug!(ip = self.registers.ip(), ?opcode, "executed instruction");
        self.execute(opcode)
    }

    fn fetch_u8(&mut self) -> Result<u8, RuntimeError> {
        let ip = self.registers.ip();
        let bytes = self.mmu.read_slice(ip, ip + 1).map_err(|_| RuntimeError::InstructionPointerOutOfBounds(ip))?;
        self.registers.set_ip(ip + 1);
        Ok(bytes[0])
    }

    fn fetch_bytes(&mut self, n: usize) -> Result<Vec<u8>, RuntimeError> {
        let ip = self.registers.ip();
        let bytes = self.mmu.read_slice(ip, ip + n).map_err(|_| RuntimeError::InstructionPointerOutOfBounds(ip))?;
        self.registers.set_ip(ip + n);
        Ok(bytes)
    }

    fn fetch_register(&mut self) -> Result<Register, RuntimeError> {
        let byte = self.fetch_u8()?;
        Register::try_from(byte).map_err(|_| RuntimeError::InvalidRegisterByte(byte))
    }

    fn fetch_data_size(&mut self) -> Result<DataSize, RuntimeError> {
        let byte = self.fetch_u8()?;
        DataSize::from_ordinal(byte).ok_or(RuntimeError::InvalidDataSizeByte(byte))
    }

    fn fetch_i64(&mut self) -> Result<i64, RuntimeError> {
        let bytes = self.fetch_bytes(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn fetch_u64(&mut self) -> Result<u64, RuntimeError> {
        let bytes = self.fetch_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn fetch_immediate(&mut self, size: DataSize) -> Result<Immediate, RuntimeError> {
        let bytes = self.fetch_bytes(size.bytes())?;
        Ok(Immediate::from_le_bytes(size, &bytes))
    }

    fn fetch_cstring(&mut self) -> Result<String, RuntimeError> {
        let mut bytes = Vec::new();
        loop {
            let b = self.fetch_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decode the 1-byte addressing-mode tag and resolve it to a concrete
    /// address (§4.2 addressing variants).
    fn fetch_address(&mut self) -> Result<usize, RuntimeError> {
        let variant = self.fetch_u8()?;
        match variant {
            0x00 => {
                let reg = self.fetch_register()?;
                let offset = self.fetch_i64()?;
                let base = self.registers.get(reg).as_u64() as i64;
                Ok((base + offset) as usize)
            }
            0x01 => {
                let base = self.fetch_i64()?;
                let offset = self.fetch_i64()?;
                Ok((base + offset) as usize)
            }
            other => Err(RuntimeError::UnknownAddressingVariant(other)),
        }
    }

    fn execute(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        use Opcode::*;
        match opcode {
            Nop => Ok(()),
            Ret => self.op_ret(),
            Syscall => self.op_syscall(),
            Hlt => {
                self.halted = true;
                Ok(())
            }
            LoadExternal => self.op_load_external(),
            MovRegReg => {
                let dest = self.fetch_register()?;
                let src = self.fetch_register()?;
                let value = self.registers.get(src);
                self.registers.set(dest, &value);
                Ok(())
            }
            MovRegImm => {
                let dest = self.fetch_register()?;
                let value = self.fetch_immediate(dest.natural_size())?;
                self.registers.set(dest, &value);
                Ok(())
            }
            Ldr => {
                let dest = self.fetch_register()?;
                let addr = self.fetch_address()?;
                let value = self.mmu.read(addr, dest.natural_size())?;
                self.registers.set(dest, &value);
                Ok(())
            }
            Str => {
                let src = self.fetch_register()?;
                let addr = self.fetch_address()?;
                let value = self.registers.get(src);
                self.mmu.write(addr, &value)
            }
            Sti => {
                let size = self.fetch_data_size()?;
                let value = self.fetch_immediate(size)?;
                let addr = self.fetch_address()?;
                self.mmu.write(addr, &value)
            }
            PushImm => {
                let size = self.fetch_data_size()?;
                let value = self.fetch_immediate(size)?;
                self.push(&value)
            }
            PushReg => {
                let size = self.fetch_data_size()?;
                let reg = self.fetch_register()?;
                let value = self.registers.get(reg).coerce(size);
                self.push(&value)
            }
            PushAddr => {
                let size = self.fetch_data_size()?;
                let addr = self.fetch_address()?;
                let value = self.mmu.read(addr, size)?;
                self.push(&value)
            }
            PopReg => {
                let size = self.fetch_data_size()?;
                let reg = self.fetch_register()?;
                let value = self.pop(size)?;
                self.registers.set(reg, &value);
                Ok(())
            }
            PopAddr => {
                let size = self.fetch_data_size()?;
                let addr = self.fetch_address()?;
                let value = self.pop(size)?;
                self.mmu.write(addr, &value)
            }
            AddRegRegReg | SubRegRegReg | MulRegRegReg | DivRegRegReg => self.op_arith_reg(opcode),
            AddRegRegImm | SubRegRegImm | MulRegRegImm | DivRegRegImm => self.op_arith_imm(opcode),
            AndRegRegReg | OrRegRegReg | XorRegRegReg | ShlRegRegReg | ShrRegRegReg => self.op_bitwise_reg(opcode),
            AndRegRegImm | OrRegRegImm | XorRegRegImm | ShlRegRegImm | ShrRegRegImm => self.op_bitwise_imm(opcode),
            CmpRegReg => {
                let lhs = self.fetch_register()?;
                let rhs = self.fetch_register()?;
                let a = self.registers.get(lhs);
                let b = self.registers.get(rhs);
                self.set_flags(a, b);
                Ok(())
            }
            CmpRegImm => {
                let lhs = self.fetch_register()?;
                let a = self.registers.get(lhs);
                let b = self.fetch_immediate(lhs.natural_size())?;
                self.set_flags(a, b);
                Ok(())
            }
            JmpImm => {
                let target = self.fetch_u64()?;
                self.registers.set_ip(target as usize);
                Ok(())
            }
            JmpReg => self.jump_reg_if(true),
            JeqImm => self.jump_imm_if(self.flags.eq),
            JeqReg => self.jump_reg_if(self.flags.eq),
            JneImm => self.jump_imm_if(!self.flags.eq),
            JneReg => self.jump_reg_if(!self.flags.eq),
            JltImm => self.jump_imm_if(self.flags.lt),
            JltReg => self.jump_reg_if(self.flags.lt),
            JgtImm => self.jump_imm_if(!self.flags.lt && !self.flags.eq),
            JgtReg => self.jump_reg_if(!self.flags.lt && !self.flags.eq),
            JleImm => self.jump_imm_if(self.flags.lt || self.flags.eq),
            JleReg => self.jump_reg_if(self.flags.lt || self.flags.eq),
            JgeImm => self.jump_imm_if(!self.flags.lt || self.flags.eq),
            JgeReg => self.jump_reg_if(!self.flags.lt || self.flags.eq),
            CallImm => {
                let target = self.fetch_u64()?;
                self.push_return_address()?;
                self.registers.set_ip(target as usize);
                Ok(())
            }
            CallReg => {
                let reg = self.fetch_register()?;
                let target = self.registers.get(reg).as_u64();
                self.push_return_address()?;
                self.registers.set_ip(target as usize);
                Ok(())
            }
            CallEx => self.op_call_ex(),
            Inc => self.op_step_reg(1),
            Dec => self.op_step_reg(-1),
            Neg => self.op_neg(),
        }
    }

    fn op_ret(&mut self) -> Result<(), RuntimeError> {
        let target = self.pop(DataSize::Qword)?.as_u64();
        self.registers.set_ip(target as usize);
        Ok(())
    }

    fn push_return_address(&mut self) -> Result<(), RuntimeError> {
        let ip = self.registers.ip() as u64;
        self.push(&Immediate::Qword(ip))
    }

    fn jump_imm_if(&mut self, taken: bool) -> Result<(), RuntimeError> {
        let target = self.fetch_u64()?;
        if taken {
            self.registers.set_ip(target as usize);
        }
        Ok(())
    }

    fn jump_reg_if(&mut self, taken: bool) -> Result<(), RuntimeError> {
        let reg = self.fetch_register()?;
        let target = self.registers.get(reg).as_u64();
        if taken {
            self.registers.set_ip(target as usize);
        }
        Ok(())
    }

    fn set_flags(&mut self, a: Immediate, b: Immediate) {
        self.flags.eq = a == b;
        self.flags.lt = a.partial_cmp(&b).map(|o| o.is_lt()).unwrap_or(false);
    }

    /// `push(imm)` decrements `sp` by the value's width then writes at the
    /// new `sp` (§4.6); the stack grows downward.
    fn push(&mut self, value: &Immediate) -> Result<(), RuntimeError> {
        let size = value.bytes();
        let sp = self.registers.sp();
        if sp < size {
            return Err(RuntimeError::StackOverflow);
        }
        let new_sp = sp - size;
        self.mmu.write(new_sp, value)?;
        self.registers.set_sp(new_sp);
        Ok(())
    }

    /// `pop(size)` reads at `sp` then increments `sp` (§4.6).
    fn pop(&mut self, size: DataSize) -> Result<Immediate, RuntimeError> {
        let sp = self.registers.sp();
        if sp + size.bytes() > self.mmu.size() {
            return Err(RuntimeError::StackUnderflow);
        }
        let value = self.mmu.read(sp, size)?;
        self.registers.set_sp(sp + size.bytes());
        Ok(value)
    }

    fn op_arith_reg(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let dest = self.fetch_register()?;
        let lhs = self.fetch_register()?;
        let rhs = self.fetch_register()?;
        let a = self.registers.get(lhs);
        let b = self.registers.get(rhs);
        let result = apply_arith(opcode, a, b, dest.natural_size());
        self.registers.set(dest, &result);
        Ok(())
    }

    fn op_arith_imm(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let dest = self.fetch_register()?;
        let lhs = self.fetch_register()?;
        let a = self.registers.get(lhs);
        let b = self.fetch_immediate(dest.natural_size())?;
        let result = apply_arith(opcode, a, b, dest.natural_size());
        self.registers.set(dest, &result);
        Ok(())
    }

    fn op_bitwise_reg(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let dest = self.fetch_register()?;
        let lhs = self.fetch_register()?;
        let rhs = self.fetch_register()?;
        let a = self.registers.get(lhs).as_u64();
        let b = self.registers.get(rhs).as_u64();
        let result = apply_bitwise(opcode, a, b);
        self.registers.set(dest, &Immediate::Qword(result).coerce(dest.natural_size()));
        Ok(())
    }

    fn op_bitwise_imm(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let dest = self.fetch_register()?;
        let lhs = self.fetch_register()?;
        let a = self.registers.get(lhs).as_u64();
        let b = self.fetch_immediate(dest.natural_size())?.as_u64();
        let result = apply_bitwise(opcode, a, b);
        self.registers.set(dest, &Immediate::Qword(result).coerce(dest.natural_size()));
        Ok(())
    }

    fn op_step_reg(&mut self, delta: i64) -> Result<(), RuntimeError> {
        let reg = self.fetch_register()?;
        let value = self.registers.get(reg);
        let result = match value {
            Immediate::Float(v) => Immediate::Float(v + delta as f32),
            Immediate::Double(v) => Immediate::Double(v + delta as f64),
            _ => Immediate::Qword(value.as_u64().wrapping_add(delta as u64)).coerce(reg.natural_size()),
        };
        self.registers.set(reg, &result);
        Ok(())
    }

    fn op_neg(&mut self) -> Result<(), RuntimeError> {
        let reg = self.fetch_register()?;
        let value = self.registers.get(reg);
        let result = match value {
            Immediate::Float(v) => Immediate::Float(-v),
            Immediate::Double(v) => Immediate::Double(-v),
            _ => Immediate::Qword((value.as_u64() as i64).wrapping_neg() as u64).coerce(reg.natural_size()),
        };
        self.registers.set(reg, &result);
        Ok(())
    }

    fn op_syscall(&mut self) -> Result<(), RuntimeError> {
        let index = self.registers.get(Register::gpr(15, crate::register::View::Qword)).as_u64();
        let table = SyscallTable::new();
        table.dispatch(index, self)
    }

    fn op_load_external(&mut self) -> Result<(), RuntimeError> {
        let path = self.fetch_cstring()?;
        self.extensions.load(&path)
    }

    fn op_call_ex(&mut self) -> Result<(), RuntimeError> {
        let name = self.fetch_cstring()?;
        let extensions = std::mem::take(&mut self.extensions);
        let result = extensions.call(&name, self);
        self.extensions = extensions;
        result
    }
}

fn apply_arith(opcode: Opcode, a: Immediate, b: Immediate, size: DataSize) -> Immediate {
    use Opcode::*;
    if size.is_float() {
        let x = match a {
            Immediate::Float(v) => v as f64,
            Immediate::Double(v) => v,
            other => other.as_u64() as f64,
        };
        let y = match b {
            Immediate::Float(v) => v as f64,
            Immediate::Double(v) => v,
            other => other.as_u64() as f64,
        };
        let result = match opcode {
            AddRegRegReg | AddRegRegImm => x + y,
            SubRegRegReg | SubRegRegImm => x - y,
            MulRegRegReg | MulRegRegImm => x * y,
            DivRegRegReg | DivRegRegImm => x / y,
            _ => unreachable!("non-arithmetic opcode"),
        };
        return Immediate::Double(result).coerce(size);
    }

    let x = a.as_u64();
    let y = b.as_u64();
    let result = match opcode {
        AddRegRegReg | AddRegRegImm => x.wrapping_add(y),
        SubRegRegReg | SubRegRegImm => x.wrapping_sub(y),
        MulRegRegReg | MulRegRegImm => x.wrapping_mul(y),
        DivRegRegReg | DivRegRegImm => {
            if y == 0 {
                0
            } else {
                x.wrapping_div(y)
            }
        }
        _ => unreachable!("non-arithmetic opcode"),
    };
    Immediate::Qword(result).coerce(size)
}

fn apply_bitwise(opcode: Opcode, a: u64, b: u64) -> u64 {
    use Opcode::*;
    match opcode {
        AndRegRegReg | AndRegRegImm => a & b,
        OrRegRegReg | OrRegRegImm => a | b,
        XorRegRegReg | XorRegRegImm => a ^ b,
        ShlRegRegReg | ShlRegRegImm => a.wrapping_shl(b as u32),
        ShrRegRegReg | ShrRegRegImm => a.wrapping_shr(b as u32),
        _ => unreachable!("non-bitwise opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::span::{Id, Interner};

    fn run_program(src: &str) -> Vm {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), src).unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let image = assemble(&stmts, &interner).unwrap();
        let mut vm = Vm::new(&image, 4096).unwrap();
        vm.run().unwrap();
        vm
    }

    #[test]
    fn arithmetic_scenario() {
        let vm = run_program("mov q0,20\nmov q1,5\nadd q2,q0,q1\nsub q3,q0,q1\nmul q4,q0,q1\ndiv q5,q0,q1\nhlt\n");
        assert_eq!(vm.registers.get(Register::gpr(2, crate::register::View::Qword)).as_u64(), 25);
        assert_eq!(vm.registers.get(Register::gpr(3, crate::register::View::Qword)).as_u64(), 15);
        assert_eq!(vm.registers.get(Register::gpr(4, crate::register::View::Qword)).as_u64(), 100);
        assert_eq!(vm.registers.get(Register::gpr(5, crate::register::View::Qword)).as_u64(), 4);
    }

    #[test]
    fn forward_jump_scenario() {
        let vm = run_program("jmp skip\nmov q0,1\nskip: mov q0,2\nhlt\n");
        assert_eq!(vm.registers.get(Register::gpr(0, crate::register::View::Qword)).as_u64(), 2);
    }

    #[test]
    fn stack_push_pop_round_trips_sp() {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "mov q0,42\npush qword q0\nmov q0,0\npop qword q0\nhlt\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let image = assemble(&stmts, &interner).unwrap();
        let mut vm = Vm::new(&image, 4096).unwrap();
        let initial_sp = vm.registers.sp();
        vm.run().unwrap();
        assert_eq!(vm.registers.get(Register::gpr(0, crate::register::View::Qword)).as_u64(), 42);
        assert_eq!(vm.registers.sp(), initial_sp);
    }

    #[test]
    fn cmp_sets_eq_and_lt() {
        let vm = run_program("mov q0,3\nmov q1,5\ncmp q0,q1\nhlt\n");
        assert!(!vm.flags.eq);
        assert!(vm.flags.lt);
    }

    #[test]
    fn jgt_does_not_fire_on_equal_operands() {
        let vm = run_program("mov q0,5\nmov q1,5\ncmp q0,q1\njgt taken\nmov q2,1\nhlt\ntaken: mov q2,2\nhlt\n");
        assert_eq!(vm.registers.get(Register::gpr(2, crate::register::View::Qword)).as_u64(), 1);
    }

    #[test]
    fn jgt_fires_when_strictly_greater() {
        let vm = run_program("mov q0,9\nmov q1,5\ncmp q0,q1\njgt taken\nmov q2,1\nhlt\ntaken: mov q2,2\nhlt\n");
        assert_eq!(vm.registers.get(Register::gpr(2, crate::register::View::Qword)).as_u64(), 2);
    }

    #[test]
    fn invalid_opcode_past_the_last_defined_one_errors() {
        let image_with_bad_opcode = {
            let mut bytes = vec![0u8; 8];
            bytes.push(0xFF);
            bytes
        };
        let mut vm = Vm::new(&image_with_bad_opcode, 64).unwrap();
        assert!(matches!(vm.step(), Err(RuntimeError::InvalidOpcode(0xFF))));
    }

    #[test]
    fn image_shorter_than_header_is_rejected() {
        assert!(Vm::new(&[1, 2, 3], 64).is_err());
    }
}
