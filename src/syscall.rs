//! The syscall index → native function table (§4.6, §6 ABI).
//!
//! Argument passing is by convention over general registers; this table
//! only knows the index → behavior mapping, not how a program populates
//! its inputs.

use std::io::{Read, Write};

use tracing::debug;

use crate::error::RuntimeError;
use crate::immediate::Immediate;
use crate::register::{Register, View};
use crate::vm::Vm;

const OPEN: u64 = 0x00;
const CLOSE: u64 = 0x01;
const READ: u64 = 0x02;
const WRITE: u64 = 0x03;
const MALLOC: u64 = 0x04;
const FREE: u64 = 0x05;
const EXIT: u64 = 0xFF;

fn reg(bank: u8, view: View) -> Register {
    Register::gpr(bank, view)
}

/// The fixed syscall table. Holds no state of its own; every effect reads
/// and writes through the VM's registers and memory.
#[derive(Debug, Default)]
pub struct SyscallTable;

impl SyscallTable {
    pub fn new() -> Self {
        Self
    }

    pub fn dispatch(&self, index: u64, vm: &mut Vm) -> Result<(), RuntimeError> {
        debug!(index, "syscall");
        match index {
            OPEN => self.open(vm),
            CLOSE => self.close(vm),
            READ => self.read(vm),
            WRITE => self.write(vm),
            MALLOC => self.malloc(vm),
            FREE => self.free(vm),
            EXIT => self.exit(vm),
            other => Err(RuntimeError::UnknownSyscall(other)),
        }
    }

    fn open(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        // Path resolution against the host filesystem is an external
        // collaborator concern; this table only fills in the ABI shape.
        let _path_ptr = vm.registers.get(reg(0, View::Qword)).as_u64();
        let _flags = vm.registers.get(reg(1, View::Dword)).as_u64();
        let _mode = vm.registers.get(reg(2, View::Word)).as_u64();
        vm.registers.set(reg(0, View::Qword), &Immediate::Qword(u64::MAX));
        Ok(())
    }

    fn close(&self, _vm: &mut Vm) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn read(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let fd = vm.registers.get(reg(0, View::Dword)).as_u64();
        let addr = vm.registers.get(reg(1, View::Qword)).as_u64() as usize;
        let count = vm.registers.get(reg(2, View::Qword)).as_u64() as usize;

        let mut buf = vec![0u8; count];
        let read = if fd == 0 {
            std::io::stdin().read(&mut buf).unwrap_or(0)
        } else {
            0
        };
        vm.mmu.write_slice(addr, &buf[..read])?;
        vm.registers.set(reg(0, View::Qword), &Immediate::Qword(read as u64));
        Ok(())
    }

    fn write(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let fd = vm.registers.get(reg(0, View::Dword)).as_u64();
        let addr = vm.registers.get(reg(1, View::Qword)).as_u64() as usize;
        let count = vm.registers.get(reg(2, View::Qword)).as_u64() as usize;

        let bytes = vm.mmu.read_slice(addr, addr + count)?;
        let written = if fd == 1 {
            std::io::stdout().write_all(&bytes).map(|_| bytes.len()).unwrap_or(0)
        } else if fd == 2 {
            std::io::stderr().write_all(&bytes).map(|_| bytes.len()).unwrap_or(0)
        } else {
            0
        };
        vm.registers.set(reg(0, View::Qword), &Immediate::Qword(written as u64));
        Ok(())
    }

    fn malloc(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let size = vm.registers.get(reg(0, View::Qword)).as_u64() as usize;
        let base = vm.mmu.add_block("heap", size);
        vm.registers.set(reg(0, View::Qword), &Immediate::Qword(base as u64));
        Ok(())
    }

    fn free(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let addr = vm.registers.get(reg(0, View::Qword)).as_u64() as usize;
        if vm.mmu.free_block_at(addr) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidFreeAddress(addr))
        }
    }

    fn exit(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let status = vm.registers.get(reg(0, View::Byte)).as_u64() as i32;
        std::process::exit(status);
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
    fn unknown_syscall_index_is_an_error() {
        let mut interner = Interner::new();
        let tokens = tokenize(Id(0), "mov q15,200\nsyscall\nhlt\n").unwrap();
        let stmts = parse(&tokens, &mut interner).unwrap();
        let image = assemble(&stmts, &interner).unwrap();
        let mut vm = Vm::new(&image, 4096).unwrap();
        assert!(matches!(vm.run(), Err(RuntimeError::UnknownSyscall(200))));
    }

    #[test]
    fn malloc_then_free_round_trips_through_the_mmu() {
        let vm = run_program("mov q15,4\nmov q0,16\nsyscall\nmov q15,5\nsyscall\nhlt\n");
        assert_eq!(vm.registers.sp(), 4096);
    }

    #[test]
    fn write_to_stdout_reports_bytes_written() {
        let vm = run_program(
            ".section data\nmsg: db \"hi\", 0x0a\n.section text\n_start: mov q15,3\nmov d0,1\nmov q1,msg\nmov q2,3\nsyscall\nhlt\n",
        );
        assert_eq!(vm.registers.get(Register::gpr(0, View::Qword)).as_u64(), 3);
    }
}
