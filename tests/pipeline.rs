//! Full source -> image -> execution round trips (spec §8 concrete scenarios).

use nyx::prelude::*;

fn build(source: &str) -> Vec<u8> {
    let mut interner = Interner::new();
    let file = interner.intern("test.nyx");
    let tokens = tokenize(file, source).unwrap();
    let stmts = parse(&tokens, &mut interner).unwrap();

    let fs = RealFs;
    let include_paths = Vec::new();
    let mut preprocessor = Preprocessor::new(&fs, &include_paths, &mut interner);
    let stmts = preprocessor.run(stmts).unwrap();

    assemble(&stmts, &interner).unwrap()
}

fn run(source: &str) -> Vm {
    let image = build(source);
    let mut vm = Vm::new(&image, 4096).unwrap();
    vm.run().unwrap();
    vm
}

fn q(vm: &Vm, bank: u8) -> u64 {
    vm.registers.get(Register::gpr(bank, nyx::register::View::Qword)).as_u64()
}

#[test]
fn hello_world_writes_fourteen_bytes_to_stdout() {
    let vm = run(
        ".section text\n\
         _start: mov q0,1\n\
         mov q1,message\n\
         mov q2,14\n\
         mov q15,3\n\
         syscall\n\
         hlt\n\
         .section data\n\
         message: db \"Hello, world!\\n\", 0x00\n",
    );
    assert_eq!(q(&vm, 0), 14);
    assert!(vm.is_halted());
}

#[test]
fn arithmetic_scenario_matches_expected_registers() {
    let vm = run("mov q0,20\nmov q1,5\nadd q2,q0,q1\nsub q3,q0,q1\nmul q4,q0,q1\ndiv q5,q0,q1\nhlt\n");
    assert_eq!(q(&vm, 2), 25);
    assert_eq!(q(&vm, 3), 15);
    assert_eq!(q(&vm, 4), 100);
    assert_eq!(q(&vm, 5), 4);
}

#[test]
fn forward_jump_skips_the_first_assignment() {
    let vm = run("jmp skip\nmov q0,1\nskip: mov q0,2\nhlt\n");
    assert_eq!(q(&vm, 0), 2);
}

#[test]
fn conditional_preprocessing_with_define_takes_the_true_branch() {
    let vm = run("#define X\n#ifdef X\nmov q0,1\n#else\nmov q0,2\n#endif\nhlt\n");
    assert_eq!(q(&vm, 0), 1);
}

#[test]
fn conditional_preprocessing_without_define_takes_the_else_branch() {
    let vm = run("#ifdef X\nmov q0,1\n#else\nmov q0,2\n#endif\nhlt\n");
    assert_eq!(q(&vm, 0), 2);
}

#[test]
fn stack_push_pop_restores_sp_and_value() {
    let image = build("mov q0,42\npush qword q0\nmov q0,0\npop qword q0\nhlt\n");
    let mut vm = Vm::new(&image, 4096).unwrap();
    let initial_sp = vm.registers.sp();
    vm.run().unwrap();
    assert_eq!(q(&vm, 0), 42);
    assert_eq!(vm.registers.sp(), initial_sp);
}

#[test]
fn data_fixup_is_biased_by_text_length_at_an_exact_256_byte_boundary() {
    // text: `mov q1,msg` (10 bytes) + `hlt` (1 byte) + `resb 245` = 256 bytes.
    // data: `resb 128` then `msg: db 0x00`, so msg sits at data offset 128.
    // expected absolute address = text_len(256) + data_offset(128) = 384.
    let source = ".section text\n\
         _start: mov q1,msg\n\
         hlt\n\
         resb 245\n\
         .section data\n\
         resb 128\n\
         msg: db 0x00\n";
    let image = build(source);
    let patched = u64::from_le_bytes(image[10..18].try_into().unwrap());
    assert_eq!(patched, 384);
}

#[test]
fn extension_loader_reports_missing_symbol() {
    let image = build("hlt\n");
    let vm = Vm::new(&image, 64).unwrap();
    let mut scratch = Vm::new(&image, 64).unwrap();
    let result = vm.extensions.call("does_not_exist", &mut scratch);
    assert!(result.is_err());
}
